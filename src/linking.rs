use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Lookup material for the student-form course/tutor derivation.
/// Courses carry their known tutor (at most one); tutors carry the
/// course they own, if any.
#[derive(Debug, Clone, Default)]
pub struct LinkLookups {
    pub courses: HashMap<String, CourseRef>,
    pub tutors: HashMap<String, TutorRef>,
}

#[derive(Debug, Clone)]
pub struct CourseRef {
    pub id: String,
    pub name: String,
    pub parallel: String,
    pub tutor_id: Option<String>,
    pub tutor_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TutorRef {
    pub id: String,
    pub full_name: String,
    pub course_id: Option<String>,
}

/// Two-way course/tutor sync as a single pure function: given the field
/// the user just changed and the current form values, return the patch
/// of linked fields to apply. Invoked once per change event, with
/// equality guards so fields already holding the target value are left
/// out of the patch — a second invocation over the patched form returns
/// an empty patch, which is what makes the sync convergent.
pub fn derive_linked_fields(changed_field: &str, form: &Value, lookups: &LinkLookups) -> Value {
    let mut patch = Map::new();

    match changed_field {
        "courseId" => {
            let Some(course) = form
                .get("courseId")
                .and_then(|v| v.as_str())
                .and_then(|id| lookups.courses.get(id))
            else {
                return Value::Object(patch);
            };
            if let (Some(tutor_id), Some(tutor_name)) = (&course.tutor_id, &course.tutor_name) {
                let current = form.get("tutorId").and_then(|v| v.as_str());
                if current != Some(tutor_id.as_str()) {
                    patch.insert("tutorId".to_string(), json!(tutor_id));
                    patch.insert("tutorName".to_string(), json!(tutor_name));
                }
            }
        }
        "tutorId" => {
            let Some(tutor) = form
                .get("tutorId")
                .and_then(|v| v.as_str())
                .and_then(|id| lookups.tutors.get(id))
            else {
                return Value::Object(patch);
            };
            let Some(course) = tutor
                .course_id
                .as_ref()
                .and_then(|id| lookups.courses.get(id))
            else {
                return Value::Object(patch);
            };
            let current = form.get("courseId").and_then(|v| v.as_str());
            if current != Some(course.id.as_str()) {
                patch.insert("courseId".to_string(), json!(course.id));
                patch.insert("courseName".to_string(), json!(course.name));
                patch.insert("parallel".to_string(), json!(course.parallel));
            }
        }
        _ => {}
    }

    Value::Object(patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookups() -> LinkLookups {
        let mut courses = HashMap::new();
        courses.insert(
            "c-1".to_string(),
            CourseRef {
                id: "c-1".to_string(),
                name: "Octavo".to_string(),
                parallel: "B".to_string(),
                tutor_id: Some("t-1".to_string()),
                tutor_name: Some("Lucia Paredes".to_string()),
            },
        );
        courses.insert(
            "c-2".to_string(),
            CourseRef {
                id: "c-2".to_string(),
                name: "Noveno".to_string(),
                parallel: "A".to_string(),
                tutor_id: None,
                tutor_name: None,
            },
        );
        let mut tutors = HashMap::new();
        tutors.insert(
            "t-1".to_string(),
            TutorRef {
                id: "t-1".to_string(),
                full_name: "Lucia Paredes".to_string(),
                course_id: Some("c-1".to_string()),
            },
        );
        LinkLookups { courses, tutors }
    }

    #[test]
    fn selecting_course_fills_tutor() {
        let form = json!({ "courseId": "c-1" });
        let patch = derive_linked_fields("courseId", &form, &lookups());
        assert_eq!(patch.get("tutorId").and_then(|v| v.as_str()), Some("t-1"));
        assert_eq!(
            patch.get("tutorName").and_then(|v| v.as_str()),
            Some("Lucia Paredes")
        );
    }

    #[test]
    fn selecting_tutor_fills_course_pair() {
        let form = json!({ "tutorId": "t-1" });
        let patch = derive_linked_fields("tutorId", &form, &lookups());
        assert_eq!(patch.get("courseId").and_then(|v| v.as_str()), Some("c-1"));
        assert_eq!(
            patch.get("courseName").and_then(|v| v.as_str()),
            Some("Octavo")
        );
        assert_eq!(patch.get("parallel").and_then(|v| v.as_str()), Some("B"));
    }

    #[test]
    fn derivation_converges_after_one_application() {
        let form = json!({ "courseId": "c-1", "tutorId": "t-1" });
        let patch = derive_linked_fields("courseId", &form, &lookups());
        assert_eq!(patch, json!({}));
        let patch = derive_linked_fields("tutorId", &form, &lookups());
        assert_eq!(patch, json!({}));
    }

    #[test]
    fn course_without_tutor_patches_nothing() {
        let form = json!({ "courseId": "c-2" });
        let patch = derive_linked_fields("courseId", &form, &lookups());
        assert_eq!(patch, json!({}));
    }

    #[test]
    fn unrelated_field_patches_nothing() {
        let form = json!({ "fullName": "Ana", "courseId": "c-1" });
        let patch = derive_linked_fields("fullName", &form, &lookups());
        assert_eq!(patch, json!({}));
    }
}
