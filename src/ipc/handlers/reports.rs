use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{get_required_str, parse_json_array, with_conn};
use crate::ipc::types::{AppState, Request};

const STATUS_KEYS: [&str; 3] = ["active", "closed", "transferred"];
const CATEGORY_KEYS: [&str; 7] = [
    "academic",
    "behavioral",
    "emotional",
    "family",
    "sexual_violence",
    "pregnancy",
    "other",
];
const PRIORITY_KEYS: [&str; 3] = ["high", "medium", "low"];

/// Optional year scope, accepted as "2025" or 2025.
fn year_param(params: &Value) -> Result<Option<String>, HandlerErr> {
    let Some(v) = params.get("year") else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let year = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    if year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()) {
        return Ok(Some(year));
    }
    Err(HandlerErr::validation(
        "year",
        "year must be a four-digit year",
    ))
}

/// GROUP BY counts over case_files, seeded with zeros so every closed
/// vocabulary key shows up even when no rows match.
fn case_counts_by(
    conn: &Connection,
    column: &str,
    year: &Option<String>,
    keys: &[&str],
) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for key in keys {
        out.insert((*key).to_string(), json!(0));
    }

    let sql = match year {
        Some(_) => format!(
            "SELECT {col}, COUNT(*) FROM case_files
             WHERE substr(opening_date, 1, 4) = ?1 GROUP BY {col}",
            col = column
        ),
        None => format!(
            "SELECT {col}, COUNT(*) FROM case_files GROUP BY {col}",
            col = column
        ),
    };
    let binds: Vec<&String> = year.iter().collect();
    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "case_files"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "case_files"))?;
    for (key, count) in rows {
        out.insert(key, json!(count));
    }
    Ok(Value::Object(out))
}

fn case_statistics(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year = year_param(params)?;

    let by_status = case_counts_by(conn, "status", &year, &STATUS_KEYS)?;
    let by_category = case_counts_by(conn, "category", &year, &CATEGORY_KEYS)?;
    let by_priority = case_counts_by(conn, "priority", &year, &PRIORITY_KEYS)?;

    let total_sql = match &year {
        Some(_) => "SELECT COUNT(*) FROM case_files WHERE substr(opening_date, 1, 4) = ?1",
        None => "SELECT COUNT(*) FROM case_files",
    };
    let binds: Vec<&String> = year.iter().collect();
    let total_cases: i64 = conn
        .query_row(total_sql, rusqlite::params_from_iter(binds.clone()), |r| {
            r.get(0)
        })
        .map_err(db_err("db_query_failed", "case_files"))?;

    // Only is_effective follow-ups count toward the effective total.
    let follow_up_sql = match &year {
        Some(_) => {
            "SELECT COUNT(*), COALESCE(SUM(f.is_effective), 0)
             FROM follow_ups f JOIN case_files cf ON cf.id = f.case_id
             WHERE substr(cf.opening_date, 1, 4) = ?1"
        }
        None => {
            "SELECT COUNT(*), COALESCE(SUM(f.is_effective), 0)
             FROM follow_ups f JOIN case_files cf ON cf.id = f.case_id"
        }
    };
    let (total_follow_ups, effective_follow_ups): (i64, i64) = conn
        .query_row(follow_up_sql, rusqlite::params_from_iter(binds), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .map_err(db_err("db_query_failed", "follow_ups"))?;

    Ok(json!({
        "year": year,
        "totalCases": total_cases,
        "byStatus": by_status,
        "byCategory": by_category,
        "byPriority": by_priority,
        "followUps": {
            "total": total_follow_ups,
            "effective": effective_follow_ups,
        },
    }))
}

fn student_profile_model(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let student: Option<Value> = conn
        .query_row(
            "SELECT s.id, s.full_name, s.cedula, s.birth_date, s.active,
                    r.id, r.full_name, r.cedula, r.phone,
                    c.id, c.name, c.parallel, c.jornada,
                    t.id, t.full_name
             FROM students s
             LEFT JOIN representatives r ON r.id = s.representative_id
             LEFT JOIN courses c ON c.id = s.course_id
             LEFT JOIN teachers t ON t.id = s.tutor_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                let representative = match r.get::<_, Option<String>>(5)? {
                    Some(rid) => json!({
                        "id": rid,
                        "fullName": r.get::<_, Option<String>>(6)?,
                        "cedula": r.get::<_, Option<String>>(7)?,
                        "phone": r.get::<_, Option<String>>(8)?,
                    }),
                    None => Value::Null,
                };
                let course = match r.get::<_, Option<String>>(9)? {
                    Some(cid) => json!({
                        "id": cid,
                        "name": r.get::<_, Option<String>>(10)?,
                        "parallel": r.get::<_, Option<String>>(11)?,
                        "jornada": r.get::<_, Option<String>>(12)?,
                    }),
                    None => Value::Null,
                };
                let tutor = match r.get::<_, Option<String>>(13)? {
                    Some(tid) => json!({
                        "id": tid,
                        "fullName": r.get::<_, Option<String>>(14)?,
                    }),
                    None => Value::Null,
                };
                Ok(json!({
                    "student": {
                        "id": r.get::<_, String>(0)?,
                        "fullName": r.get::<_, String>(1)?,
                        "cedula": r.get::<_, String>(2)?,
                        "birthDate": r.get::<_, Option<String>>(3)?,
                        "active": r.get::<_, i64>(4)? != 0,
                    },
                    "representative": representative,
                    "course": course,
                    "tutor": tutor,
                }))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed", "students"))?;
    let Some(mut model) = student else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT cf.id, cf.code, cf.category, cf.priority, cf.status, cf.opening_date,
                    (SELECT COUNT(*) FROM follow_ups f WHERE f.case_id = cf.id),
                    (SELECT COUNT(*) FROM follow_ups f
                     WHERE f.case_id = cf.id AND f.is_effective = 1)
             FROM case_files cf
             WHERE cf.student_id = ?
             ORDER BY cf.opening_date DESC, cf.code DESC",
        )
        .map_err(db_err("db_query_failed", "case_files"))?;
    let cases = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "category": r.get::<_, String>(2)?,
                "priority": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "openingDate": r.get::<_, String>(5)?,
                "followUpCount": r.get::<_, i64>(6)?,
                "effectiveFollowUpCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "case_files"))?;

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.date, a.start_time, a.end_time, a.status, a.reason, cf.code
             FROM appointments a
             LEFT JOIN case_files cf ON cf.id = a.case_id
             WHERE a.student_id = ?
             ORDER BY a.date DESC, a.start_time DESC",
        )
        .map_err(db_err("db_query_failed", "appointments"))?;
    let appointments = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "startTime": r.get::<_, String>(2)?,
                "endTime": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "reason": r.get::<_, Option<String>>(5)?,
                "caseCode": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "appointments"))?;

    if let Some(obj) = model.as_object_mut() {
        obj.insert("cases".to_string(), json!(cases));
        obj.insert("appointments".to_string(), json!(appointments));
    }
    Ok(model)
}

fn activity_summary_model(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year = year_param(params)?;

    let sql = match &year {
        Some(_) => {
            "SELECT id, topic, date, end_date, audience,
                    attendees_male, attendees_female, attendees_staff, attendees_parents
             FROM preventive_activities
             WHERE is_executed = 1 AND substr(date, 1, 4) = ?1
             ORDER BY date"
        }
        None => {
            "SELECT id, topic, date, end_date, audience,
                    attendees_male, attendees_female, attendees_staff, attendees_parents
             FROM preventive_activities
             WHERE is_executed = 1
             ORDER BY date"
        }
    };
    let binds: Vec<&String> = year.iter().collect();
    let mut stmt = conn
        .prepare(sql)
        .map_err(db_err("db_query_failed", "preventive_activities"))?;
    let activities = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let audience: String = r.get(4)?;
            let male: i64 = r.get(5)?;
            let female: i64 = r.get(6)?;
            let staff: i64 = r.get(7)?;
            let parents: i64 = r.get(8)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "topic": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "audience": parse_json_array(&audience),
                "attendeesMale": male,
                "attendeesFemale": female,
                "attendeesStaff": staff,
                "attendeesParents": parents,
                "totalAttendees": male + female + staff + parents,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "preventive_activities"))?;

    let sum = |key: &str| -> i64 {
        activities
            .iter()
            .filter_map(|a| a.get(key).and_then(|v| v.as_i64()))
            .sum()
    };
    let male = sum("attendeesMale");
    let female = sum("attendeesFemale");
    let staff = sum("attendeesStaff");
    let parents = sum("attendeesParents");

    Ok(json!({
        "year": year,
        "totalActivities": activities.len(),
        "attendees": {
            "male": male,
            "female": female,
            "staff": staff,
            "parents": parents,
            "total": male + female + staff + parents,
        },
        "activities": activities,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.caseStatistics" => Some(with_conn(state, req, case_statistics)),
        "reports.studentProfileModel" => Some(with_conn(state, req, student_profile_model)),
        "reports.activitySummaryModel" => Some(with_conn(state, req, activity_summary_model)),
        _ => None,
    }
}
