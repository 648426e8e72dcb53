use rusqlite::Connection;
use serde::Serialize;

/// Answer shape for every `*.canDelete` method. Delete handlers run the
/// same check again inside the delete transaction, so the answer a
/// client saw and the delete outcome can only diverge if another write
/// landed in between.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_count: Option<i64>,
}

impl DeleteCheck {
    pub fn allowed() -> Self {
        DeleteCheck {
            allowed: true,
            reason: None,
            blocking_count: None,
        }
    }

    pub fn blocked(reason: impl Into<String>, blocking_count: i64) -> Self {
        DeleteCheck {
            allowed: false,
            reason: Some(reason.into()),
            blocking_count: Some(blocking_count),
        }
    }
}

fn count(conn: &Connection, sql: &str, id: &str) -> rusqlite::Result<i64> {
    conn.query_row(sql, [id], |r| r.get(0))
}

pub fn can_delete_representative(conn: &Connection, id: &str) -> rusqlite::Result<DeleteCheck> {
    let students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE representative_id = ?",
        id,
    )?;
    if students > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} student(s) reference this representative", students),
            students,
        ));
    }
    Ok(DeleteCheck::allowed())
}

/// Checks run in declaration order and the first hit wins, so a teacher
/// who both tutors a course and is listed on students reports the
/// course tutorship.
pub fn can_delete_teacher(conn: &Connection, id: &str) -> rusqlite::Result<DeleteCheck> {
    let courses = count(
        conn,
        "SELECT COUNT(*) FROM teachers WHERE id = ? AND tutor_of_course_id IS NOT NULL",
        id,
    )?;
    if courses > 0 {
        return Ok(DeleteCheck::blocked(
            "teacher is the tutor of a course",
            courses,
        ));
    }
    let students = count(conn, "SELECT COUNT(*) FROM students WHERE tutor_id = ?", id)?;
    if students > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} student(s) have this teacher as tutor", students),
            students,
        ));
    }
    Ok(DeleteCheck::allowed())
}

pub fn can_delete_course(conn: &Connection, id: &str) -> rusqlite::Result<DeleteCheck> {
    let students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE course_id = ?",
        id,
    )?;
    if students > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} student(s) are enrolled in this course", students),
            students,
        ));
    }
    let teachers = count(
        conn,
        "SELECT COUNT(*) FROM teachers WHERE tutor_of_course_id = ?",
        id,
    )?;
    if teachers > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} teacher(s) tutor this course", teachers),
            teachers,
        ));
    }
    Ok(DeleteCheck::allowed())
}

pub fn can_delete_student(conn: &Connection, id: &str) -> rusqlite::Result<DeleteCheck> {
    let cases = count(
        conn,
        "SELECT COUNT(*) FROM case_files WHERE student_id = ?",
        id,
    )?;
    if cases > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} case file(s) reference this student", cases),
            cases,
        ));
    }
    let pregnancies = count(
        conn,
        "SELECT COUNT(*) FROM pregnancy_cases WHERE student_id = ?",
        id,
    )?;
    if pregnancies > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} pregnancy record(s) reference this student", pregnancies),
            pregnancies,
        ));
    }
    let appointments = count(
        conn,
        "SELECT COUNT(*) FROM appointments
         WHERE student_id = ?1 OR (attendee_type = 'student' AND attendee_id = ?1)",
        id,
    )?;
    if appointments > 0 {
        return Ok(DeleteCheck::blocked(
            format!("{} appointment(s) reference this student", appointments),
            appointments,
        ));
    }
    Ok(DeleteCheck::allowed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let dir = std::env::temp_dir().join(format!("deced-guards-{}", uuid::Uuid::new_v4()));
        db::open_db(&dir).expect("open test db")
    }

    #[test]
    fn representative_with_students_is_blocked() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO representatives(id, full_name, cedula) VALUES('r1', 'Maria', '0912345678')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO students(id, full_name, cedula, representative_id) \
             VALUES('s1', 'Ana', '0987654321', 'r1')",
            [],
        )
        .unwrap();

        let check = can_delete_representative(&conn, "r1").unwrap();
        assert!(!check.allowed);
        assert_eq!(check.blocking_count, Some(1));

        conn.execute("DELETE FROM students WHERE id = 's1'", []).unwrap();
        let check = can_delete_representative(&conn, "r1").unwrap();
        assert_eq!(check, DeleteCheck::allowed());
    }

    #[test]
    fn teacher_course_tutorship_wins_over_student_links() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO courses(id, name, parallel, jornada) VALUES('c1', 'Octavo', 'A', 'matutina')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO teachers(id, full_name, cedula, is_tutor, tutor_of_course_id) \
             VALUES('t1', 'Lucia', '0911111111', 1, 'c1')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO students(id, full_name, cedula, tutor_id) \
             VALUES('s1', 'Ana', '0922222222', 't1')",
            [],
        )
        .unwrap();

        let check = can_delete_teacher(&conn, "t1").unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason.as_deref(), Some("teacher is the tutor of a course"));

        // Drop the tutorship; the student link now reports instead.
        conn.execute(
            "UPDATE teachers SET tutor_of_course_id = NULL, is_tutor = 0 WHERE id = 't1'",
            [],
        )
        .unwrap();
        let check = can_delete_teacher(&conn, "t1").unwrap();
        assert!(!check.allowed);
        assert_eq!(check.blocking_count, Some(1));
        assert!(check.reason.unwrap().contains("tutor"));
    }

    #[test]
    fn course_guard_reports_students_before_teachers() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO courses(id, name, parallel, jornada) VALUES('c1', 'Noveno', 'B', 'matutina')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO teachers(id, full_name, cedula, is_tutor, tutor_of_course_id) \
             VALUES('t1', 'Lucia', '0911111111', 1, 'c1')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO students(id, full_name, cedula, course_id) \
             VALUES('s1', 'Ana', '0922222222', 'c1')",
            [],
        )
        .unwrap();

        let check = can_delete_course(&conn, "c1").unwrap();
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("enrolled"));

        conn.execute("DELETE FROM students WHERE id = 's1'", []).unwrap();
        let check = can_delete_course(&conn, "c1").unwrap();
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("tutor"));
    }

    #[test]
    fn student_guard_counts_attendee_appointments() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO students(id, full_name, cedula) VALUES('s1', 'Ana', '0922222222')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO appointments(id, date, start_time, end_time, attendee_type, attendee_id, status) \
             VALUES('a1', '2025-03-10', '09:00', '09:30', 'student', 's1', 'scheduled')",
            [],
        )
        .unwrap();

        let check = can_delete_student(&conn, "s1").unwrap();
        assert!(!check.allowed);
        assert_eq!(check.blocking_count, Some(1));
    }
}
