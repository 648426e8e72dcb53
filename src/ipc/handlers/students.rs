use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::guards;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    delete_blocked, ensure_ref, get_opt_bool, get_opt_str, get_patch, get_required_str,
    patch_bool, patch_nullable_str, patch_str, with_conn, with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::linking::{self, CourseRef, LinkLookups, TutorRef};
use crate::validate;

// The course pair and the people names ride along on every read so the
// roster and detail views render without a loop of follow-up gets.
const ROW_SELECT: &str = "SELECT s.id, s.full_name, s.cedula, s.birth_date,
                                 s.course_id, c.name, c.parallel,
                                 s.representative_id, r.full_name,
                                 s.tutor_id, t.full_name,
                                 s.active, s.created_at, s.updated_at
                          FROM students s
                          LEFT JOIN courses c ON c.id = s.course_id
                          LEFT JOIN representatives r ON r.id = s.representative_id
                          LEFT JOIN teachers t ON t.id = s.tutor_id";

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "fullName": r.get::<_, String>(1)?,
        "cedula": r.get::<_, String>(2)?,
        "birthDate": r.get::<_, Option<String>>(3)?,
        "courseId": r.get::<_, Option<String>>(4)?,
        "courseName": r.get::<_, Option<String>>(5)?,
        "parallel": r.get::<_, Option<String>>(6)?,
        "representativeId": r.get::<_, Option<String>>(7)?,
        "representativeName": r.get::<_, Option<String>>(8)?,
        "tutorId": r.get::<_, Option<String>>(9)?,
        "tutorName": r.get::<_, Option<String>>(10)?,
        "active": r.get::<_, i64>(11)? != 0,
        "createdAt": r.get::<_, Option<String>>(12)?,
        "updatedAt": r.get::<_, Option<String>>(13)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE s.id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "students"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(course_id) = get_opt_str(params, "courseId") {
        clauses.push(format!("s.course_id = ?{}", binds.len() + 1));
        binds.push(course_id);
    }
    if let Some(representative_id) = get_opt_str(params, "representativeId") {
        clauses.push(format!("s.representative_id = ?{}", binds.len() + 1));
        binds.push(representative_id);
    }
    if let Some(search) = get_opt_str(params, "search") {
        let n = binds.len() + 1;
        clauses.push(format!("(s.full_name LIKE ?{} OR s.cedula LIKE ?{})", n, n));
        binds.push(format!("%{}%", search));
    }

    let mut sql = ROW_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY s.full_name");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "students"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(&binds), |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "students"))?;

    Ok(json!({ "students": rows }))
}

fn get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    select_row(conn, &id)?.ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let full_name = get_required_str(params, "fullName")?;
    let cedula = get_required_str(params, "cedula")?;
    validate::validate_cedula(&cedula).map_err(|m| HandlerErr::validation("cedula", m))?;
    let birth_date = get_opt_str(params, "birthDate");
    if let Some(d) = &birth_date {
        validate::validate_date(d).map_err(|m| HandlerErr::validation("birthDate", m))?;
    }

    let course_id = get_opt_str(params, "courseId");
    if let Some(c) = &course_id {
        ensure_ref(conn, "courseId", "courses", "course", c)?;
    }
    let representative_id = get_opt_str(params, "representativeId");
    if let Some(r) = &representative_id {
        ensure_ref(conn, "representativeId", "representatives", "representative", r)?;
    }
    let tutor_id = get_opt_str(params, "tutorId");
    if let Some(t) = &tutor_id {
        ensure_ref(conn, "tutorId", "teachers", "teacher", t)?;
    }
    let active = get_opt_bool(params, "active").unwrap_or(true);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, full_name, cedula, birth_date, course_id,
                              representative_id, tutor_id, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &full_name,
            &cedula,
            birth_date.as_deref(),
            course_id.as_deref(),
            representative_id.as_deref(),
            tutor_id.as_deref(),
            if active { 1 } else { 0 },
        ),
    )
    .map_err(db_err("db_insert_failed", "students"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("students", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    patch_str(patch, "fullName", "full_name", &mut set_parts, &mut binds)?;
    if let Some(cedula) = patch_str(patch, "cedula", "cedula", &mut set_parts, &mut binds)? {
        validate::validate_cedula(&cedula).map_err(|m| HandlerErr::validation("cedula", m))?;
    }
    if let Some(Some(d)) =
        patch_nullable_str(patch, "birthDate", "birth_date", &mut set_parts, &mut binds)?
    {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("birthDate", m))?;
    }
    if let Some(Some(c)) =
        patch_nullable_str(patch, "courseId", "course_id", &mut set_parts, &mut binds)?
    {
        ensure_ref(conn, "courseId", "courses", "course", &c)?;
    }
    if let Some(Some(r)) = patch_nullable_str(
        patch,
        "representativeId",
        "representative_id",
        &mut set_parts,
        &mut binds,
    )? {
        ensure_ref(conn, "representativeId", "representatives", "representative", &r)?;
    }
    if let Some(Some(t)) =
        patch_nullable_str(patch, "tutorId", "tutor_id", &mut set_parts, &mut binds)?
    {
        ensure_ref(conn, "tutorId", "teachers", "teacher", &t)?;
    }
    patch_bool(patch, "active", "active", &mut set_parts, &mut binds)?;

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(rusqlite::types::Value::Text(id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "students"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("students", &row);
    Ok((row, vec![change]))
}

fn can_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    let check =
        guards::can_delete_student(conn, &id).map_err(db_err("db_query_failed", "students"))?;
    Ok(serde_json::to_value(&check).unwrap_or_else(|_| json!({ "allowed": check.allowed })))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "studentId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let check =
        guards::can_delete_student(&tx, &id).map_err(db_err("db_query_failed", "students"))?;
    if !check.allowed {
        return Err(delete_blocked(&check));
    }
    tx.execute("DELETE FROM students WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "students"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok((json!({ "ok": true }), vec![Change::delete("students", &row)]))
}

fn load_link_lookups(conn: &Connection) -> Result<LinkLookups, HandlerErr> {
    let mut lookups = LinkLookups::default();
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.parallel, t.id, t.full_name
             FROM courses c
             LEFT JOIN teachers t ON t.tutor_of_course_id = c.id",
        )
        .map_err(db_err("db_query_failed", "courses"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "courses"))?;

    for (course_id, name, parallel, tutor_id, tutor_name) in rows {
        if let (Some(tid), Some(tname)) = (&tutor_id, &tutor_name) {
            lookups.tutors.insert(
                tid.clone(),
                TutorRef {
                    id: tid.clone(),
                    full_name: tname.clone(),
                    course_id: Some(course_id.clone()),
                },
            );
        }
        lookups.courses.insert(
            course_id.clone(),
            CourseRef {
                id: course_id,
                name,
                parallel,
                tutor_id,
                tutor_name,
            },
        );
    }
    Ok(lookups)
}

/// Student-form course/tutor sync; the UI calls this once per change
/// event and applies whatever patch comes back.
fn derive_linked_fields(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let changed_field = get_required_str(params, "changedField")?;
    let Some(form) = params.get("form").filter(|v| v.is_object()) else {
        return Err(HandlerErr::new("bad_params", "missing/invalid form"));
    };

    let lookups = load_link_lookups(conn)?;
    let patch = linking::derive_linked_fields(&changed_field, form, &lookups);
    Ok(json!({ "patch": patch }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, list)),
        "students.get" => Some(with_conn(state, req, get)),
        "students.create" => Some(with_conn_mut(state, req, create)),
        "students.update" => Some(with_conn_mut(state, req, update)),
        "students.canDelete" => Some(with_conn(state, req, can_delete)),
        "students.delete" => Some(with_conn_mut(state, req, delete)),
        "students.deriveLinkedFields" => Some(with_conn(state, req, derive_linked_fields)),
        _ => None,
    }
}
