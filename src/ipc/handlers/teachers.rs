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
use crate::validate;

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "fullName": r.get::<_, String>(1)?,
        "cedula": r.get::<_, String>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "email": r.get::<_, Option<String>>(4)?,
        "isTutor": r.get::<_, i64>(5)? != 0,
        "tutorOfCourseId": r.get::<_, Option<String>>(6)?,
        "tutorCourseName": r.get::<_, Option<String>>(7)?,
        "tutorCourseParallel": r.get::<_, Option<String>>(8)?,
        "createdAt": r.get::<_, Option<String>>(9)?,
        "updatedAt": r.get::<_, Option<String>>(10)?,
    }))
}

const ROW_SELECT: &str = "SELECT t.id, t.full_name, t.cedula, t.phone, t.email, t.is_tutor,
                                 t.tutor_of_course_id, c.name, c.parallel,
                                 t.created_at, t.updated_at
                          FROM teachers t
                          LEFT JOIN courses c ON c.id = t.tutor_of_course_id";

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE t.id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "teachers"))
}

/// A course carries at most one tutor; assigning a second answers
/// `conflict` so the UI can point at the existing assignment.
fn ensure_course_unclaimed(
    conn: &Connection,
    course_id: &str,
    exclude_teacher: Option<&str>,
) -> Result<(), HandlerErr> {
    let holder: Option<String> = match exclude_teacher {
        Some(id) => conn
            .query_row(
                "SELECT full_name FROM teachers WHERE tutor_of_course_id = ? AND id != ?",
                (course_id, id),
                |r| r.get(0),
            )
            .optional(),
        None => conn
            .query_row(
                "SELECT full_name FROM teachers WHERE tutor_of_course_id = ?",
                [course_id],
                |r| r.get(0),
            )
            .optional(),
    }
    .map_err(db_err("db_query_failed", "teachers"))?;
    if let Some(name) = holder {
        return Err(HandlerErr::new(
            "conflict",
            format!("course already has a tutor: {}", name),
        ));
    }
    Ok(())
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tutors_only = get_opt_bool(params, "tutorsOnly").unwrap_or(false);
    let sql = if tutors_only {
        format!("{} WHERE t.is_tutor = 1 ORDER BY t.full_name", ROW_SELECT)
    } else {
        format!("{} ORDER BY t.full_name", ROW_SELECT)
    };

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "teachers"))?;
    let rows = stmt
        .query_map([], |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "teachers"))?;

    Ok(json!({ "teachers": rows }))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let full_name = get_required_str(params, "fullName")?;
    let cedula = get_required_str(params, "cedula")?;
    validate::validate_cedula(&cedula).map_err(|m| HandlerErr::validation("cedula", m))?;
    let phone = get_opt_str(params, "phone");
    if let Some(p) = &phone {
        validate::validate_phone(p).map_err(|m| HandlerErr::validation("phone", m))?;
    }
    let email = get_opt_str(params, "email");

    let tutor_of_course_id = get_opt_str(params, "tutorOfCourseId");
    if let Some(course_id) = &tutor_of_course_id {
        ensure_ref(conn, "tutorOfCourseId", "courses", "course", course_id)?;
        ensure_course_unclaimed(conn, course_id, None)?;
    }
    // Owning a course implies the tutor flag.
    let is_tutor = tutor_of_course_id.is_some() || get_opt_bool(params, "isTutor").unwrap_or(false);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, full_name, cedula, phone, email, is_tutor,
                              tutor_of_course_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &full_name,
            &cedula,
            phone.as_deref(),
            email.as_deref(),
            if is_tutor { 1 } else { 0 },
            tutor_of_course_id.as_deref(),
        ),
    )
    .map_err(db_err("db_insert_failed", "teachers"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("teachers", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "teacherId")?;
    let patch = get_patch(params)?;

    let current_course: Option<Option<String>> = conn
        .query_row(
            "SELECT tutor_of_course_id FROM teachers WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed", "teachers"))?;
    let Some(current_course) = current_course else {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    patch_str(patch, "fullName", "full_name", &mut set_parts, &mut binds)?;
    if let Some(cedula) = patch_str(patch, "cedula", "cedula", &mut set_parts, &mut binds)? {
        validate::validate_cedula(&cedula).map_err(|m| HandlerErr::validation("cedula", m))?;
    }
    if let Some(Some(phone)) =
        patch_nullable_str(patch, "phone", "phone", &mut set_parts, &mut binds)?
    {
        validate::validate_phone(&phone).map_err(|m| HandlerErr::validation("phone", m))?;
    }
    patch_nullable_str(patch, "email", "email", &mut set_parts, &mut binds)?;

    let touched_course = patch_nullable_str(
        patch,
        "tutorOfCourseId",
        "tutor_of_course_id",
        &mut set_parts,
        &mut binds,
    )?;
    let touched_is_tutor = patch_bool(patch, "isTutor", "is_tutor", &mut set_parts, &mut binds)?;

    // is_tutor stays consistent with tutor_of_course_id.
    let final_course = touched_course.clone().unwrap_or(current_course);
    if let Some(course_id) = &final_course {
        if touched_is_tutor == Some(false) {
            return Err(HandlerErr::validation(
                "isTutor",
                "isTutor cannot be false while the teacher tutors a course",
            ));
        }
        if matches!(&touched_course, Some(Some(_))) {
            ensure_ref(conn, "tutorOfCourseId", "courses", "course", course_id)?;
            ensure_course_unclaimed(conn, course_id, Some(&id))?;
            if touched_is_tutor.is_none() {
                set_parts.push("is_tutor = 1".into());
            }
        }
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE teachers SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(rusqlite::types::Value::Text(id.clone()));
    conn.execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "teachers"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("teachers", &row);
    Ok((row, vec![change]))
}

fn can_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "teacherId")?;
    let check =
        guards::can_delete_teacher(conn, &id).map_err(db_err("db_query_failed", "teachers"))?;
    Ok(serde_json::to_value(&check).unwrap_or_else(|_| json!({ "allowed": check.allowed })))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "teacherId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let check =
        guards::can_delete_teacher(&tx, &id).map_err(db_err("db_query_failed", "teachers"))?;
    if !check.allowed {
        return Err(delete_blocked(&check));
    }
    tx.execute("DELETE FROM teachers WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "teachers"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok((json!({ "ok": true }), vec![Change::delete("teachers", &row)]))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_conn(state, req, list)),
        "teachers.create" => Some(with_conn_mut(state, req, create)),
        "teachers.update" => Some(with_conn_mut(state, req, update)),
        "teachers.canDelete" => Some(with_conn(state, req, can_delete)),
        "teachers.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
