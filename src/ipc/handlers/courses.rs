use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::guards;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    delete_blocked, ensure_one_of, get_patch, get_required_str, patch_str, with_conn,
    with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};

const JORNADAS: [&str; 3] = ["matutina", "vespertina", "nocturna"];

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "parallel": r.get::<_, String>(2)?,
        "jornada": r.get::<_, String>(3)?,
        "createdAt": r.get::<_, Option<String>>(4)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, parallel, jornada, created_at FROM courses WHERE id = ?",
        [id],
        |r| row_from(r),
    )
    .optional()
    .map_err(db_err("db_query_failed", "courses"))
}

/// Course identity is the (name, parallel) pair; the UNIQUE constraint
/// backs this check, but we answer `conflict` with a readable message
/// instead of surfacing the constraint error.
fn pair_taken(
    conn: &Connection,
    name: &str,
    parallel: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let found: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM courses WHERE name = ? AND parallel = ? AND id != ?",
                (name, parallel, id),
                |r| r.get(0),
            )
            .optional(),
        None => conn
            .query_row(
                "SELECT 1 FROM courses WHERE name = ? AND parallel = ?",
                (name, parallel),
                |r| r.get(0),
            )
            .optional(),
    }
    .map_err(db_err("db_query_failed", "courses"))?;
    Ok(found.is_some())
}

fn list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.parallel, c.jornada, c.created_at,
                    (SELECT COUNT(*) FROM students s WHERE s.course_id = c.id) AS student_count,
                    t.id, t.full_name
             FROM courses c
             LEFT JOIN teachers t ON t.tutor_of_course_id = c.id
             ORDER BY c.name, c.parallel",
        )
        .map_err(db_err("db_query_failed", "courses"))?;

    let rows = stmt
        .query_map([], |r| {
            let mut row = row_from(r)?;
            row["studentCount"] = json!(r.get::<_, i64>(5)?);
            row["tutorId"] = json!(r.get::<_, Option<String>>(6)?);
            row["tutorName"] = json!(r.get::<_, Option<String>>(7)?);
            Ok(row)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "courses"))?;

    Ok(json!({ "courses": rows }))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let name = get_required_str(params, "name")?;
    let parallel = get_required_str(params, "parallel")?;
    let jornada = get_required_str(params, "jornada")?;
    ensure_one_of("jornada", &jornada, &JORNADAS)?;

    if pair_taken(conn, &name, &parallel, None)? {
        return Err(HandlerErr::new(
            "conflict",
            format!("course {} {} already exists", name, parallel),
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, parallel, jornada, created_at)
         VALUES(?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &name, &parallel, &jornada),
    )
    .map_err(db_err("db_insert_failed", "courses"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("courses", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "courseId")?;
    let patch = get_patch(params)?;

    let current: Option<(String, String)> = conn
        .query_row("SELECT name, parallel FROM courses WHERE id = ?", [&id], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()
        .map_err(db_err("db_query_failed", "courses"))?;
    let Some((current_name, current_parallel)) = current else {
        return Err(HandlerErr::new("not_found", "course not found"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    let new_name = patch_str(patch, "name", "name", &mut set_parts, &mut binds)?;
    let new_parallel = patch_str(patch, "parallel", "parallel", &mut set_parts, &mut binds)?;
    if let Some(jornada) = patch_str(patch, "jornada", "jornada", &mut set_parts, &mut binds)? {
        ensure_one_of("jornada", &jornada, &JORNADAS)?;
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }

    if new_name.is_some() || new_parallel.is_some() {
        let target_name = new_name.as_deref().unwrap_or(&current_name);
        let target_parallel = new_parallel.as_deref().unwrap_or(&current_parallel);
        if pair_taken(conn, target_name, target_parallel, Some(&id))? {
            return Err(HandlerErr::new(
                "conflict",
                format!("course {} {} already exists", target_name, target_parallel),
            ));
        }
    }

    let sql = format!("UPDATE courses SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(rusqlite::types::Value::Text(id.clone()));
    conn.execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "courses"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("courses", &row);
    Ok((row, vec![change]))
}

fn can_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "courseId")?;
    let check =
        guards::can_delete_course(conn, &id).map_err(db_err("db_query_failed", "courses"))?;
    Ok(serde_json::to_value(&check).unwrap_or_else(|_| json!({ "allowed": check.allowed })))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "courseId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "course not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let check =
        guards::can_delete_course(&tx, &id).map_err(db_err("db_query_failed", "courses"))?;
    if !check.allowed {
        return Err(delete_blocked(&check));
    }
    tx.execute("DELETE FROM courses WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "courses"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok((json!({ "ok": true }), vec![Change::delete("courses", &row)]))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(with_conn(state, req, list)),
        "courses.create" => Some(with_conn_mut(state, req, create)),
        "courses.update" => Some(with_conn_mut(state, req, update)),
        "courses.canDelete" => Some(with_conn(state, req, can_delete)),
        "courses.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
