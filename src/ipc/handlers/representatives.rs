use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::guards;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    delete_blocked, get_opt_str, get_patch, get_required_str, patch_nullable_str, patch_str,
    with_conn, with_conn_mut,
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
        "address": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, Option<String>>(5)?,
        "updatedAt": r.get::<_, Option<String>>(6)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, full_name, cedula, phone, address, created_at, updated_at
         FROM representatives WHERE id = ?",
        [id],
        |r| row_from(r),
    )
    .optional()
    .map_err(db_err("db_query_failed", "representatives"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let search = get_opt_str(params, "search");

    // Dependent-student counts ride along so the list view can flag
    // which rows a delete would be refused for.
    let base = "SELECT r.id, r.full_name, r.cedula, r.phone, r.address,
                       r.created_at, r.updated_at,
                       (SELECT COUNT(*) FROM students s
                        WHERE s.representative_id = r.id) AS student_count
                FROM representatives r";
    let (sql, pattern) = match &search {
        Some(term) => (
            format!(
                "{} WHERE r.full_name LIKE ?1 OR r.cedula LIKE ?1 ORDER BY r.full_name",
                base
            ),
            Some(format!("%{}%", term)),
        ),
        None => (format!("{} ORDER BY r.full_name", base), None),
    };

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "representatives"))?;
    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<Value> {
        let mut row = row_from(r)?;
        row["studentCount"] = json!(r.get::<_, i64>(7)?);
        Ok(row)
    };
    let rows = match &pattern {
        Some(p) => stmt.query_map([p], map_row),
        None => stmt.query_map([], map_row),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err("db_query_failed", "representatives"))?;

    Ok(json!({ "representatives": rows }))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let full_name = get_required_str(params, "fullName")?;
    let cedula = get_required_str(params, "cedula")?;
    validate::validate_cedula(&cedula).map_err(|m| HandlerErr::validation("cedula", m))?;
    let phone = get_opt_str(params, "phone");
    if let Some(p) = &phone {
        validate::validate_phone(p).map_err(|m| HandlerErr::validation("phone", m))?;
    }
    let address = get_opt_str(params, "address");

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO representatives(id, full_name, cedula, phone, address, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &full_name, &cedula, phone.as_deref(), address.as_deref()),
    )
    .map_err(db_err("db_insert_failed", "representatives"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("representatives", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "representativeId")?;
    let patch = get_patch(params)?;

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
    patch_nullable_str(patch, "address", "address", &mut set_parts, &mut binds)?;

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!(
        "UPDATE representatives SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    binds.push(rusqlite::types::Value::Text(id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "representatives"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "representative not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("representatives", &row);
    Ok((row, vec![change]))
}

fn can_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "representativeId")?;
    let check = guards::can_delete_representative(conn, &id)
        .map_err(db_err("db_query_failed", "students"))?;
    Ok(serde_json::to_value(&check).unwrap_or_else(|_| json!({ "allowed": check.allowed })))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "representativeId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "representative not found"));
    };

    // Guard and delete run in one transaction (dropped uncommitted on
    // any error), so the count cannot go stale under the delete.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let check = guards::can_delete_representative(&tx, &id)
        .map_err(db_err("db_query_failed", "students"))?;
    if !check.allowed {
        return Err(delete_blocked(&check));
    }
    tx.execute("DELETE FROM representatives WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "representatives"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok((json!({ "ok": true }), vec![Change::delete("representatives", &row)]))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "representatives.list" => Some(with_conn(state, req, list)),
        "representatives.create" => Some(with_conn_mut(state, req, create)),
        "representatives.update" => Some(with_conn_mut(state, req, update)),
        "representatives.canDelete" => Some(with_conn(state, req, can_delete)),
        "representatives.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
