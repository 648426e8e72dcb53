use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_one_of, ensure_ref, get_opt_bool, get_opt_str, get_patch, get_required_str,
    get_string_array, json_array_text, parse_json_array, patch_bool, patch_nullable_str,
    patch_str, patch_string_array, with_conn, with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::validate;

const PARTICIPANT_TYPES: [&str; 3] = ["student", "representative", "teacher"];

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    let participant_types: String = r.get(5)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "caseId": r.get::<_, String>(1)?,
        "date": r.get::<_, String>(2)?,
        "description": r.get::<_, String>(3)?,
        "responsible": r.get::<_, String>(4)?,
        "participantTypes": parse_json_array(&participant_types),
        "isEffective": r.get::<_, i64>(6)? != 0,
        "attachment": r.get::<_, Option<String>>(7)?,
        "createdAt": r.get::<_, Option<String>>(8)?,
    }))
}

const ROW_SELECT: &str = "SELECT id, case_id, date, description, responsible,
                                 participant_types, is_effective, attachment, created_at
                          FROM follow_ups";

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "follow_ups"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let case_id = get_required_str(params, "caseId")?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE case_id = ? ORDER BY date DESC, created_at DESC",
            ROW_SELECT
        ))
        .map_err(db_err("db_query_failed", "follow_ups"))?;
    let rows = stmt
        .query_map([&case_id], |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "follow_ups"))?;
    Ok(json!({ "followUps": rows }))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let case_id = get_required_str(params, "caseId")?;
    ensure_ref(conn, "caseId", "case_files", "case", &case_id)?;
    let date = get_required_str(params, "date")?;
    validate::validate_date(&date).map_err(|m| HandlerErr::validation("date", m))?;
    let description = get_required_str(params, "description")?;
    let responsible = get_required_str(params, "responsible")?;
    let participant_types = get_string_array(params, "participantTypes")?.unwrap_or_default();
    for p in &participant_types {
        ensure_one_of("participantTypes", p, &PARTICIPANT_TYPES)?;
    }
    let is_effective = get_opt_bool(params, "isEffective").unwrap_or(false);
    let attachment = get_opt_str(params, "attachment");

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO follow_ups(id, case_id, date, description, responsible,
                                participant_types, is_effective, attachment, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &case_id,
            &date,
            &description,
            &responsible,
            json_array_text(&participant_types),
            is_effective as i64,
            attachment.as_deref(),
        ),
    )
    .map_err(db_err("db_insert_failed", "follow_ups"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("follow_ups", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "followUpId")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(d) = patch_str(patch, "date", "date", &mut set_parts, &mut binds)? {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("date", m))?;
    }
    patch_str(patch, "description", "description", &mut set_parts, &mut binds)?;
    patch_str(patch, "responsible", "responsible", &mut set_parts, &mut binds)?;
    if let Some(types) = patch_string_array(
        patch,
        "participantTypes",
        "participant_types",
        &mut set_parts,
        &mut binds,
    )? {
        for p in &types {
            ensure_one_of("participantTypes", p, &PARTICIPANT_TYPES)?;
        }
    }
    patch_bool(patch, "isEffective", "is_effective", &mut set_parts, &mut binds)?;
    patch_nullable_str(patch, "attachment", "attachment", &mut set_parts, &mut binds)?;

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }

    let sql = format!("UPDATE follow_ups SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(rusqlite::types::Value::Text(id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "follow_ups"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "follow-up not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("follow_ups", &row);
    Ok((row, vec![change]))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "followUpId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "follow-up not found"));
    };
    conn.execute("DELETE FROM follow_ups WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "follow_ups"))?;
    Ok((json!({ "ok": true }), vec![Change::delete("follow_ups", &row)]))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "followUps.list" => Some(with_conn(state, req, list)),
        "followUps.create" => Some(with_conn_mut(state, req, create)),
        "followUps.update" => Some(with_conn_mut(state, req, update)),
        "followUps.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
