use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_ref, get_opt_bool, get_opt_str, get_patch, get_required_str, patch_bool,
    patch_nullable_str, patch_str, with_conn, with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::validate;

const ROW_SELECT: &str = "SELECT p.id, p.student_id, s.full_name, p.related_case_id, cf.code,
                                 p.detection_date, p.expected_delivery_date,
                                 p.is_active, p.receives_counseling, p.notes,
                                 p.created_at, p.updated_at
                          FROM pregnancy_cases p
                          LEFT JOIN students s ON s.id = p.student_id
                          LEFT JOIN case_files cf ON cf.id = p.related_case_id";

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, Option<String>>(2)?,
        "relatedCaseId": r.get::<_, Option<String>>(3)?,
        "relatedCaseCode": r.get::<_, Option<String>>(4)?,
        "detectionDate": r.get::<_, String>(5)?,
        "expectedDeliveryDate": r.get::<_, Option<String>>(6)?,
        "isActive": r.get::<_, i64>(7)? != 0,
        "receivesCounseling": r.get::<_, i64>(8)? != 0,
        "notes": r.get::<_, Option<String>>(9)?,
        "createdAt": r.get::<_, Option<String>>(10)?,
        "updatedAt": r.get::<_, Option<String>>(11)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE p.id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "pregnancy_cases"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut sql = ROW_SELECT.to_string();
    if get_opt_bool(params, "activeOnly").unwrap_or(false) {
        sql.push_str(" WHERE p.is_active = 1");
    }
    sql.push_str(" ORDER BY p.detection_date DESC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "pregnancy_cases"))?;
    let rows = stmt
        .query_map([], |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "pregnancy_cases"))?;

    Ok(json!({ "pregnancyCases": rows }))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ensure_ref(conn, "studentId", "students", "student", &student_id)?;
    let detection_date = get_required_str(params, "detectionDate")?;
    validate::validate_date(&detection_date)
        .map_err(|m| HandlerErr::validation("detectionDate", m))?;

    let related_case_id = get_opt_str(params, "relatedCaseId");
    if let Some(cid) = &related_case_id {
        ensure_ref(conn, "relatedCaseId", "case_files", "case", cid)?;
    }
    let expected = get_opt_str(params, "expectedDeliveryDate");
    if let Some(d) = &expected {
        validate::validate_date(d).map_err(|m| HandlerErr::validation("expectedDeliveryDate", m))?;
    }
    let is_active = get_opt_bool(params, "isActive").unwrap_or(true);
    let receives_counseling = get_opt_bool(params, "receivesCounseling").unwrap_or(false);
    let notes = get_opt_str(params, "notes");

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO pregnancy_cases(id, student_id, related_case_id, detection_date,
                                     expected_delivery_date, is_active, receives_counseling,
                                     notes, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &student_id,
            related_case_id.as_deref(),
            &detection_date,
            expected.as_deref(),
            is_active as i64,
            receives_counseling as i64,
            notes.as_deref(),
        ),
    )
    .map_err(db_err("db_insert_failed", "pregnancy_cases"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("pregnancy_cases", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "pregnancyId")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(sid) = patch_str(patch, "studentId", "student_id", &mut set_parts, &mut binds)? {
        ensure_ref(conn, "studentId", "students", "student", &sid)?;
    }
    if let Some(d) = patch_str(
        patch,
        "detectionDate",
        "detection_date",
        &mut set_parts,
        &mut binds,
    )? {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("detectionDate", m))?;
    }
    if let Some(Some(d)) = patch_nullable_str(
        patch,
        "expectedDeliveryDate",
        "expected_delivery_date",
        &mut set_parts,
        &mut binds,
    )? {
        validate::validate_date(&d)
            .map_err(|m| HandlerErr::validation("expectedDeliveryDate", m))?;
    }
    if let Some(Some(cid)) = patch_nullable_str(
        patch,
        "relatedCaseId",
        "related_case_id",
        &mut set_parts,
        &mut binds,
    )? {
        ensure_ref(conn, "relatedCaseId", "case_files", "case", &cid)?;
    }
    patch_bool(patch, "isActive", "is_active", &mut set_parts, &mut binds)?;
    patch_bool(
        patch,
        "receivesCounseling",
        "receives_counseling",
        &mut set_parts,
        &mut binds,
    )?;
    patch_nullable_str(patch, "notes", "notes", &mut set_parts, &mut binds)?;

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!(
        "UPDATE pregnancy_cases SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    binds.push(rusqlite::types::Value::Text(id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "pregnancy_cases"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "pregnancy case not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("pregnancy_cases", &row);
    Ok((row, vec![change]))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "pregnancyId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "pregnancy case not found"));
    };
    conn.execute("DELETE FROM pregnancy_cases WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "pregnancy_cases"))?;
    Ok((
        json!({ "ok": true }),
        vec![Change::delete("pregnancy_cases", &row)],
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "pregnancy.list" => Some(with_conn(state, req, list)),
        "pregnancy.create" => Some(with_conn_mut(state, req, create)),
        "pregnancy.update" => Some(with_conn_mut(state, req, update)),
        "pregnancy.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
