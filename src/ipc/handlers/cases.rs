use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_one_of, ensure_ref, get_opt_str, get_patch, get_required_str, patch_nullable_str,
    patch_str, with_conn, with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::validate;

const CATEGORIES: [&str; 7] = [
    "academic",
    "behavioral",
    "emotional",
    "family",
    "sexual_violence",
    "pregnancy",
    "other",
];
const PRIORITIES: [&str; 3] = ["high", "medium", "low"];
const STATUSES: [&str; 3] = ["active", "closed", "transferred"];

const ROW_SELECT: &str = "SELECT cf.id, cf.code, cf.student_id, s.full_name,
                                 cf.category, cf.priority, cf.status,
                                 cf.opening_date, cf.due_date, cf.description,
                                 cf.closing_date, cf.closing_reason, cf.transfer_destination,
                                 cf.created_at, cf.updated_at,
                                 (SELECT COUNT(*) FROM follow_ups f
                                  WHERE f.case_id = cf.id) AS follow_up_count,
                                 (SELECT COUNT(*) FROM follow_ups f
                                  WHERE f.case_id = cf.id AND f.is_effective = 1)
                                   AS effective_follow_up_count
                          FROM case_files cf
                          LEFT JOIN students s ON s.id = cf.student_id";

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "code": r.get::<_, String>(1)?,
        "studentId": r.get::<_, String>(2)?,
        "studentName": r.get::<_, Option<String>>(3)?,
        "category": r.get::<_, String>(4)?,
        "priority": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "openingDate": r.get::<_, String>(7)?,
        "dueDate": r.get::<_, Option<String>>(8)?,
        "description": r.get::<_, Option<String>>(9)?,
        "closingDate": r.get::<_, Option<String>>(10)?,
        "closingReason": r.get::<_, Option<String>>(11)?,
        "transferDestination": r.get::<_, Option<String>>(12)?,
        "createdAt": r.get::<_, Option<String>>(13)?,
        "updatedAt": r.get::<_, Option<String>>(14)?,
        "followUpCount": r.get::<_, i64>(15)?,
        "effectiveFollowUpCount": r.get::<_, i64>(16)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE cf.id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "case_files"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(student_id) = get_opt_str(params, "studentId") {
        clauses.push(format!("cf.student_id = ?{}", binds.len() + 1));
        binds.push(student_id);
    }
    if let Some(status) = get_opt_str(params, "status") {
        ensure_one_of("status", &status, &STATUSES)?;
        clauses.push(format!("cf.status = ?{}", binds.len() + 1));
        binds.push(status);
    }
    if let Some(category) = get_opt_str(params, "category") {
        ensure_one_of("category", &category, &CATEGORIES)?;
        clauses.push(format!("cf.category = ?{}", binds.len() + 1));
        binds.push(category);
    }

    let mut sql = ROW_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY cf.opening_date DESC, cf.code DESC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "case_files"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(&binds), |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "case_files"))?;

    Ok(json!({ "cases": rows }))
}

fn get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "caseId")?;
    select_row(conn, &id)?.ok_or_else(|| HandlerErr::new("not_found", "case not found"))
}

/// Case codes run `DECE-<year>-<seq>` per opening year. The next
/// sequence number is read inside the insert transaction, so two
/// creates cannot mint the same code.
fn next_case_code(conn: &Connection, year: &str) -> Result<String, HandlerErr> {
    let prefix = format!("DECE-{}-", year);
    let max_seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(CAST(substr(code, ?1) AS INTEGER)), 0)
             FROM case_files WHERE code LIKE ?2 || '%'",
            (prefix.len() as i64 + 1, &prefix),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed", "case_files"))?;
    Ok(format!("{}{:03}", prefix, max_seq + 1))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ensure_ref(conn, "studentId", "students", "student", &student_id)?;
    let category = get_required_str(params, "category")?;
    ensure_one_of("category", &category, &CATEGORIES)?;
    let priority = get_required_str(params, "priority")?;
    ensure_one_of("priority", &priority, &PRIORITIES)?;

    let opening_date = match get_opt_str(params, "openingDate") {
        Some(d) => {
            validate::validate_date(&d).map_err(|m| HandlerErr::validation("openingDate", m))?;
            d
        }
        None => Utc::now().date_naive().to_string(),
    };
    let due_date = get_opt_str(params, "dueDate");
    if let Some(d) = &due_date {
        validate::validate_date(d).map_err(|m| HandlerErr::validation("dueDate", m))?;
    }
    let description = get_opt_str(params, "description");

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let code = next_case_code(&tx, &opening_date[..4])?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO case_files(id, code, student_id, category, priority, status,
                                opening_date, due_date, description, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'active', ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &code,
            &student_id,
            &category,
            &priority,
            &opening_date,
            due_date.as_deref(),
            description.as_deref(),
        ),
    )
    .map_err(db_err("db_insert_failed", "case_files"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("case_files", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "caseId")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(category) = patch_str(patch, "category", "category", &mut set_parts, &mut binds)? {
        ensure_one_of("category", &category, &CATEGORIES)?;
    }
    if let Some(priority) = patch_str(patch, "priority", "priority", &mut set_parts, &mut binds)? {
        ensure_one_of("priority", &priority, &PRIORITIES)?;
    }
    if let Some(d) = patch_str(patch, "openingDate", "opening_date", &mut set_parts, &mut binds)? {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("openingDate", m))?;
    }
    if let Some(Some(d)) =
        patch_nullable_str(patch, "dueDate", "due_date", &mut set_parts, &mut binds)?
    {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("dueDate", m))?;
    }
    patch_nullable_str(patch, "description", "description", &mut set_parts, &mut binds)?;

    // Status and the student binding are deliberately not patchable;
    // close/transfer own the status transitions and the code keeps its
    // student for life.
    if patch.contains_key("status") || patch.contains_key("studentId") {
        return Err(HandlerErr::new(
            "bad_params",
            "status and studentId cannot be patched; use cases.close / cases.transfer",
        ));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE case_files SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(rusqlite::types::Value::Text(id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "case_files"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "case not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("case_files", &row);
    Ok((row, vec![change]))
}

fn case_status(conn: &Connection, id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row("SELECT status FROM case_files WHERE id = ?", [id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(db_err("db_query_failed", "case_files"))
}

/// Inserts the audit follow-up that narrates a workflow transition.
/// Audit entries never count toward effectiveness statistics.
fn insert_audit_follow_up(
    conn: &Connection,
    case_id: &str,
    date: &str,
    description: &str,
    responsible: &str,
) -> Result<Value, HandlerErr> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO follow_ups(id, case_id, date, description, responsible,
                                participant_types, is_effective, created_at)
         VALUES(?, ?, ?, ?, ?, '[]', 0, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, case_id, date, description, responsible),
    )
    .map_err(db_err("db_insert_failed", "follow_ups"))?;
    Ok(json!({
        "id": id,
        "caseId": case_id,
        "date": date,
        "description": description,
        "responsible": responsible,
        "isEffective": false,
    }))
}

fn close(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "caseId")?;
    let reason = get_required_str(params, "reason")?;
    let closed_by = get_opt_str(params, "closedBy").unwrap_or_else(|| "DECE".to_string());

    let Some(status) = case_status(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "case not found"));
    };
    if status != "active" {
        return Err(HandlerErr::new(
            "conflict",
            format!("case is already {}", status),
        ));
    }

    let today = Utc::now().date_naive().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE case_files
         SET status = 'closed', closing_date = ?, closing_reason = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (&today, &reason, &id),
    )
    .map_err(db_err("db_update_failed", "case_files"))?;
    let audit = insert_audit_follow_up(
        &tx,
        &id,
        &today,
        &format!("Case closed: {}", reason),
        &closed_by,
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let changes = vec![
        Change::update("case_files", &row),
        Change::insert("follow_ups", &audit),
    ];
    Ok((row, changes))
}

fn transfer(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "caseId")?;
    let destination = get_required_str(params, "destination")?;
    let reason = get_required_str(params, "reason")?;
    let transferred_by =
        get_opt_str(params, "transferredBy").unwrap_or_else(|| "DECE".to_string());

    let Some(status) = case_status(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "case not found"));
    };
    if status != "active" {
        return Err(HandlerErr::new(
            "conflict",
            format!("case is already {}", status),
        ));
    }

    let today = Utc::now().date_naive().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE case_files
         SET status = 'transferred', closing_date = ?, closing_reason = ?,
             transfer_destination = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (&today, &reason, &destination, &id),
    )
    .map_err(db_err("db_update_failed", "case_files"))?;
    let audit = insert_audit_follow_up(
        &tx,
        &id,
        &today,
        &format!("Case transferred to {}: {}", destination, reason),
        &transferred_by,
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let changes = vec![
        Change::update("case_files", &row),
        Change::insert("follow_ups", &audit),
    ];
    Ok((row, changes))
}

/// The one deliberate cascade: a case takes its follow-ups with it and
/// releases its appointment and pregnancy links, in dependency order.
fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "caseId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "case not found"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut changes: Vec<Change> = Vec::new();

    let mut stmt = tx
        .prepare("SELECT id, date FROM follow_ups WHERE case_id = ?")
        .map_err(db_err("db_query_failed", "follow_ups"))?;
    let follow_ups = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "caseId": id.clone(),
                "date": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "follow_ups"))?;
    drop(stmt);
    tx.execute("DELETE FROM follow_ups WHERE case_id = ?", [&id])
        .map_err(db_err("db_delete_failed", "follow_ups"))?;
    for f in &follow_ups {
        changes.push(Change::delete("follow_ups", f));
    }

    let mut stmt = tx
        .prepare("SELECT id, date, student_id FROM appointments WHERE case_id = ?")
        .map_err(db_err("db_query_failed", "appointments"))?;
    let appointments = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "studentId": r.get::<_, Option<String>>(2)?,
                "caseId": Value::Null,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "appointments"))?;
    drop(stmt);
    tx.execute(
        "UPDATE appointments
         SET case_id = NULL, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE case_id = ?",
        [&id],
    )
    .map_err(db_err("db_update_failed", "appointments"))?;
    for a in &appointments {
        changes.push(Change::update("appointments", a));
    }

    let mut stmt = tx
        .prepare("SELECT id, student_id, detection_date FROM pregnancy_cases WHERE related_case_id = ?")
        .map_err(db_err("db_query_failed", "pregnancy_cases"))?;
    let pregnancies = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "detectionDate": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "pregnancy_cases"))?;
    drop(stmt);
    tx.execute(
        "UPDATE pregnancy_cases
         SET related_case_id = NULL, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE related_case_id = ?",
        [&id],
    )
    .map_err(db_err("db_update_failed", "pregnancy_cases"))?;
    for p in &pregnancies {
        changes.push(Change::update("pregnancy_cases", p));
    }

    tx.execute("DELETE FROM case_files WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "case_files"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    changes.push(Change::delete("case_files", &row));

    Ok((json!({ "ok": true }), changes))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cases.list" => Some(with_conn(state, req, list)),
        "cases.get" => Some(with_conn(state, req, get)),
        "cases.create" => Some(with_conn_mut(state, req, create)),
        "cases.update" => Some(with_conn_mut(state, req, update)),
        "cases.close" => Some(with_conn_mut(state, req, close)),
        "cases.transfer" => Some(with_conn_mut(state, req, transfer)),
        "cases.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
