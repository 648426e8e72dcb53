use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_one_of, ensure_ref, get_opt_str, get_patch, get_required_str, patch_nullable_str,
    with_conn, with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use crate::validate;

const ATTENDEE_TYPES: [&str; 3] = ["student", "representative", "teacher"];
const STATUSES: [&str; 4] = ["scheduled", "completed", "cancelled", "missed"];

const ROW_SELECT: &str = "SELECT a.id, a.date, a.start_time, a.end_time,
                                 a.attendee_type, a.attendee_id,
                                 COALESCE(sa.full_name, ra.full_name, ta.full_name)
                                   AS attendee_name,
                                 a.student_id, s.full_name AS student_name,
                                 a.case_id, cf.code AS case_code,
                                 a.status, a.reason, a.created_at, a.updated_at
                          FROM appointments a
                          LEFT JOIN students sa
                            ON a.attendee_type = 'student' AND sa.id = a.attendee_id
                          LEFT JOIN representatives ra
                            ON a.attendee_type = 'representative' AND ra.id = a.attendee_id
                          LEFT JOIN teachers ta
                            ON a.attendee_type = 'teacher' AND ta.id = a.attendee_id
                          LEFT JOIN students s ON s.id = a.student_id
                          LEFT JOIN case_files cf ON cf.id = a.case_id";

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "date": r.get::<_, String>(1)?,
        "startTime": r.get::<_, String>(2)?,
        "endTime": r.get::<_, String>(3)?,
        "attendeeType": r.get::<_, String>(4)?,
        "attendeeId": r.get::<_, String>(5)?,
        "attendeeName": r.get::<_, Option<String>>(6)?,
        "studentId": r.get::<_, Option<String>>(7)?,
        "studentName": r.get::<_, Option<String>>(8)?,
        "caseId": r.get::<_, Option<String>>(9)?,
        "caseCode": r.get::<_, Option<String>>(10)?,
        "status": r.get::<_, String>(11)?,
        "reason": r.get::<_, Option<String>>(12)?,
        "createdAt": r.get::<_, Option<String>>(13)?,
        "updatedAt": r.get::<_, Option<String>>(14)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE a.id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "appointments"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(date) = get_opt_str(params, "date") {
        validate::validate_date(&date).map_err(|m| HandlerErr::validation("date", m))?;
        clauses.push(format!("a.date = ?{}", binds.len() + 1));
        binds.push(date);
    }
    if let Some(student_id) = get_opt_str(params, "studentId") {
        clauses.push(format!("a.student_id = ?{}", binds.len() + 1));
        binds.push(student_id);
    }
    if let Some(status) = get_opt_str(params, "status") {
        ensure_one_of("status", &status, &STATUSES)?;
        clauses.push(format!("a.status = ?{}", binds.len() + 1));
        binds.push(status);
    }

    let mut sql = ROW_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY a.date, a.start_time");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "appointments"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(&binds), |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "appointments"))?;

    Ok(json!({ "appointments": rows }))
}

fn available_slots(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let date = get_required_str(params, "date")?;
    validate::validate_date(&date).map_err(|m| HandlerErr::validation("date", m))?;
    let slots = schedule::compute_available_slots(conn, &date)
        .map_err(|e| HandlerErr::new("db_query_failed", e.message))?;
    Ok(json!({ "date": date, "slots": slots }))
}

fn attendee_table(attendee_type: &str) -> (&'static str, &'static str) {
    match attendee_type {
        "student" => ("students", "student"),
        "representative" => ("representatives", "representative"),
        _ => ("teachers", "teacher"),
    }
}

fn slot_taken(
    conn: &Connection,
    date: &str,
    start: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let count: i64 = match exclude_id {
        Some(id) => conn.query_row(
            "SELECT COUNT(*) FROM appointments
             WHERE date = ? AND start_time = ? AND status != 'cancelled' AND id != ?",
            (date, start, id),
            |r| r.get(0),
        ),
        None => conn.query_row(
            "SELECT COUNT(*) FROM appointments
             WHERE date = ? AND start_time = ? AND status != 'cancelled'",
            (date, start),
            |r| r.get(0),
        ),
    }
    .map_err(db_err("db_query_failed", "appointments"))?;
    Ok(count > 0)
}

/// The start time must be one of the configured day grid's slots; being
/// off-grid is a validation problem, being taken is a conflict.
fn ensure_on_grid(cfg: &schedule::SchedulingConfig, start: &str) -> Result<(), HandlerErr> {
    if schedule::generate_slots(cfg).iter().any(|s| s == start) {
        return Ok(());
    }
    Err(HandlerErr::validation(
        "startTime",
        "startTime is not a slot in the configured schedule",
    ))
}

fn newest_active_case(conn: &Connection, student_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM case_files
         WHERE student_id = ? AND status = 'active'
         ORDER BY opening_date DESC, created_at DESC
         LIMIT 1",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err("db_query_failed", "case_files"))
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let date = get_required_str(params, "date")?;
    validate::validate_date(&date).map_err(|m| HandlerErr::validation("date", m))?;
    let start = get_required_str(params, "startTime")?;
    validate::validate_time(&start).map_err(|m| HandlerErr::validation("startTime", m))?;
    let attendee_type = get_required_str(params, "attendeeType")?;
    ensure_one_of("attendeeType", &attendee_type, &ATTENDEE_TYPES)?;
    let attendee_id = get_required_str(params, "attendeeId")?;
    let (table, noun) = attendee_table(&attendee_type);
    ensure_ref(conn, "attendeeId", table, noun, &attendee_id)?;

    // A student attendee is the appointment's student; other attendee
    // kinds may name the student the meeting is about.
    let student_id = if attendee_type == "student" {
        Some(attendee_id.clone())
    } else {
        let explicit = get_opt_str(params, "studentId");
        if let Some(sid) = &explicit {
            ensure_ref(conn, "studentId", "students", "student", sid)?;
        }
        explicit
    };

    let reason = get_opt_str(params, "reason");
    let cfg = schedule::load_scheduling_config(conn);
    ensure_on_grid(&cfg, &start)?;
    let end = schedule::end_time_for(&start, &cfg)
        .ok_or_else(|| HandlerErr::validation("startTime", "time must use HH:MM"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if slot_taken(&tx, &date, &start, None)? {
        return Err(HandlerErr::new(
            "conflict",
            format!("slot {} on {} is already booked", start, date),
        ));
    }

    let case_id = match get_opt_str(params, "caseId") {
        Some(cid) => {
            ensure_ref(&tx, "caseId", "case_files", "case", &cid)?;
            Some(cid)
        }
        None => match &student_id {
            Some(sid) => newest_active_case(&tx, sid)?,
            None => None,
        },
    };

    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO appointments(id, date, start_time, end_time, attendee_type, attendee_id,
                                  student_id, case_id, status, reason, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'scheduled', ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &date,
            &start,
            &end,
            &attendee_type,
            &attendee_id,
            student_id.as_deref(),
            case_id.as_deref(),
            reason.as_deref(),
        ),
    )
    .map_err(db_err("db_insert_failed", "appointments"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("appointments", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "appointmentId")?;
    let patch = get_patch(params)?;

    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT date, start_time FROM appointments WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed", "appointments"))?;
    let Some((current_date, current_start)) = current else {
        return Err(HandlerErr::new("not_found", "appointment not found"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    let new_date = match patch.get("date").and_then(|v| v.as_str()) {
        Some(d) => {
            let d = d.trim().to_string();
            validate::validate_date(&d).map_err(|m| HandlerErr::validation("date", m))?;
            set_parts.push("date = ?".into());
            binds.push(rusqlite::types::Value::Text(d.clone()));
            Some(d)
        }
        None => None,
    };
    let new_start = match patch.get("startTime").and_then(|v| v.as_str()) {
        Some(t) => {
            let t = t.trim().to_string();
            validate::validate_time(&t).map_err(|m| HandlerErr::validation("startTime", m))?;
            set_parts.push("start_time = ?".into());
            binds.push(rusqlite::types::Value::Text(t.clone()));
            Some(t)
        }
        None => None,
    };
    patch_nullable_str(patch, "reason", "reason", &mut set_parts, &mut binds)?;
    if let Some(Some(cid)) = patch_nullable_str(patch, "caseId", "case_id", &mut set_parts, &mut binds)? {
        ensure_ref(conn, "caseId", "case_files", "case", &cid)?;
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }

    let moving = new_date.is_some() || new_start.is_some();
    let target_date = new_date.unwrap_or(current_date);
    let target_start = new_start.unwrap_or(current_start);
    if moving {
        let cfg = schedule::load_scheduling_config(conn);
        ensure_on_grid(&cfg, &target_start)?;
        let end = schedule::end_time_for(&target_start, &cfg)
            .ok_or_else(|| HandlerErr::validation("startTime", "time must use HH:MM"))?;
        set_parts.push("end_time = ?".into());
        binds.push(rusqlite::types::Value::Text(end));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if moving && slot_taken(&tx, &target_date, &target_start, Some(&id))? {
        return Err(HandlerErr::new(
            "conflict",
            format!("slot {} on {} is already booked", target_start, target_date),
        ));
    }

    let sql = format!("UPDATE appointments SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(rusqlite::types::Value::Text(id.clone()));
    tx.execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "appointments"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("appointments", &row);
    Ok((row, vec![change]))
}

fn set_status(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "appointmentId")?;
    let status = get_required_str(params, "status")?;
    ensure_one_of("status", &status, &STATUSES)?;

    let changed = conn
        .execute(
            "UPDATE appointments
             SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?",
            (&status, &id),
        )
        .map_err(db_err("db_update_failed", "appointments"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "appointment not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("appointments", &row);
    Ok((row, vec![change]))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "appointmentId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "appointment not found"));
    };
    conn.execute("DELETE FROM appointments WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "appointments"))?;
    Ok((
        json!({ "ok": true }),
        vec![Change::delete("appointments", &row)],
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "appointments.list" => Some(with_conn(state, req, list)),
        "appointments.availableSlots" => Some(with_conn(state, req, available_slots)),
        "appointments.create" => Some(with_conn_mut(state, req, create)),
        "appointments.update" => Some(with_conn_mut(state, req, update)),
        "appointments.setStatus" => Some(with_conn_mut(state, req, set_status)),
        "appointments.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
