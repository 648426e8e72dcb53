use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    get_opt_bool, get_opt_i64, get_opt_str, get_patch, get_required_str, get_string_array,
    json_array_text, parse_json_array, patch_i64, patch_nullable_str, patch_str,
    patch_string_array, with_conn, with_conn_mut,
};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::validate;

const ROW_SELECT: &str = "SELECT id, topic, date, end_date, audience,
                                 attendees_male, attendees_female, attendees_staff,
                                 attendees_parents, is_executed, notes, created_at
                          FROM preventive_activities";

fn row_from(r: &rusqlite::Row) -> rusqlite::Result<Value> {
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
        "isExecuted": r.get::<_, i64>(9)? != 0,
        "notes": r.get::<_, Option<String>>(10)?,
        "createdAt": r.get::<_, Option<String>>(11)?,
    }))
}

fn select_row(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(&format!("{} WHERE id = ?", ROW_SELECT), [id], |r| {
        row_from(r)
    })
    .optional()
    .map_err(db_err("db_query_failed", "preventive_activities"))
}

fn list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(from) = get_opt_str(params, "from") {
        validate::validate_date(&from).map_err(|m| HandlerErr::validation("from", m))?;
        clauses.push(format!("date >= ?{}", binds.len() + 1));
        binds.push(from);
    }
    if let Some(to) = get_opt_str(params, "to") {
        validate::validate_date(&to).map_err(|m| HandlerErr::validation("to", m))?;
        clauses.push(format!("date <= ?{}", binds.len() + 1));
        binds.push(to);
    }
    if get_opt_bool(params, "executedOnly").unwrap_or(false) {
        clauses.push("is_executed = 1".to_string());
    }

    let mut sql = ROW_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY date DESC, created_at DESC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(db_err("db_query_failed", "preventive_activities"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(&binds), |r| row_from(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "preventive_activities"))?;

    Ok(json!({ "activities": rows }))
}

fn attendee_count(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    let n = get_opt_i64(params, key)?.unwrap_or(0);
    if n < 0 {
        return Err(HandlerErr::validation(key, format!("{} must be >= 0", key)));
    }
    Ok(n)
}

fn create(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let topic = get_required_str(params, "topic")?;
    let date = get_required_str(params, "date")?;
    validate::validate_date(&date).map_err(|m| HandlerErr::validation("date", m))?;
    let end_date = get_opt_str(params, "endDate");
    if let Some(d) = &end_date {
        validate::validate_date(d).map_err(|m| HandlerErr::validation("endDate", m))?;
    }
    let audience = get_string_array(params, "audience")?.unwrap_or_default();
    let male = attendee_count(params, "attendeesMale")?;
    let female = attendee_count(params, "attendeesFemale")?;
    let staff = attendee_count(params, "attendeesStaff")?;
    let parents = attendee_count(params, "attendeesParents")?;
    let notes = get_opt_str(params, "notes");

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO preventive_activities(id, topic, date, end_date, audience,
                                           attendees_male, attendees_female,
                                           attendees_staff, attendees_parents,
                                           is_executed, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &id,
            &topic,
            &date,
            end_date.as_deref(),
            json_array_text(&audience),
            male,
            female,
            staff,
            parents,
            notes.as_deref(),
        ),
    )
    .map_err(db_err("db_insert_failed", "preventive_activities"))?;

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted row not readable"))?;
    let change = Change::insert("preventive_activities", &row);
    Ok((row, vec![change]))
}

fn update(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "activityId")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    patch_str(patch, "topic", "topic", &mut set_parts, &mut binds)?;
    if let Some(d) = patch_str(patch, "date", "date", &mut set_parts, &mut binds)? {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("date", m))?;
    }
    if let Some(Some(d)) =
        patch_nullable_str(patch, "endDate", "end_date", &mut set_parts, &mut binds)?
    {
        validate::validate_date(&d).map_err(|m| HandlerErr::validation("endDate", m))?;
    }
    patch_string_array(patch, "audience", "audience", &mut set_parts, &mut binds)?;
    for (key, column) in [
        ("attendeesMale", "attendees_male"),
        ("attendeesFemale", "attendees_female"),
        ("attendeesStaff", "attendees_staff"),
        ("attendeesParents", "attendees_parents"),
    ] {
        if let Some(n) = patch_i64(patch, key, column, &mut set_parts, &mut binds)? {
            if n < 0 {
                return Err(HandlerErr::validation(key, format!("{} must be >= 0", key)));
            }
        }
    }
    patch_nullable_str(patch, "notes", "notes", &mut set_parts, &mut binds)?;

    if set_parts.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "patch must include at least one field",
        ));
    }

    let sql = format!(
        "UPDATE preventive_activities SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    binds.push(rusqlite::types::Value::Text(id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(db_err("db_update_failed", "preventive_activities"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "activity not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("preventive_activities", &row);
    Ok((row, vec![change]))
}

fn mark_executed(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "activityId")?;
    let changed = conn
        .execute(
            "UPDATE preventive_activities SET is_executed = 1 WHERE id = ?",
            [&id],
        )
        .map_err(db_err("db_update_failed", "preventive_activities"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "activity not found"));
    }

    let row = select_row(conn, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated row not readable"))?;
    let change = Change::update("preventive_activities", &row);
    Ok((row, vec![change]))
}

fn delete(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let id = get_required_str(params, "activityId")?;
    let Some(row) = select_row(conn, &id)? else {
        return Err(HandlerErr::new("not_found", "activity not found"));
    };
    conn.execute("DELETE FROM preventive_activities WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed", "preventive_activities"))?;
    Ok((
        json!({ "ok": true }),
        vec![Change::delete("preventive_activities", &row)],
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activities.list" => Some(with_conn(state, req, list)),
        "activities.create" => Some(with_conn_mut(state, req, create)),
        "activities.update" => Some(with_conn_mut(state, req, update)),
        "activities.markExecuted" => Some(with_conn_mut(state, req, mark_executed)),
        "activities.delete" => Some(with_conn_mut(state, req, delete)),
        _ => None,
    }
}
