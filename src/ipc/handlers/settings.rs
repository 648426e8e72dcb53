use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn institution_get(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT name, amie_code, address, phone, email, district
             FROM institution WHERE id = 1",
            [],
            |r| {
                Ok(json!({
                    "name": r.get::<_, String>(0)?,
                    "amieCode": r.get::<_, String>(1)?,
                    "address": r.get::<_, String>(2)?,
                    "phone": r.get::<_, String>(3)?,
                    "email": r.get::<_, String>(4)?,
                    "district": r.get::<_, String>(5)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(row.unwrap_or_else(|| {
        json!({
            "name": "",
            "amieCode": "",
            "address": "",
            "phone": "",
            "email": "",
            "district": "",
        })
    }))
}

fn institution_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        });
    };

    conn.execute(
        "INSERT INTO institution(id) VALUES(1) ON CONFLICT(id) DO NOTHING",
        [],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "institution" })),
    })?;

    let fields: [(&str, &str); 6] = [
        ("name", "name"),
        ("amieCode", "amie_code"),
        ("address", "address"),
        ("phone", "phone"),
        ("email", "email"),
        ("district", "district"),
    ];
    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    for (json_key, column) in fields {
        if let Some(v) = patch.get(json_key) {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("patch.{} must be a string", json_key),
                    details: None,
                });
            };
            set_parts.push(format!("{} = ?", column));
            binds.push(s.trim().to_string());
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "patch must include at least one field".to_string(),
            details: None,
        });
    }

    let sql = format!("UPDATE institution SET {} WHERE id = 1", set_parts.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "institution" })),
        })?;

    institution_get(conn)
}

fn settings_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let section = get_required_str(params, "section")?;
    if section != schedule::SETTINGS_KEY {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown settings section: {}", section),
            details: None,
        });
    }
    let stored = db::settings_get_json(conn, &section).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(stored
        .unwrap_or_else(|| schedule::scheduling_config_json(&schedule::SchedulingConfig::default())))
}

fn settings_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section = get_required_str(params, "section")?;
    if section != schedule::SETTINGS_KEY {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown settings section: {}", section),
            details: None,
        });
    }
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        });
    };

    for key in ["startTime", "endTime"] {
        if let Some(v) = patch.get(key) {
            let valid = v
                .as_str()
                .map(|s| NaiveTime::parse_from_str(s, "%H:%M").is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(HandlerErr::validation(key, format!("{} must be HH:MM", key)));
            }
        }
    }
    if let Some(v) = patch.get("slotMinutes") {
        let valid = v.as_i64().map(|n| n > 0 && n <= 120).unwrap_or(false);
        if !valid {
            return Err(HandlerErr::validation(
                "slotMinutes",
                "slotMinutes must be an integer between 1 and 120",
            ));
        }
    }
    if let Some(v) = patch.get("lunchHour") {
        let valid = v.as_u64().map(|n| n < 24).unwrap_or(false);
        if !valid {
            return Err(HandlerErr::validation(
                "lunchHour",
                "lunchHour must be an hour between 0 and 23",
            ));
        }
    }

    let mut merged = db::settings_get_json(conn, &section)
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .unwrap_or_else(|| schedule::scheduling_config_json(&schedule::SchedulingConfig::default()));
    let Some(obj) = merged.as_object_mut() else {
        return Err(HandlerErr {
            code: "db_query_failed",
            message: "stored settings section is not an object".to_string(),
            details: None,
        });
    };
    for (k, v) in patch {
        obj.insert(k.clone(), v.clone());
    }

    db::settings_set_json(conn, &section, &merged).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "settings" })),
    })?;
    Ok(merged)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "institution.get" => Some(with_conn(state, req, |c, _| institution_get(c))),
        "institution.update" => Some(with_conn(state, req, institution_update)),
        "settings.get" => Some(with_conn(state, req, settings_get)),
        "settings.update" => Some(with_conn(state, req, settings_update)),
        _ => None,
    }
}
