use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use super::error::{err, ok, HandlerErr};
use super::subs::Change;
use super::types::{AppState, Request};
use crate::guards::DeleteCheck;

/// Runs a read-only handler against the open workspace connection.
pub fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

/// Runs a mutating handler; row changes it reports are fanned out to
/// store subscriptions only when the handler succeeded, i.e. after the
/// enclosing transaction committed.
pub fn with_conn_mut(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Value) -> Result<(Value, Vec<Change>), HandlerErr>,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok((result, changes)) => {
            state.subs.note_changes(changes);
            ok(&req.id, result)
        }
        Err(e) => e.response(&req.id),
    }
}

/// A referencing field is optional on forms, but when provided it must
/// resolve to an existing row.
pub fn ensure_ref(
    conn: &Connection,
    field: &str,
    table: &str,
    noun: &str,
    id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if found.is_none() {
        return Err(HandlerErr::validation(
            field,
            format!("{} does not reference an existing {}", field, noun),
        ));
    }
    Ok(())
}

pub fn ensure_one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), HandlerErr> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(HandlerErr::validation(
        field,
        format!("{} must be one of: {}", field, allowed.join(", ")),
    ))
}

pub fn delete_blocked(check: &DeleteCheck) -> HandlerErr {
    HandlerErr {
        code: "delete_blocked",
        message: check
            .reason
            .clone()
            .unwrap_or_else(|| "delete blocked by dependent records".to_string()),
        details: Some(json!({
            "reason": check.reason,
            "blockingCount": check.blocking_count,
        })),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_opt_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    v.as_i64().map(Some).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("{} must be an integer", key),
        details: None,
    })
}

/// Array-of-strings field (participant types, audiences). Stored as a
/// JSON array in a TEXT column.
pub fn get_string_array(params: &Value, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(items) = v.as_array() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be an array of strings", key),
            details: None,
        });
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("{} must be an array of strings", key),
                details: None,
            });
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(Some(out))
}

pub fn json_array_text(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Lenient read of a stored JSON array column; anything unreadable
/// comes back as an empty list rather than failing the whole query.
pub fn parse_json_array(text: &str) -> Value {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_array())
        .unwrap_or_else(|| json!([]))
}

pub fn get_patch(params: &Value) -> Result<&Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        })
}

/// Stages `column = ?` for a required string field when the patch names
/// it. Returns the trimmed value so the caller can run format rules on
/// it before the UPDATE is assembled.
pub fn patch_str(
    patch: &Map<String, Value>,
    json_key: &str,
    column: &str,
    set_parts: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = patch.get(json_key) else {
        return Ok(None);
    };
    let Some(s) = v.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("patch.{} must be a string", json_key),
            details: None,
        });
    };
    let s = s.trim().to_string();
    if s.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must not be empty", json_key),
            details: None,
        });
    }
    set_parts.push(format!("{} = ?", column));
    binds.push(SqlValue::Text(s.clone()));
    Ok(Some(s))
}

/// Same as `patch_str` but the field is clearable: JSON null or an
/// empty string stages SQL NULL.
pub fn patch_nullable_str(
    patch: &Map<String, Value>,
    json_key: &str,
    column: &str,
    set_parts: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
) -> Result<Option<Option<String>>, HandlerErr> {
    let Some(v) = patch.get(json_key) else {
        return Ok(None);
    };
    if v.is_null() {
        set_parts.push(format!("{} = ?", column));
        binds.push(SqlValue::Null);
        return Ok(Some(None));
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("patch.{} must be a string or null", json_key),
            details: None,
        });
    };
    let t = s.trim().to_string();
    set_parts.push(format!("{} = ?", column));
    if t.is_empty() {
        binds.push(SqlValue::Null);
        Ok(Some(None))
    } else {
        binds.push(SqlValue::Text(t.clone()));
        Ok(Some(Some(t)))
    }
}

pub fn patch_bool(
    patch: &Map<String, Value>,
    json_key: &str,
    column: &str,
    set_parts: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
) -> Result<Option<bool>, HandlerErr> {
    let Some(v) = patch.get(json_key) else {
        return Ok(None);
    };
    let Some(b) = v.as_bool() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("patch.{} must be a boolean", json_key),
            details: None,
        });
    };
    set_parts.push(format!("{} = ?", column));
    binds.push(SqlValue::Integer(if b { 1 } else { 0 }));
    Ok(Some(b))
}

pub fn patch_i64(
    patch: &Map<String, Value>,
    json_key: &str,
    column: &str,
    set_parts: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
) -> Result<Option<i64>, HandlerErr> {
    let Some(v) = patch.get(json_key) else {
        return Ok(None);
    };
    let Some(n) = v.as_i64() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("patch.{} must be an integer", json_key),
            details: None,
        });
    };
    set_parts.push(format!("{} = ?", column));
    binds.push(SqlValue::Integer(n));
    Ok(Some(n))
}

pub fn patch_string_array(
    patch: &Map<String, Value>,
    json_key: &str,
    column: &str,
    set_parts: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = patch.get(json_key) else {
        return Ok(None);
    };
    let Some(items) = v.as_array() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("patch.{} must be an array of strings", json_key),
            details: None,
        });
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("patch.{} must be an array of strings", json_key),
                details: None,
            });
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    set_parts.push(format!("{} = ?", column));
    binds.push(SqlValue::Text(json_array_text(&out)));
    Ok(Some(out))
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_quote_escapes_embedded_quotes_and_commas() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn parse_csv_record_handles_quoted_fields() {
        assert_eq!(
            parse_csv_record("a,\"b,c\",d"),
            vec!["a".to_string(), "b,c".to_string(), "d".to_string()]
        );
        assert_eq!(
            parse_csv_record("\"he said \"\"ok\"\"\",x"),
            vec!["he said \"ok\"".to_string(), "x".to_string()]
        );
    }
}
