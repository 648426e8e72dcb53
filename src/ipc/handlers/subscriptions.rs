use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::subs::indexed_fields;
use crate::ipc::types::{AppState, Request};

fn handle_subscribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(table) = req.params.get("table").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing table", None);
    };
    let Some(fields) = indexed_fields(table) else {
        return err(
            &req.id,
            "bad_params",
            format!("unknown table: {}", table),
            None,
        );
    };

    let key = match req.params.get("key") {
        None | Some(serde_json::Value::Null) => None,
        Some(k) => {
            let Some(field) = k.get("field").and_then(|v| v.as_str()) else {
                return err(&req.id, "bad_params", "key.field must be a string", None);
            };
            let Some(value) = k.get("value") else {
                return err(&req.id, "bad_params", "key.value is required", None);
            };
            if !fields.contains(&field) {
                return err(
                    &req.id,
                    "bad_params",
                    format!(
                        "key.field must be an indexed field of {}: {}",
                        table,
                        fields.join(", ")
                    ),
                    None,
                );
            }
            Some((field.to_string(), value.clone()))
        }
    };

    let id = state.subs.subscribe(table, key);
    ok(&req.id, json!({ "subscriptionId": id }))
}

fn handle_unsubscribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(id) = req.params.get("subscriptionId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing subscriptionId", None);
    };
    if !state.subs.unsubscribe(id) {
        return err(&req.id, "not_found", "subscription not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "store.subscribe" => Some(handle_subscribe(state, req)),
        "store.unsubscribe" => Some(handle_unsubscribe(state, req)),
        _ => None,
    }
}
