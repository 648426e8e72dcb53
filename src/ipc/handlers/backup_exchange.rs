use std::path::PathBuf;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::backup;
use crate::db;
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::helpers::{csv_quote, ensure_one_of, get_opt_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};

const CASE_STATUSES: [&str; 3] = ["active", "closed", "transferred"];

fn write_csv(path: &str, csv: String) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HandlerErr {
            code: "io_failed",
            message: e.to_string(),
            details: Some(json!({ "path": path })),
        })?;
    }
    std::fs::write(&out, csv).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    })
}

fn export_cases_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;
    let status = get_opt_str(params, "status");
    if let Some(s) = &status {
        ensure_one_of("status", s, &CASE_STATUSES)?;
    }

    let sql = match &status {
        Some(_) => {
            "SELECT cf.code, s.full_name, s.cedula, cf.category, cf.priority, cf.status,
                    cf.opening_date, cf.due_date, cf.closing_date, cf.description
             FROM case_files cf
             LEFT JOIN students s ON s.id = cf.student_id
             WHERE cf.status = ?1
             ORDER BY cf.opening_date, cf.code"
        }
        None => {
            "SELECT cf.code, s.full_name, s.cedula, cf.category, cf.priority, cf.status,
                    cf.opening_date, cf.due_date, cf.closing_date, cf.description
             FROM case_files cf
             LEFT JOIN students s ON s.id = cf.student_id
             ORDER BY cf.opening_date, cf.code"
        }
    };
    let binds: Vec<&String> = status.iter().collect();
    let mut stmt = conn
        .prepare(sql)
        .map_err(db_err("db_query_failed", "case_files"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, Option<String>>(8)?,
                r.get::<_, Option<String>>(9)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "case_files"))?;

    let mut csv = String::from(
        "code,student_name,student_cedula,category,priority,status,opening_date,due_date,closing_date,description\n",
    );
    let rows_exported = rows.len();
    for (code, name, cedula, category, priority, status, opening, due, closing, description) in
        rows
    {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&code),
            csv_quote(&name.unwrap_or_default()),
            csv_quote(&cedula.unwrap_or_default()),
            csv_quote(&category),
            csv_quote(&priority),
            csv_quote(&status),
            csv_quote(&opening),
            csv_quote(&due.unwrap_or_default()),
            csv_quote(&closing.unwrap_or_default()),
            csv_quote(&description.unwrap_or_default()),
        ));
    }

    write_csv(&out_path, csv)?;
    Ok(json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }))
}

/// Roster export uses the import header, so a roster round-trips
/// between workspaces through the same five columns.
fn export_roster_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;
    let course_id = get_opt_str(params, "courseId");

    let sql = match &course_id {
        Some(_) => {
            "SELECT s.cedula, s.full_name, s.birth_date, c.name, c.parallel
             FROM students s
             LEFT JOIN courses c ON c.id = s.course_id
             WHERE s.course_id = ?1
             ORDER BY c.name, c.parallel, s.full_name"
        }
        None => {
            "SELECT s.cedula, s.full_name, s.birth_date, c.name, c.parallel
             FROM students s
             LEFT JOIN courses c ON c.id = s.course_id
             ORDER BY c.name, c.parallel, s.full_name"
        }
    };
    let binds: Vec<&String> = course_id.iter().collect();
    let mut stmt = conn
        .prepare(sql)
        .map_err(db_err("db_query_failed", "students"))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed", "students"))?;

    let mut csv = String::from("cedula,full_name,birth_date,course,parallel\n");
    let rows_exported = rows.len();
    for (cedula, full_name, birth_date, course, parallel) in rows {
        csv.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_quote(&cedula),
            csv_quote(&full_name),
            csv_quote(&birth_date.unwrap_or_default()),
            csv_quote(&course.unwrap_or_default()),
            csv_quote(&parallel.unwrap_or_default()),
        ));
    }

    write_csv(&out_path, csv)?;
    Ok(json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }))
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256,
        }),
    )
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }
    if let Err(e) = std::fs::create_dir_all(&workspace_path) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    // Drop the open handle before the imported file replaces it.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected,
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        "exchange.exportCasesCsv" => Some(with_conn(state, req, export_cases_csv)),
        "exchange.exportRosterCsv" => Some(with_conn(state, req, export_roster_csv)),
        _ => None,
    }
}
