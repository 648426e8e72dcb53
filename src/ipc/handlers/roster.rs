use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{get_opt_str, parse_csv_record, with_conn_mut};
use crate::ipc::subs::Change;
use crate::ipc::types::{AppState, Request};
use crate::validate;

const EXPECTED_HEADER: [&str; 5] = ["cedula", "full_name", "birth_date", "course", "parallel"];

fn read_csv_text(params: &Value) -> Result<String, HandlerErr> {
    if let Some(text) = get_opt_str(params, "csvText") {
        return Ok(text);
    }
    if let Some(path) = get_opt_str(params, "path") {
        return std::fs::read_to_string(&path).map_err(|e| HandlerErr {
            code: "io_failed",
            message: format!("cannot read {}: {}", path, e),
            details: None,
        });
    }
    Err(HandlerErr::new("bad_params", "missing path or csvText"))
}

/// Column positions for the required roster header. Order is free but
/// the header must be exactly this set of names.
fn header_positions(fields: &[String]) -> Result<HashMap<&'static str, usize>, HandlerErr> {
    let names: Vec<String> = fields.iter().map(|f| f.trim().to_lowercase()).collect();
    let got: HashSet<&str> = names.iter().map(String::as_str).collect();
    let want: HashSet<&str> = EXPECTED_HEADER.into_iter().collect();
    if got != want || names.len() != EXPECTED_HEADER.len() {
        return Err(HandlerErr::validation(
            "header",
            format!("header must be exactly: {}", EXPECTED_HEADER.join(", ")),
        ));
    }
    let mut positions = HashMap::new();
    for key in EXPECTED_HEADER {
        let idx = names.iter().position(|n| n == key).unwrap_or_default();
        positions.insert(key, idx);
    }
    Ok(positions)
}

fn import_csv(conn: &Connection, params: &Value) -> Result<(Value, Vec<Change>), HandlerErr> {
    let text = read_csv_text(params)?;

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header_line)) = lines.next() else {
        return Err(HandlerErr::validation("header", "csv is empty"));
    };
    let positions = header_positions(&parse_csv_record(header_line))?;

    let mut existing_cedulas: HashSet<String> = {
        let mut stmt = conn
            .prepare("SELECT cedula FROM students")
            .map_err(db_err("db_query_failed", "students"))?;
        stmt.query_map([], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
            .map_err(db_err("db_query_failed", "students"))?
    };

    let course_ids: HashMap<(String, String), String> = {
        let mut stmt = conn
            .prepare("SELECT id, name, parallel FROM courses")
            .map_err(db_err("db_query_failed", "courses"))?;
        stmt.query_map([], |r| {
            Ok((
                (r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                r.get::<_, String>(0)?,
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(db_err("db_query_failed", "courses"))?
    };

    // Course tutors carry over to imported students, same as the form
    // derivation would fill them in.
    let course_tutors: HashMap<String, String> = {
        let mut stmt = conn
            .prepare("SELECT tutor_of_course_id, id FROM teachers WHERE tutor_of_course_id IS NOT NULL")
            .map_err(db_err("db_query_failed", "teachers"))?;
        stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
            .map_err(db_err("db_query_failed", "teachers"))?
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut total = 0u64;
    let mut imported = 0u64;
    let mut skipped_duplicates = 0u64;
    let mut warnings: Vec<String> = Vec::new();
    let mut changes: Vec<Change> = Vec::new();

    for (line_no, line) in lines {
        total += 1;
        let record = parse_csv_record(line);
        if record.len() != EXPECTED_HEADER.len() {
            warnings.push(format!(
                "line {}: expected {} fields, got {}",
                line_no,
                EXPECTED_HEADER.len(),
                record.len()
            ));
            continue;
        }
        let field = |key: &str| record[positions[key]].trim().to_string();

        let cedula = field("cedula");
        if validate::validate_cedula(&cedula).is_err() {
            warnings.push(format!("line {}: invalid cedula '{}'", line_no, cedula));
            continue;
        }
        let full_name = field("full_name");
        if full_name.is_empty() {
            warnings.push(format!("line {}: missing full_name", line_no));
            continue;
        }
        let birth_date = field("birth_date");
        let birth_date = if birth_date.is_empty() {
            None
        } else if validate::validate_date(&birth_date).is_err() {
            warnings.push(format!(
                "line {}: invalid birth_date '{}'",
                line_no, birth_date
            ));
            continue;
        } else {
            Some(birth_date)
        };

        let course = field("course");
        let parallel = field("parallel");
        let Some(course_id) = course_ids.get(&(course.clone(), parallel.clone())) else {
            warnings.push(format!(
                "line {}: unknown course '{}' parallel '{}'",
                line_no, course, parallel
            ));
            continue;
        };

        if existing_cedulas.contains(&cedula) {
            skipped_duplicates += 1;
            continue;
        }

        let tutor_id = course_tutors.get(course_id);
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO students(id, full_name, cedula, birth_date, course_id,
                                  representative_id, tutor_id, active, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, NULL, ?, 1,
                    strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                    strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
            (
                &id,
                &full_name,
                &cedula,
                birth_date.as_deref(),
                course_id,
                tutor_id,
            ),
        )
        .map_err(db_err("db_insert_failed", "students"))?;

        changes.push(Change::insert(
            "students",
            &json!({
                "id": id,
                "cedula": &cedula,
                "courseId": course_id,
                "tutorId": tutor_id,
            }),
        ));
        existing_cedulas.insert(cedula);
        imported += 1;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok((
        json!({
            "imported": imported,
            "skippedDuplicates": skipped_duplicates,
            "total": total,
            "warnings": warnings,
        }),
        changes,
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.importCsv" => Some(with_conn_mut(state, req, import_csv)),
        _ => None,
    }
}
