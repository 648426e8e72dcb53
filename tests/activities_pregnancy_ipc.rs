use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_deced");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn deced");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn error_field(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("field"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn activity_attendees_sum_and_execution_gates_the_listing() {
    let workspace = temp_dir("dece-activities");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let workshop = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "activities.create",
        json!({
            "topic": "Bullying prevention workshop",
            "date": "2025-04-10",
            "endDate": "2025-04-11",
            "audience": ["students", "parents"],
            "attendeesMale": 12,
            "attendeesFemale": 15,
            "attendeesStaff": 2
        }),
    );
    let workshop_id = workshop.get("id").and_then(|v| v.as_str()).expect("id").to_string();
    assert_eq!(workshop.get("totalAttendees").and_then(|v| v.as_i64()), Some(29));
    assert_eq!(workshop.get("attendeesParents").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(workshop.get("isExecuted").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(workshop.get("audience"), Some(&json!(["students", "parents"])));

    let talk = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "activities.create",
        json!({ "topic": "Substance abuse talk", "date": "2025-05-02" }),
    );
    let talk_id = talk.get("id").and_then(|v| v.as_str()).expect("id").to_string();
    assert_eq!(talk.get("totalAttendees").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(talk.get("audience"), Some(&json!([])));

    let negative = request(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({ "topic": "x", "date": "2025-04-01", "attendeesMale": -3 }),
    );
    assert_eq!(error_code(&negative), "validation_failed");
    assert_eq!(error_field(&negative), "attendeesMale");

    let bad_range = request(
        &mut stdin,
        &mut reader,
        "5",
        "activities.list",
        json!({ "from": "04/01/2025" }),
    );
    assert_eq!(error_code(&bad_range), "validation_failed");
    assert_eq!(error_field(&bad_range), "from");

    // Newest first; nothing executed yet.
    let all = request_ok(&mut stdin, &mut reader, "6", "activities.list", json!({}));
    let ids: Vec<&str> = all
        .get("activities")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|r| r.get("id").and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(ids, vec![talk_id.as_str(), workshop_id.as_str()]);

    let executed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "activities.list",
        json!({ "executedOnly": true }),
    );
    assert_eq!(
        executed
            .get("activities")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "activities.markExecuted",
        json!({ "activityId": workshop_id }),
    );
    assert_eq!(marked.get("isExecuted").and_then(|v| v.as_bool()), Some(true));

    let executed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "activities.list",
        json!({ "executedOnly": true }),
    );
    let rows = executed
        .get("activities")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("id").and_then(|v| v.as_str()),
        Some(workshop_id.as_str())
    );

    // Date window filters.
    let may = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "activities.list",
        json!({ "from": "2025-05-01" }),
    );
    let may_ids: Vec<&str> = may
        .get("activities")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|r| r.get("id").and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(may_ids, vec![talk_id.as_str()]);

    let april = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "activities.list",
        json!({ "to": "2025-04-30" }),
    );
    let april_ids: Vec<&str> = april
        .get("activities")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|r| r.get("id").and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(april_ids, vec![workshop_id.as_str()]);

    let patched = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "activities.update",
        json!({ "activityId": workshop_id, "patch": { "attendeesFemale": 20 } }),
    );
    assert_eq!(patched.get("totalAttendees").and_then(|v| v.as_i64()), Some(34));

    let missing = request(
        &mut stdin,
        &mut reader,
        "13",
        "activities.markExecuted",
        json!({ "activityId": "no-such-activity" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "activities.delete",
        json!({ "activityId": talk_id }),
    );
    assert_eq!(deleted.get("ok").and_then(|v| v.as_bool()), Some(true));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn pregnancy_records_track_case_linkage_and_active_state() {
    let workspace = temp_dir("dece-pregnancy");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "fullName": "Ana Torres", "cedula": "1787654321" }),
    );
    let student_id = student
        .get("id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "fullName": "Maria Solis", "cedula": "1722222222" }),
    );
    let other_id = other
        .get("id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    let case = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "cases.create",
        json!({
            "studentId": student_id,
            "category": "pregnancy",
            "priority": "high",
            "openingDate": "2025-02-18"
        }),
    );
    let case_id = case.get("id").and_then(|v| v.as_str()).expect("case id").to_string();
    let case_code = case
        .get("code")
        .and_then(|v| v.as_str())
        .expect("case code")
        .to_string();

    let record = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "pregnancy.create",
        json!({
            "studentId": student_id,
            "detectionDate": "2025-02-20",
            "expectedDeliveryDate": "2025-09-15",
            "relatedCaseId": case_id,
            "receivesCounseling": true
        }),
    );
    let record_id = record.get("id").and_then(|v| v.as_str()).expect("id").to_string();
    assert_eq!(
        record.get("studentName").and_then(|v| v.as_str()),
        Some("Ana Torres")
    );
    assert_eq!(
        record.get("relatedCaseCode").and_then(|v| v.as_str()),
        Some(case_code.as_str())
    );
    assert_eq!(record.get("isActive").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        record.get("receivesCounseling").and_then(|v| v.as_bool()),
        Some(true)
    );

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "pregnancy.create",
        json!({ "studentId": other_id, "detectionDate": "2025-03-01" }),
    );
    let second_id = second.get("id").and_then(|v| v.as_str()).expect("id").to_string();
    assert!(second.get("relatedCaseId").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        second.get("receivesCounseling").and_then(|v| v.as_bool()),
        Some(false)
    );

    // Closing out a record drops it from the active view and can unlink.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "pregnancy.update",
        json!({
            "pregnancyId": record_id,
            "patch": { "isActive": false, "relatedCaseId": null }
        }),
    );
    assert_eq!(updated.get("isActive").and_then(|v| v.as_bool()), Some(false));
    assert!(updated.get("relatedCaseId").map(|v| v.is_null()).unwrap_or(false));
    assert!(updated
        .get("relatedCaseCode")
        .map(|v| v.is_null())
        .unwrap_or(false));

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "pregnancy.list",
        json!({ "activeOnly": true }),
    );
    let active_ids: Vec<&str> = active
        .get("pregnancyCases")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|r| r.get("id").and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(active_ids, vec![second_id.as_str()]);

    let dangling_student = request(
        &mut stdin,
        &mut reader,
        "9",
        "pregnancy.create",
        json!({ "studentId": "no-such-student", "detectionDate": "2025-03-01" }),
    );
    assert_eq!(error_code(&dangling_student), "validation_failed");
    assert_eq!(error_field(&dangling_student), "studentId");

    let dangling_case = request(
        &mut stdin,
        &mut reader,
        "10",
        "pregnancy.create",
        json!({
            "studentId": student_id,
            "detectionDate": "2025-03-01",
            "relatedCaseId": "no-such-case"
        }),
    );
    assert_eq!(error_code(&dangling_case), "validation_failed");
    assert_eq!(error_field(&dangling_case), "relatedCaseId");

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "11",
        "pregnancy.create",
        json!({ "studentId": student_id, "detectionDate": "20-02-2025" }),
    );
    assert_eq!(error_code(&bad_date), "validation_failed");
    assert_eq!(error_field(&bad_date), "detectionDate");

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "pregnancy.delete",
        json!({ "pregnancyId": second_id }),
    );
    assert_eq!(deleted.get("ok").and_then(|v| v.as_bool()), Some(true));

    let gone = request(
        &mut stdin,
        &mut reader,
        "13",
        "pregnancy.delete",
        json!({ "pregnancyId": second_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}
