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

#[test]
fn one_tutor_per_course_and_tutorship_blocks_delete_first() {
    let workspace = temp_dir("dece-teachers-guard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Decimo", "parallel": "A", "jornada": "matutina" }),
    );
    let course_id = course
        .get("id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();

    // Claiming a course implies the tutor flag.
    let tutor = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "fullName": "Lucia Paredes", "cedula": "1798765432", "tutorOfCourseId": course_id }),
    );
    let tutor_id = tutor
        .get("id")
        .and_then(|v| v.as_str())
        .expect("teacher id")
        .to_string();
    assert_eq!(tutor.get("isTutor").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        tutor.get("tutorCourseName").and_then(|v| v.as_str()),
        Some("Decimo")
    );

    // Second claim on the same course is refused.
    let second = request(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "fullName": "Jorge Mena", "cedula": "1755555555", "tutorOfCourseId": course_id }),
    );
    assert_eq!(error_code(&second), "conflict");
    assert!(second
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("Lucia Paredes"));

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "fullName": "Jorge Mena", "cedula": "1755555555" }),
    );
    let other_id = other
        .get("id")
        .and_then(|v| v.as_str())
        .expect("teacher id")
        .to_string();
    assert_eq!(other.get("isTutor").and_then(|v| v.as_bool()), Some(false));

    // The update path runs the same claim check.
    let claim = request(
        &mut stdin,
        &mut reader,
        "6",
        "teachers.update",
        json!({ "teacherId": other_id, "patch": { "tutorOfCourseId": course_id } }),
    );
    assert_eq!(error_code(&claim), "conflict");

    // Give the tutor a student link as well; the tutorship must still be
    // the reported blocker.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "fullName": "Ana Torres", "cedula": "1787654321", "tutorId": tutor_id }),
    );

    let check = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "teachers.canDelete",
        json!({ "teacherId": tutor_id }),
    );
    assert_eq!(check.get("allowed").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        check.get("reason").and_then(|v| v.as_str()),
        Some("teacher is the tutor of a course")
    );

    let denied = request(
        &mut stdin,
        &mut reader,
        "9",
        "teachers.delete",
        json!({ "teacherId": tutor_id }),
    );
    assert_eq!(error_code(&denied), "delete_blocked");

    // Drop the tutorship; the student link reports next.
    let released = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "teachers.update",
        json!({ "teacherId": tutor_id, "patch": { "tutorOfCourseId": null, "isTutor": false } }),
    );
    assert!(released
        .get("tutorOfCourseId")
        .map(|v| v.is_null())
        .unwrap_or(false));
    assert_eq!(released.get("isTutor").and_then(|v| v.as_bool()), Some(false));

    let check = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "teachers.canDelete",
        json!({ "teacherId": tutor_id }),
    );
    assert_eq!(check.get("allowed").and_then(|v| v.as_bool()), Some(false));
    assert!(check
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("have this teacher as tutor"));
    assert_eq!(check.get("blockingCount").and_then(|v| v.as_i64()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn is_tutor_cannot_be_dropped_while_course_is_held() {
    let workspace = temp_dir("dece-teachers-flag");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Septimo", "parallel": "C", "jornada": "nocturna" }),
    );
    let course_id = course
        .get("id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "fullName": "Rosa Salas", "cedula": "1733333333", "tutorOfCourseId": course_id }),
    );
    let teacher_id = teacher
        .get("id")
        .and_then(|v| v.as_str())
        .expect("teacher id")
        .to_string();

    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.update",
        json!({ "teacherId": teacher_id, "patch": { "isTutor": false } }),
    );
    assert_eq!(error_code(&refused), "validation_failed");
    assert_eq!(
        refused
            .get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.get("field"))
            .and_then(|v| v.as_str()),
        Some("isTutor")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
