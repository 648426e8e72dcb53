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

fn seed_courses(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let course = request_ok(
        stdin,
        reader,
        "seed-1",
        "courses.create",
        json!({ "name": "Noveno", "parallel": "B", "jornada": "matutina" }),
    );
    let course_id = course
        .get("id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "seed-2",
        "courses.create",
        json!({ "name": "Octavo", "parallel": "A", "jornada": "matutina" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-3",
        "teachers.create",
        json!({
            "fullName": "Lucia Paredes",
            "cedula": "1712345678",
            "tutorOfCourseId": course_id
        }),
    );
}

#[test]
fn roster_import_reports_each_rejected_line_and_fills_tutors() {
    let workspace = temp_dir("dece-roster-import");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_courses(&mut stdin, &mut reader);

    // Header order is free; quoted names keep their commas.
    let csv = "full_name,cedula,course,parallel,birth_date\n\
               \"Torres, Ana\",1787654321,Noveno,B,2010-05-12\n\
               Bruno Vega,1722222222,Octavo,A,\n\
               Carla Nunez,172222222,Octavo,A,2011-01-01\n\
               ,1733333333,Octavo,A,2011-01-01\n\
               Dario Paz,1744444444,Octavo,A,01/02/2011\n\
               Elsa Mora,1755555555,Septimo,C,2011-01-01\n\
               Fausto Rea,1766666666,Octavo,A\n\
               \"Torres, Ana\",1787654321,Noveno,B,2010-05-12\n";

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roster.importCsv",
        json!({ "csvText": csv }),
    );
    assert_eq!(result.get("imported").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        result.get("skippedDuplicates").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(result.get("total").and_then(|v| v.as_u64()), Some(8));

    let warnings: Vec<String> = result
        .get("warnings")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|w| w.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(warnings.len(), 5, "warnings: {:?}", warnings);
    assert!(warnings[0].contains("invalid cedula '172222222'"));
    assert!(warnings[1].contains("missing full_name"));
    assert!(warnings[2].contains("invalid birth_date '01/02/2011'"));
    assert!(warnings[3].contains("unknown course 'Septimo' parallel 'C'"));
    assert!(warnings[4].contains("expected 5 fields, got 4"));

    // The tutored course hands its tutor to the imported student.
    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.list",
        json!({ "search": "1787654321" }),
    );
    let ana = listing
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .expect("imported student");
    assert_eq!(
        ana.get("fullName").and_then(|v| v.as_str()),
        Some("Torres, Ana")
    );
    assert_eq!(ana.get("courseName").and_then(|v| v.as_str()), Some("Noveno"));
    assert_eq!(
        ana.get("tutorName").and_then(|v| v.as_str()),
        Some("Lucia Paredes")
    );
    assert_eq!(ana.get("active").and_then(|v| v.as_bool()), Some(true));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "search": "1722222222" }),
    );
    let bruno = listing
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .expect("imported student");
    assert!(bruno.get("tutorId").map(|v| v.is_null()).unwrap_or(false));
    assert!(bruno.get("birthDate").map(|v| v.is_null()).unwrap_or(false));

    // Re-running the same file only skips; nothing comes in twice.
    let rerun = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "roster.importCsv",
        json!({ "csvText": csv }),
    );
    assert_eq!(rerun.get("imported").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        rerun.get("skippedDuplicates").and_then(|v| v.as_u64()),
        Some(3)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn roster_import_rejects_wrong_headers_and_reads_from_disk() {
    let workspace = temp_dir("dece-roster-paths");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_courses(&mut stdin, &mut reader);

    let wrong_header = request(
        &mut stdin,
        &mut reader,
        "2",
        "roster.importCsv",
        json!({ "csvText": "cedula,name,birth_date,course,parallel\n1787654321,Ana,,Noveno,B\n" }),
    );
    assert_eq!(error_code(&wrong_header), "validation_failed");
    assert_eq!(
        wrong_header
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str()),
        Some("header must be exactly: cedula, full_name, birth_date, course, parallel")
    );

    let extra_column = request(
        &mut stdin,
        &mut reader,
        "3",
        "roster.importCsv",
        json!({ "csvText": "cedula,full_name,birth_date,course,parallel,email\n" }),
    );
    assert_eq!(error_code(&extra_column), "validation_failed");

    // Header-only file is a clean no-op.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.importCsv",
        json!({ "csvText": "cedula,full_name,birth_date,course,parallel\n" }),
    );
    assert_eq!(empty.get("imported").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(empty.get("total").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        empty.get("warnings").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // Same importer, file on disk instead of inline text.
    let csv_path = workspace.join("roster.csv");
    std::fs::write(
        &csv_path,
        "cedula,full_name,birth_date,course,parallel\n1787654321,Ana Torres,2010-05-12,Noveno,B\n",
    )
    .expect("write roster csv");
    let from_disk = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "roster.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );
    assert_eq!(from_disk.get("imported").and_then(|v| v.as_u64()), Some(1));

    let missing_file = request(
        &mut stdin,
        &mut reader,
        "6",
        "roster.importCsv",
        json!({ "path": workspace.join("nope.csv").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing_file), "io_failed");

    let no_source = request(&mut stdin, &mut reader, "7", "roster.importCsv", json!({}));
    assert_eq!(error_code(&no_source), "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
