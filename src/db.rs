use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "dece.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;

    // Foreign keys are declared for documentation only; the pragma stays
    // off on purpose. Integrity is caller-enforced: dependent-count
    // guards on delete, existence checks on write.

    conn.execute(
        "CREATE TABLE IF NOT EXISTS representatives(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            cedula TEXT NOT NULL,
            phone TEXT,
            address TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_representatives_cedula ON representatives(cedula)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            parallel TEXT NOT NULL,
            jornada TEXT NOT NULL,
            created_at TEXT,
            UNIQUE(name, parallel)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            cedula TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            is_tutor INTEGER NOT NULL DEFAULT 0,
            tutor_of_course_id TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(tutor_of_course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_tutor_course ON teachers(tutor_of_course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_cedula ON teachers(cedula)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            cedula TEXT NOT NULL,
            birth_date TEXT,
            course_id TEXT,
            representative_id TEXT,
            tutor_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(representative_id) REFERENCES representatives(id),
            FOREIGN KEY(tutor_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course ON students(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_representative ON students(representative_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_tutor ON students(tutor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_cedula ON students(cedula)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS case_files(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            student_id TEXT NOT NULL,
            category TEXT NOT NULL,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            opening_date TEXT NOT NULL,
            due_date TEXT,
            description TEXT,
            closing_date TEXT,
            closing_reason TEXT,
            transfer_destination TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_case_files_workflow_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_files_student ON case_files(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_files_status ON case_files(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_files_opening_date ON case_files(opening_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS follow_ups(
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            responsible TEXT NOT NULL,
            participant_types TEXT NOT NULL,
            is_effective INTEGER NOT NULL DEFAULT 0,
            attachment TEXT,
            created_at TEXT,
            FOREIGN KEY(case_id) REFERENCES case_files(id)
        )",
        [],
    )?;
    ensure_follow_ups_attachment(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_follow_ups_case ON follow_ups(case_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_follow_ups_date ON follow_ups(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS appointments(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            attendee_type TEXT NOT NULL,
            attendee_id TEXT NOT NULL,
            student_id TEXT,
            case_id TEXT,
            status TEXT NOT NULL,
            reason TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(case_id) REFERENCES case_files(id)
        )",
        [],
    )?;
    ensure_appointments_case_id(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_appointments_date ON appointments(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_appointments_student ON appointments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_appointments_case ON appointments(case_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS preventive_activities(
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            date TEXT NOT NULL,
            end_date TEXT,
            audience TEXT NOT NULL,
            attendees_male INTEGER NOT NULL DEFAULT 0,
            attendees_female INTEGER NOT NULL DEFAULT 0,
            attendees_staff INTEGER NOT NULL DEFAULT 0,
            attendees_parents INTEGER NOT NULL DEFAULT 0,
            is_executed INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_preventive_activities_date ON preventive_activities(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pregnancy_cases(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            related_case_id TEXT,
            detection_date TEXT NOT NULL,
            expected_delivery_date TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            receives_counseling INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(related_case_id) REFERENCES case_files(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pregnancy_cases_student ON pregnancy_cases(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pregnancy_cases_detection ON pregnancy_cases(detection_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS institution(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            name TEXT NOT NULL DEFAULT '',
            amie_code TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            district TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before the close/transfer workflow lack its columns.
fn ensure_case_files_workflow_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "case_files", "closing_reason")? {
        conn.execute("ALTER TABLE case_files ADD COLUMN closing_reason TEXT", [])?;
    }
    if !table_has_column(conn, "case_files", "transfer_destination")? {
        conn.execute(
            "ALTER TABLE case_files ADD COLUMN transfer_destination TEXT",
            [],
        )?;
    }
    Ok(())
}

fn ensure_follow_ups_attachment(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "follow_ups", "attachment")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE follow_ups ADD COLUMN attachment TEXT", [])?;
    Ok(())
}

// case_id arrived with appointment auto-linking; older rows keep NULL.
fn ensure_appointments_case_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "appointments", "case_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE appointments ADD COLUMN case_id TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, &text),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
