use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "school.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schools(
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT,
            phone TEXT,
            email TEXT,
            admin_password_hash TEXT NOT NULL,
            current_academic_year_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings(
            school_code TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY(school_code, key),
            FOREIGN KEY(school_code) REFERENCES schools(code)
        );

        CREATE TABLE IF NOT EXISTS sequences(
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            value INTEGER NOT NULL,
            PRIMARY KEY(school_code, name),
            FOREIGN KEY(school_code) REFERENCES schools(code)
        );

        CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'planned',
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            UNIQUE(school_code, name)
        );
        CREATE INDEX IF NOT EXISTS idx_academic_years_school ON academic_years(school_code);

        CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            UNIQUE(school_code, name, section)
        );

        CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            admission_no TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            class_id TEXT,
            date_of_birth TEXT,
            gender TEXT,
            guardian_name TEXT,
            guardian_phone TEXT,
            address TEXT,
            photo_path TEXT,
            password_hash TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(school_code, admission_no)
        );
        CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_code);
        CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id);

        CREATE TABLE IF NOT EXISTS student_class_history(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            student_id TEXT NOT NULL,
            from_class_id TEXT,
            to_class_id TEXT,
            academic_year_id TEXT,
            outcome TEXT NOT NULL,
            moved_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        );
        CREATE INDEX IF NOT EXISTS idx_student_class_history_student ON student_class_history(student_id);

        CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            employee_code TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            role_kind TEXT NOT NULL,
            designation TEXT,
            phone TEXT,
            email TEXT,
            joining_date TEXT,
            password_hash TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            UNIQUE(school_code, employee_code)
        );
        CREATE INDEX IF NOT EXISTS idx_staff_school ON staff(school_code);

        CREATE TABLE IF NOT EXISTS roles(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            UNIQUE(school_code, name)
        );
        CREATE TABLE IF NOT EXISTS role_permissions(
            role_id TEXT NOT NULL,
            module TEXT NOT NULL,
            sub_module TEXT NOT NULL,
            can_view INTEGER NOT NULL,
            can_edit INTEGER NOT NULL,
            PRIMARY KEY(role_id, module, sub_module),
            FOREIGN KEY(role_id) REFERENCES roles(id)
        );
        CREATE TABLE IF NOT EXISTS staff_roles(
            staff_id TEXT NOT NULL,
            role_id TEXT NOT NULL,
            PRIMARY KEY(staff_id, role_id),
            FOREIGN KEY(staff_id) REFERENCES staff(id),
            FOREIGN KEY(role_id) REFERENCES roles(id)
        );
        CREATE TABLE IF NOT EXISTS staff_permissions(
            staff_id TEXT NOT NULL,
            module TEXT NOT NULL,
            sub_module TEXT NOT NULL,
            can_view INTEGER NOT NULL,
            can_edit INTEGER NOT NULL,
            PRIMARY KEY(staff_id, module, sub_module),
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        );

        CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, date)
        );
        CREATE INDEX IF NOT EXISTS idx_attendance_class_date ON attendance(class_id, date);
        CREATE INDEX IF NOT EXISTS idx_attendance_school_date ON attendance(school_code, date);

        CREATE TABLE IF NOT EXISTS fee_structures(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            due_date TEXT NOT NULL,
            class_id TEXT,
            academic_year_id TEXT,
            grace_days INTEGER NOT NULL DEFAULT 0,
            fine_type TEXT NOT NULL DEFAULT 'none',
            fine_value REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        );
        CREATE TABLE IF NOT EXISTS student_fees(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            fee_structure_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            amount REAL NOT NULL,
            principal_paid REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(fee_structure_id) REFERENCES fee_structures(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(fee_structure_id, student_id)
        );
        CREATE INDEX IF NOT EXISTS idx_student_fees_student ON student_fees(student_id);
        CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            student_fee_id TEXT NOT NULL,
            receipt_no TEXT NOT NULL,
            amount REAL NOT NULL,
            principal_component REAL NOT NULL,
            fine_component REAL NOT NULL,
            method TEXT NOT NULL,
            reference TEXT,
            paid_on TEXT NOT NULL,
            recorded_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_fee_id) REFERENCES student_fees(id),
            UNIQUE(school_code, receipt_no)
        );
        CREATE INDEX IF NOT EXISTS idx_fee_payments_fee ON fee_payments(student_fee_id);

        CREATE TABLE IF NOT EXISTS library_books(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT,
            isbn TEXT,
            copies_total INTEGER NOT NULL,
            copies_available INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code)
        );
        CREATE TABLE IF NOT EXISTS library_loans(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            book_id TEXT NOT NULL,
            student_id TEXT,
            staff_id TEXT,
            issued_on TEXT NOT NULL,
            due_date TEXT NOT NULL,
            returned_on TEXT,
            fine REAL NOT NULL DEFAULT 0,
            FOREIGN KEY(book_id) REFERENCES library_books(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        );
        CREATE INDEX IF NOT EXISTS idx_library_loans_book ON library_loans(book_id);

        CREATE TABLE IF NOT EXISTS transport_routes(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            vehicle_no TEXT,
            driver_name TEXT,
            driver_phone TEXT,
            fare REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            UNIQUE(school_code, name)
        );
        CREATE TABLE IF NOT EXISTS transport_assignments(
            student_id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            route_id TEXT NOT NULL,
            stop_name TEXT,
            assigned_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(route_id) REFERENCES transport_routes(id)
        );

        CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            name TEXT NOT NULL,
            class_id TEXT NOT NULL,
            academic_year_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_code) REFERENCES schools(code),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        );
        CREATE TABLE IF NOT EXISTS exam_subjects(
            exam_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_marks REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(exam_id, name),
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        );
        CREATE TABLE IF NOT EXISTS exam_marks(
            exam_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            student_id TEXT NOT NULL,
            marks_obtained REAL NOT NULL,
            PRIMARY KEY(exam_id, subject, student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        );

        CREATE TABLE IF NOT EXISTS certificates(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            student_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            serial_no TEXT NOT NULL,
            remarks TEXT,
            status TEXT NOT NULL DEFAULT 'issued',
            issued_on TEXT NOT NULL,
            issued_by TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(school_code, serial_no)
        );

        CREATE TABLE IF NOT EXISTS leave_requests(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            from_date TEXT NOT NULL,
            to_date TEXT NOT NULL,
            days INTEGER NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            decided_by TEXT,
            decision_note TEXT,
            created_at TEXT NOT NULL,
            decided_at TEXT,
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        );

        CREATE TABLE IF NOT EXISTS gate_passes(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            student_id TEXT NOT NULL,
            serial_no TEXT NOT NULL,
            reason TEXT NOT NULL,
            guardian_name TEXT NOT NULL,
            out_time TEXT,
            issued_by TEXT NOT NULL,
            issued_on TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(school_code, serial_no)
        );

        CREATE TABLE IF NOT EXISTS audit_logs(
            id TEXT PRIMARY KEY,
            school_code TEXT NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id TEXT,
            details TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_logs_school ON audit_logs(school_code, created_at);",
    )?;

    // Workspaces created before fine tracking have no fine_paid column.
    ensure_student_fees_fine_paid(conn)?;

    Ok(())
}

fn ensure_student_fees_fine_paid(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_fees", "fine_paid")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE student_fees ADD COLUMN fine_paid REAL NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
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

pub fn settings_get_json(
    conn: &Connection,
    school_code: &str,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE school_code = ? AND key = ?",
            (school_code, key),
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    school_code: &str,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(school_code, key, value_json) VALUES(?, ?, ?)
         ON CONFLICT(school_code, key) DO UPDATE SET value_json = excluded.value_json",
        (school_code, key, value.to_string()),
    )?;
    Ok(())
}

/// Next value of a per-school counter, starting at 1.
pub fn next_sequence(conn: &Connection, school_code: &str, name: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO sequences(school_code, name, value) VALUES(?, ?, 1)
         ON CONFLICT(school_code, name) DO UPDATE SET value = value + 1",
        (school_code, name),
    )?;
    conn.query_row(
        "SELECT value FROM sequences WHERE school_code = ? AND name = ?",
        (school_code, name),
        |r| r.get(0),
    )
}

fn constraint_extended_code(e: &rusqlite::Error) -> Option<std::os::raw::c_int> {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(f.extended_code)
        }
        _ => None,
    }
}

/// UNIQUE or PRIMARY KEY collision.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        constraint_extended_code(e),
        Some(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

pub fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    constraint_extended_code(e) == Some(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}

#[cfg(test)]
pub fn memory_db() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}

#[cfg(test)]
pub fn seed_school(conn: &Connection, code: &str) {
    conn.execute(
        "INSERT INTO schools(code, name, admin_password_hash, created_at) VALUES(?, ?, 'x', '2024-01-01T00:00:00Z')",
        (code, format!("{} School", code)),
    )
    .expect("seed school");
}
