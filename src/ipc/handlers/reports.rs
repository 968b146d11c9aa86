use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, today};
use crate::export::{write_table, ExportFormat, Table};
use crate::ipc::error::{db_query, HandlerErr};
use crate::ipc::handlers::fees;
use crate::ipc::helpers::{ensure_exists, optional_date, optional_str, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

pub const KINDS: &[&str] = &["students", "staff", "attendance", "fees"];

fn collect_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    width: usize,
) -> Result<Vec<Vec<String>>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(db_query)?;
    let rows = stmt
        .query_map(params, |r| {
            (0..width)
                .map(|i| r.get::<_, Option<String>>(i).map(|v| v.unwrap_or_default()))
                .collect::<Result<Vec<_>, _>>()
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

fn students_table(conn: &Connection, school: &str, class_id: Option<&str>) -> Result<Table, HandlerErr> {
    let mut table = Table::new(&[
        "admission_no",
        "last_name",
        "first_name",
        "class",
        "section",
        "date_of_birth",
        "gender",
        "guardian_name",
        "guardian_phone",
        "address",
        "status",
    ]);
    table.rows = collect_rows(
        conn,
        "SELECT s.admission_no, s.last_name, s.first_name, c.name, c.section, s.date_of_birth,
                s.gender, s.guardian_name, s.guardian_phone, s.address, s.status
         FROM students s LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.school_code = ?1 AND (?2 IS NULL OR s.class_id = ?2)
         ORDER BY c.name, c.section, s.last_name, s.first_name",
        (school, class_id),
        table.headers.len(),
    )?;
    Ok(table)
}

fn staff_table(conn: &Connection, school: &str) -> Result<Table, HandlerErr> {
    let mut table = Table::new(&[
        "employee_code",
        "last_name",
        "first_name",
        "role_kind",
        "designation",
        "phone",
        "email",
        "joining_date",
        "status",
    ]);
    table.rows = collect_rows(
        conn,
        "SELECT employee_code, last_name, first_name, role_kind, designation, phone, email,
                joining_date, status
         FROM staff WHERE school_code = ?
         ORDER BY last_name, first_name",
        [school],
        table.headers.len(),
    )?;
    Ok(table)
}

fn attendance_table(
    conn: &Connection,
    school: &str,
    class_id: Option<&str>,
    from: Option<String>,
    to: Option<String>,
) -> Result<Table, HandlerErr> {
    let mut table = Table::new(&["date", "admission_no", "student", "class", "status", "marked_by"]);
    table.rows = collect_rows(
        conn,
        "SELECT a.date, s.admission_no, s.last_name || ', ' || s.first_name, c.name, a.status, a.marked_by
         FROM attendance a
         JOIN students s ON s.id = a.student_id
         JOIN classes c ON c.id = a.class_id
         WHERE a.school_code = ?1
           AND (?2 IS NULL OR a.class_id = ?2)
           AND (?3 IS NULL OR a.date >= ?3)
           AND (?4 IS NULL OR a.date <= ?4)
         ORDER BY a.date, c.name, s.last_name, s.first_name",
        (school, class_id, from, to),
        table.headers.len(),
    )?;
    Ok(table)
}

/// Adds the format's extension when `raw` has none.
fn resolve_out_path(raw: &str, format: ExportFormat) -> PathBuf {
    let mut path = PathBuf::from(raw);
    if path.extension().is_none() {
        path.set_extension(format.extension());
    }
    path
}

fn reports_export(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let kind = required_str(params, "kind")?.to_ascii_lowercase();
    let format: ExportFormat = optional_str(params, "format")
        .unwrap_or_default()
        .parse()
        .map_err(|e: anyhow::Error| HandlerErr::bad_params(e.to_string()))?;
    let out_path = resolve_out_path(&required_str(params, "outPath")?, format);
    let class_id = optional_str(params, "classId");
    if let Some(c) = class_id.as_deref() {
        ensure_exists(conn, "classes", "class", school, c)?;
    }
    let from = optional_date(params, "from")?;
    let to = optional_date(params, "to")?;

    let table = match kind.as_str() {
        "students" => students_table(conn, school, class_id.as_deref())?,
        "staff" => staff_table(conn, school)?,
        "attendance" => attendance_table(
            conn,
            school,
            class_id.as_deref(),
            from.map(format_date),
            to.map(format_date),
        )?,
        "fees" => fees::export_table(conn, school, class_id.as_deref(), to.unwrap_or_else(today))?,
        other => {
            return Err(HandlerErr::bad_params(format!("unknown report kind: {}", other))
                .with_details(json!({ "allowed": KINDS })))
        }
    };

    write_table(&table, format, &out_path).map_err(|e| {
        HandlerErr::new("io_failed", format!("{:#}", e))
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    tracing::info!(school, kind = %kind, rows = table.rows.len(), path = %out_path.display(), "report exported");

    let file_name = out_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "reports.export",
            entity: "report",
            entity_id: None,
            details: Some(json!({ "kind": kind, "rows": table.rows.len(), "fileName": file_name })),
        },
    );
    Ok(json!({
        "path": out_path.to_string_lossy(),
        "rowsExported": table.rows.len(),
        "fileName": file_name,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "reports.export" => reports_export,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
