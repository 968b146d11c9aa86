use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, today};
use crate::db;
use crate::export::parse_csv_record;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_str, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const KINDS: &[&str] = &["bonafide", "transfer", "character", "leaving"];

fn parse_kind(raw: &str) -> Option<&'static str> {
    let lower = raw.trim().to_ascii_lowercase();
    KINDS.iter().copied().find(|k| *k == lower)
}

/// Inserts one certificate and returns `(id, serial)`.
fn insert_certificate(
    conn: &Connection,
    school: &str,
    student_id: &str,
    kind: &str,
    remarks: Option<&str>,
    issued_by: &str,
) -> Result<(String, String), HandlerErr> {
    let seq = db::next_sequence(conn, school, &format!("certificate.{}", kind))
        .map_err(db_write("db_update_failed", "sequences"))?;
    let serial = format!("{}/{}/{}", school, kind.to_ascii_uppercase(), seq);
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO certificates(id, school_code, student_id, kind, serial_no, remarks, status, issued_on, issued_by)
         VALUES(?, ?, ?, ?, ?, ?, 'issued', ?, ?)",
        rusqlite::params![
            &id,
            school,
            student_id,
            kind,
            &serial,
            remarks,
            format_date(today()),
            issued_by,
        ],
    )
    .map_err(db_write("db_insert_failed", "certificates"))?;
    Ok((id, serial))
}

fn certificates_issue(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    let raw_kind = required_str(params, "kind")?;
    let kind = parse_kind(&raw_kind).ok_or_else(|| {
        HandlerErr::bad_params(format!("unknown certificate kind: {}", raw_kind))
            .with_details(json!({ "allowed": KINDS }))
    })?;
    let remarks = optional_str(params, "remarks");

    let actor = caller.actor();
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let (id, serial) = insert_certificate(&tx, school, &student_id, kind, remarks.as_deref(), &actor)?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &actor,
            action: "certificates.issue",
            entity: "certificate",
            entity_id: Some(&id),
            details: Some(json!({ "serialNo": serial, "studentId": student_id })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "certificateId": id, "serialNo": serial, "kind": kind }))
}

fn certificates_bulk_issue(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let text = match (params.get("csv").and_then(|v| v.as_str()), optional_str(params, "inPath")) {
        (Some(csv), _) => csv.to_string(),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| HandlerErr::new("io_failed", format!("{}: {}", path, e)))?,
        (None, None) => return Err(HandlerErr::bad_params("pass csv or inPath")),
    };

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Err(HandlerErr::bad_params("csv is empty"));
    };
    let header: Vec<String> = parse_csv_record(header)
        .into_iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    let col = |name: &str| header.iter().position(|h| h == name);
    let (Some(adm_col), Some(kind_col)) = (col("admission_no"), col("kind")) else {
        return Err(HandlerErr::bad_params(
            "csv header must include admission_no and kind",
        ));
    };
    let remarks_col = col("remarks");

    let mut lookup = conn
        .prepare(
            "SELECT id FROM students WHERE school_code = ? AND admission_no = ? AND status = 'active'",
        )
        .map_err(db_query)?;

    let actor = caller.actor();
    let mut issued = Vec::new();
    let mut warnings = Vec::new();
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (line_no, line) in lines {
        let cells = parse_csv_record(line);
        let cell = |i: usize| cells.get(i).map(|s| s.trim()).unwrap_or("");
        let admission_no = cell(adm_col);
        if admission_no.is_empty() {
            warnings.push(json!({ "line": line_no, "message": "missing admission_no" }));
            continue;
        }
        let Some(kind) = parse_kind(cell(kind_col)) else {
            warnings.push(json!({
                "line": line_no,
                "message": format!("unknown certificate kind: {}", cell(kind_col)),
            }));
            continue;
        };
        let student_id: Option<String> = lookup
            .query_row((school, admission_no), |r| r.get(0))
            .optional()
            .map_err(db_query)?;
        let Some(student_id) = student_id else {
            warnings.push(json!({
                "line": line_no,
                "message": format!("no active student with admission number {}", admission_no),
            }));
            continue;
        };
        let remarks = remarks_col.map(cell).filter(|s| !s.is_empty());
        let (id, serial) = insert_certificate(&tx, school, &student_id, kind, remarks, &actor)?;
        issued.push(json!({
            "certificateId": id,
            "serialNo": serial,
            "admissionNo": admission_no,
            "kind": kind,
        }));
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &actor,
            action: "certificates.bulkIssue",
            entity: "certificate",
            entity_id: None,
            details: Some(json!({ "issued": issued.len(), "warnings": warnings.len() })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "issued": issued, "warnings": warnings }))
}

fn certificates_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = optional_str(params, "studentId");
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.student_id, s.admission_no, s.last_name || ', ' || s.first_name,
                    c.kind, c.serial_no, c.remarks, c.status, c.issued_on, c.issued_by
             FROM certificates c JOIN students s ON s.id = c.student_id
             WHERE c.school_code = ?1 AND (?2 IS NULL OR c.student_id = ?2)
             ORDER BY c.issued_on DESC, c.serial_no",
        )
        .map_err(db_query)?;
    let certificates = stmt
        .query_map((school, student_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "admissionNo": r.get::<_, String>(2)?,
                "displayName": r.get::<_, String>(3)?,
                "kind": r.get::<_, String>(4)?,
                "serialNo": r.get::<_, String>(5)?,
                "remarks": r.get::<_, Option<String>>(6)?,
                "status": r.get::<_, String>(7)?,
                "issuedOn": r.get::<_, String>(8)?,
                "issuedBy": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "certificates": certificates }))
}

fn certificates_revoke(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let certificate_id = required_str(params, "certificateId")?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM certificates WHERE school_code = ? AND id = ?",
            (school, &certificate_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    match status.as_deref() {
        None => return Err(HandlerErr::not_found("certificate")),
        Some("revoked") => return Err(HandlerErr::bad_params("certificate already revoked")),
        Some(_) => {}
    }
    conn.execute(
        "UPDATE certificates SET status = 'revoked' WHERE id = ?",
        [&certificate_id],
    )
    .map_err(db_write("db_update_failed", "certificates"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "certificates.revoke",
            entity: "certificate",
            entity_id: Some(&certificate_id),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "certificates.issue" => certificates_issue,
        "certificates.bulkIssue" => certificates_bulk_issue,
        "certificates.list" => certificates_list,
        "certificates.revoke" => certificates_revoke,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
