use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, now_rfc3339, today};
use crate::db;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_date, optional_str, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn gate_passes_issue(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    let reason = required_str(params, "reason")?;
    let guardian_name = required_str(params, "guardianName")?;
    let out_time = optional_str(params, "outTime").unwrap_or_else(now_rfc3339);

    let actor = caller.actor();
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let seq = db::next_sequence(&tx, school, "gate_pass")
        .map_err(db_write("db_update_failed", "sequences"))?;
    let serial = format!("{}-GP{}", school, seq);
    let pass_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO gate_passes(id, school_code, student_id, serial_no, reason, guardian_name, out_time, issued_by, issued_on)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &pass_id,
            school,
            &student_id,
            &serial,
            &reason,
            &guardian_name,
            &out_time,
            &actor,
            format_date(today()),
        ],
    )
    .map_err(db_write("db_insert_failed", "gate_passes"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &actor,
            action: "gatePasses.issue",
            entity: "gate_pass",
            entity_id: Some(&pass_id),
            details: Some(json!({ "serialNo": serial, "studentId": student_id })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "gatePassId": pass_id, "serialNo": serial, "outTime": out_time }))
}

fn gate_passes_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let date = optional_date(params, "date")?.map(format_date);
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.serial_no, g.student_id, s.admission_no,
                    s.last_name || ', ' || s.first_name, g.reason, g.guardian_name,
                    g.out_time, g.issued_by, g.issued_on
             FROM gate_passes g JOIN students s ON s.id = g.student_id
             WHERE g.school_code = ?1 AND (?2 IS NULL OR g.issued_on = ?2)
             ORDER BY g.issued_on DESC, g.rowid DESC",
        )
        .map_err(db_query)?;
    let passes = stmt
        .query_map((school, date), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "serialNo": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "admissionNo": r.get::<_, String>(3)?,
                "displayName": r.get::<_, String>(4)?,
                "reason": r.get::<_, String>(5)?,
                "guardianName": r.get::<_, String>(6)?,
                "outTime": r.get::<_, Option<String>>(7)?,
                "issuedBy": r.get::<_, String>(8)?,
                "issuedOn": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "gatePasses": passes }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "gatePasses.issue" => gate_passes_issue,
        "gatePasses.list" => gate_passes_list,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
