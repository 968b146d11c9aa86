use crate::audit::{self, AuditEntry};
use crate::dates::{days_between, format_date, now_rfc3339};
use crate::ipc::error::{db_query, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_str, required_date, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use crate::session::Role;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: &[&str] = &["pending", "approved", "rejected"];

/// Calendar days covered by a leave, both ends included.
pub fn leave_days(from: NaiveDate, to: NaiveDate) -> i64 {
    days_between(from, to) + 1
}

fn leave_request(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = caller.session()?;
    let school = session.school_code.as_str();
    let staff_id = match session.role {
        Role::School => required_str(params, "staffId")?,
        // Staff may only ask for themselves.
        _ => session.subject_id.clone(),
    };
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let from = required_date(params, "fromDate")?;
    let to = required_date(params, "toDate")?;
    if from > to {
        return Err(HandlerErr::bad_params("fromDate must not be after toDate"));
    }
    let reason = required_str(params, "reason")?;
    let days = leave_days(from, to);

    let overlapping: Option<String> = conn
        .query_row(
            "SELECT id FROM leave_requests
             WHERE staff_id = ? AND status != 'rejected'
               AND from_date <= ? AND to_date >= ?
             LIMIT 1",
            (&staff_id, format_date(to), format_date(from)),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if let Some(existing) = overlapping {
        return Err(HandlerErr::bad_params("overlaps an existing leave request")
            .with_details(json!({ "leaveId": existing })));
    }

    let leave_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO leave_requests(id, school_code, staff_id, from_date, to_date, days, reason, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        rusqlite::params![
            &leave_id,
            school,
            &staff_id,
            format_date(from),
            format_date(to),
            days,
            &reason,
            now_rfc3339(),
        ],
    )
    .map_err(db_write("db_insert_failed", "leave_requests"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "leave.request",
            entity: "leave",
            entity_id: Some(&leave_id),
            details: Some(json!({ "staffId": staff_id, "days": days })),
        },
    );
    Ok(json!({ "leaveId": leave_id, "days": days, "status": "pending" }))
}

fn leave_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = caller.session()?;
    let school = session.school_code.as_str();
    let status = optional_str(params, "status").map(|s| s.to_ascii_lowercase());
    if let Some(s) = status.as_deref() {
        if !STATUSES.contains(&s) {
            return Err(HandlerErr::bad_params(format!("unknown leave status: {}", s)));
        }
    }
    let own_only = match session.role {
        Role::School => optional_str(params, "staffId"),
        _ => Some(session.subject_id.clone()),
    };

    let mut stmt = conn
        .prepare(
            "SELECT l.id, l.staff_id, st.employee_code, st.last_name || ', ' || st.first_name,
                    l.from_date, l.to_date, l.days, l.reason, l.status,
                    l.decided_by, l.decision_note, l.created_at, l.decided_at
             FROM leave_requests l JOIN staff st ON st.id = l.staff_id
             WHERE l.school_code = ?1
               AND (?2 IS NULL OR l.status = ?2)
               AND (?3 IS NULL OR l.staff_id = ?3)
             ORDER BY l.created_at DESC",
        )
        .map_err(db_query)?;
    let requests = stmt
        .query_map((school, status, own_only), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "staffId": r.get::<_, String>(1)?,
                "employeeCode": r.get::<_, String>(2)?,
                "displayName": r.get::<_, String>(3)?,
                "fromDate": r.get::<_, String>(4)?,
                "toDate": r.get::<_, String>(5)?,
                "days": r.get::<_, i64>(6)?,
                "reason": r.get::<_, String>(7)?,
                "status": r.get::<_, String>(8)?,
                "decidedBy": r.get::<_, Option<String>>(9)?,
                "decisionNote": r.get::<_, Option<String>>(10)?,
                "createdAt": r.get::<_, String>(11)?,
                "decidedAt": r.get::<_, Option<String>>(12)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "leaveRequests": requests }))
}

fn leave_decide(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let leave_id = required_str(params, "leaveId")?;
    let decision = required_str(params, "decision")?.to_ascii_lowercase();
    if decision != "approved" && decision != "rejected" {
        return Err(HandlerErr::bad_params("decision must be approved or rejected"));
    }
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM leave_requests WHERE school_code = ? AND id = ?",
            (school, &leave_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    match status.as_deref() {
        None => return Err(HandlerErr::not_found("leave request")),
        Some("pending") => {}
        Some(other) => {
            return Err(HandlerErr::bad_params(format!("leave request already {}", other)))
        }
    }

    let actor = caller.actor();
    conn.execute(
        "UPDATE leave_requests
         SET status = ?, decided_by = ?, decision_note = ?, decided_at = ?
         WHERE id = ? AND status = 'pending'",
        (
            &decision,
            &actor,
            optional_str(params, "note"),
            now_rfc3339(),
            &leave_id,
        ),
    )
    .map_err(db_write("db_update_failed", "leave_requests"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &actor,
            action: "leave.decide",
            entity: "leave",
            entity_id: Some(&leave_id),
            details: Some(json!({ "decision": decision })),
        },
    );
    Ok(json!({ "leaveId": leave_id, "status": decision }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "leave.request" => leave_request,
        "leave.list" => leave_list,
        "leave.decide" => leave_decide,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_day_leave_counts_one() {
        let d = NaiveDate::from_ymd_opt(2024, 7, 1).expect("date");
        assert_eq!(leave_days(d, d), 1);
        let end = NaiveDate::from_ymd_opt(2024, 7, 5).expect("date");
        assert_eq!(leave_days(d, end), 5);
    }
}
