use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, now_rfc3339};
use crate::grading::round_off_2_decimals;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_str, required_date, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

pub const STATUSES: &[&str] = &["present", "absent", "late", "leave"];

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Tally {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub leave: i64,
}

impl Tally {
    pub fn add(&mut self, status: &str, n: i64) {
        match status {
            "present" => self.present += n,
            "absent" => self.absent += n,
            "late" => self.late += n,
            "leave" => self.leave += n,
            _ => {}
        }
    }

    pub fn marked(&self) -> i64 {
        self.present + self.absent + self.late + self.leave
    }

    /// Late arrivals count as attended; nothing marked yields 0.
    pub fn percentage(&self) -> f64 {
        let marked = self.marked();
        if marked == 0 {
            return 0.0;
        }
        round_off_2_decimals((self.present + self.late) as f64 / marked as f64 * 100.0)
    }

    fn to_json(self) -> serde_json::Value {
        json!({
            "present": self.present,
            "absent": self.absent,
            "late": self.late,
            "leave": self.leave,
            "marked": self.marked(),
            "percentage": self.percentage(),
        })
    }
}

fn tally_for(
    conn: &Connection,
    school: &str,
    student_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Tally, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT status, COUNT(*) FROM attendance
             WHERE school_code = ?1 AND student_id = ?2
               AND (?3 IS NULL OR date >= ?3)
               AND (?4 IS NULL OR date <= ?4)
             GROUP BY status",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map(
            (school, student_id, from.map(format_date), to.map(format_date)),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let mut tally = Tally::default();
    for (status, n) in rows {
        tally.add(&status, n);
    }
    Ok(tally)
}

/// Attendance counts for one student, optionally bounded by date.
pub fn student_totals(
    conn: &Connection,
    school: &str,
    student_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<serde_json::Value, HandlerErr> {
    Ok(tally_for(conn, school, student_id, from, to)?.to_json())
}

/// Share of today's marks that are present or late, over the whole school.
pub fn school_day_percentage(
    conn: &Connection,
    school: &str,
    date: NaiveDate,
) -> Result<Option<f64>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT status, COUNT(*) FROM attendance
             WHERE school_code = ? AND date = ? GROUP BY status",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map((school, format_date(date)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let mut tally = Tally::default();
    for (status, n) in rows {
        tally.add(&status, n);
    }
    Ok((tally.marked() > 0).then(|| tally.percentage()))
}

fn class_roster(
    conn: &Connection,
    school: &str,
    class_id: &str,
) -> Result<Vec<(String, String, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, admission_no, last_name || ', ' || first_name
             FROM students
             WHERE school_code = ? AND class_id = ? AND status = 'active'
             ORDER BY last_name, first_name",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map((school, class_id), |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

fn attendance_mark(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let class_id = required_str(params, "classId")?;
    ensure_exists(conn, "classes", "class", school, &class_id)?;
    let date = format_date(required_date(params, "date")?);
    let entries = params
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing entries"))?;

    let members: HashSet<String> = class_roster(conn, school, &class_id)?
        .into_iter()
        .map(|(id, _, _)| id)
        .collect();

    let mut parsed = Vec::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        let student_id = required_str(e, "studentId")?;
        let status = required_str(e, "status")?.to_ascii_lowercase();
        if !STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params(format!("invalid status: {}", status))
                .with_details(json!({ "index": i, "allowed": STATUSES })));
        }
        parsed.push((student_id, status));
    }

    let actor = caller.actor();
    let now = now_rfc3339();
    let mut saved = 0usize;
    let mut skipped = Vec::new();
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (student_id, status) in parsed {
        if !members.contains(&student_id) {
            skipped.push(student_id);
            continue;
        }
        tx.execute(
            "INSERT INTO attendance(id, school_code, student_id, class_id, date, status, marked_by, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               status = excluded.status,
               class_id = excluded.class_id,
               marked_by = excluded.marked_by,
               updated_at = excluded.updated_at",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                school,
                &student_id,
                &class_id,
                &date,
                &status,
                &actor,
                &now,
            ],
        )
        .map_err(db_write("db_insert_failed", "attendance"))?;
        saved += 1;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &actor,
            action: "attendance.mark",
            entity: "class",
            entity_id: Some(&class_id),
            details: Some(json!({ "date": date, "saved": saved, "skipped": skipped.len() })),
        },
    );
    tx.commit().map_err(db_commit)?;

    Ok(json!({ "saved": saved, "skipped": skipped }))
}

fn attendance_day(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let class_id = required_str(params, "classId")?;
    ensure_exists(conn, "classes", "class", school, &class_id)?;
    let date = format_date(required_date(params, "date")?);

    let mut stmt = conn
        .prepare("SELECT status FROM attendance WHERE student_id = ? AND date = ?")
        .map_err(db_query)?;
    let mut rows = Vec::new();
    for (student_id, admission_no, name) in class_roster(conn, school, &class_id)? {
        let status: Option<String> = stmt
            .query_row((&student_id, &date), |r| r.get(0))
            .optional()
            .map_err(db_query)?;
        rows.push(json!({
            "studentId": student_id,
            "admissionNo": admission_no,
            "displayName": name,
            "status": status,
        }));
    }
    Ok(json!({ "classId": class_id, "date": date, "students": rows }))
}

fn attendance_summary(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let from = required_date(params, "from")?;
    let to = required_date(params, "to")?;
    if from > to {
        return Err(HandlerErr::bad_params("from must not be after to"));
    }

    let students: Vec<(String, String, String)> =
        match (optional_str(params, "studentId"), optional_str(params, "classId")) {
            (Some(student_id), _) => {
                let row = conn
                    .query_row(
                        "SELECT id, admission_no, last_name || ', ' || first_name
                         FROM students WHERE school_code = ? AND id = ?",
                        (school, &student_id),
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("student"),
                        other => db_query(other),
                    })?;
                vec![row]
            }
            (None, Some(class_id)) => {
                ensure_exists(conn, "classes", "class", school, &class_id)?;
                class_roster(conn, school, &class_id)?
            }
            (None, None) => return Err(HandlerErr::bad_params("pass studentId or classId")),
        };

    let mut rows = Vec::with_capacity(students.len());
    for (student_id, admission_no, name) in students {
        let mut row = tally_for(conn, school, &student_id, Some(from), Some(to))?.to_json();
        row["studentId"] = json!(student_id);
        row["admissionNo"] = json!(admission_no);
        row["displayName"] = json!(name);
        rows.push(row);
    }
    Ok(json!({
        "from": format_date(from),
        "to": format_date(to),
        "students": rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "attendance.mark" => attendance_mark,
        "attendance.day" => attendance_day,
        "attendance.summary" => attendance_summary,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_counts_as_attended() {
        let mut t = Tally::default();
        t.add("present", 6);
        t.add("late", 1);
        t.add("absent", 2);
        t.add("leave", 0);
        t.add("unknown", 5);
        assert_eq!(t.marked(), 9);
        assert_eq!(t.percentage(), 77.78);
    }

    #[test]
    fn nothing_marked_is_zero_percent() {
        assert_eq!(Tally::default().percentage(), 0.0);
    }
}
