use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, now_rfc3339, parse_date, today};
use crate::db;
use crate::export::Table;
use crate::fees::{allocate_payment, fee_status, late_fee, FeeStatus, FinePolicy, FineType};
use crate::grading::round_off_2_decimals;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{
    ensure_exists, optional_date, optional_f64, optional_i64, optional_str, required_date,
    required_f64, required_str, run, string_list, Handler,
};
use crate::ipc::types::{AppState, Caller, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const PAYMENT_METHODS: &[&str] = &["cash", "card", "bank", "upi", "cheque", "online"];

/// One assigned fee with everything needed to price it on a given day.
#[derive(Debug, Clone)]
struct FeeLine {
    student_fee_id: String,
    student_id: String,
    name: String,
    amount: f64,
    principal_paid: f64,
    fine_paid: f64,
    due_date: NaiveDate,
    policy: FinePolicy,
}

#[derive(Debug, Clone, Copy)]
struct Priced {
    balance: f64,
    days_late: i64,
    late_fee: f64,
    fine_due: f64,
    total_due: f64,
    status: FeeStatus,
}

impl FeeLine {
    fn price(&self, as_of: NaiveDate) -> Priced {
        let balance = round_off_2_decimals((self.amount - self.principal_paid).max(0.0));
        let fee = late_fee(&self.policy, self.due_date, balance, as_of);
        let fine_due = round_off_2_decimals((fee.amount - self.fine_paid).max(0.0));
        Priced {
            balance,
            days_late: fee.days_late,
            late_fee: fee.amount,
            fine_due,
            total_due: round_off_2_decimals(balance + fine_due),
            status: fee_status(balance, self.principal_paid, fee.days_late),
        }
    }

    fn to_json(&self, as_of: NaiveDate) -> serde_json::Value {
        let p = self.price(as_of);
        json!({
            "studentFeeId": self.student_fee_id,
            "name": self.name,
            "amount": self.amount,
            "paid": round_off_2_decimals(self.principal_paid + self.fine_paid),
            "finePaid": self.fine_paid,
            "balance": p.balance,
            "dueDate": format_date(self.due_date),
            "daysLate": p.days_late,
            "lateFee": p.late_fee,
            "totalDue": p.total_due,
            "status": p.status.as_str(),
        })
    }
}

const FEE_LINE_SELECT: &str = "SELECT sf.id, sf.student_id, fs.name, sf.amount, sf.principal_paid, sf.fine_paid,
        fs.due_date, fs.fine_type, fs.fine_value, fs.grace_days
     FROM student_fees sf
     JOIN fee_structures fs ON fs.id = sf.fee_structure_id";

fn fee_line_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeeLine> {
    let due_raw: String = r.get(6)?;
    let fine_raw: String = r.get(7)?;
    // Both columns are written through the validated create path.
    let due_date = parse_date(&due_raw).unwrap_or(NaiveDate::MIN);
    let fine_type = fine_raw.parse().unwrap_or(FineType::None);
    Ok(FeeLine {
        student_fee_id: r.get(0)?,
        student_id: r.get(1)?,
        name: r.get(2)?,
        amount: r.get(3)?,
        principal_paid: r.get(4)?,
        fine_paid: r.get(5)?,
        due_date,
        policy: FinePolicy {
            fine_type,
            value: r.get(8)?,
            grace_days: r.get(9)?,
        },
    })
}

fn load_lines(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<FeeLine>, HandlerErr> {
    let sql = format!("{} {} ORDER BY fs.due_date, fs.name", FEE_LINE_SELECT, where_clause);
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let rows = stmt
        .query_map(params, fee_line_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

/// Priced fee lines for one student, as rendered by `fees.student`.
pub fn student_fee_lines(
    conn: &Connection,
    school: &str,
    student_id: &str,
    as_of: NaiveDate,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let lines = load_lines(
        conn,
        "WHERE sf.school_code = ? AND sf.student_id = ?",
        (school, student_id),
    )?;
    Ok(lines.iter().map(|l| l.to_json(as_of)).collect())
}

/// Collected and outstanding totals across the school.
pub fn school_totals(conn: &Connection, school: &str, as_of: NaiveDate) -> Result<(f64, f64), HandlerErr> {
    let collected: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM fee_payments WHERE school_code = ?",
            [school],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    let lines = load_lines(conn, "WHERE sf.school_code = ?", [school])?;
    let outstanding: f64 = lines.iter().map(|l| l.price(as_of).total_due).sum();
    Ok((
        round_off_2_decimals(collected),
        round_off_2_decimals(outstanding),
    ))
}

/// One row per assigned fee, priced as of `as_of`, for spreadsheet export.
pub fn export_table(
    conn: &Connection,
    school: &str,
    class_id: Option<&str>,
    as_of: NaiveDate,
) -> Result<Table, HandlerErr> {
    let lines = load_lines(
        conn,
        "JOIN students s ON s.id = sf.student_id
         WHERE sf.school_code = ?1 AND (?2 IS NULL OR s.class_id = ?2)",
        (school, class_id),
    )?;
    let mut stmt = conn
        .prepare("SELECT admission_no, last_name || ', ' || first_name FROM students WHERE id = ?")
        .map_err(db_query)?;
    let mut table = Table::new(&[
        "admission_no",
        "student",
        "fee",
        "due_date",
        "amount",
        "paid",
        "balance",
        "late_fee",
        "total_due",
        "status",
    ]);
    for line in &lines {
        let (admission_no, name): (String, String) = stmt
            .query_row([&line.student_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(db_query)?;
        let p = line.price(as_of);
        table.rows.push(vec![
            admission_no,
            name,
            line.name.clone(),
            format_date(line.due_date),
            format!("{:.2}", line.amount),
            format!("{:.2}", line.principal_paid + line.fine_paid),
            format!("{:.2}", p.balance),
            format!("{:.2}", p.late_fee),
            format!("{:.2}", p.total_due),
            p.status.as_str().to_string(),
        ]);
    }
    Ok(table)
}

fn structures_list(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let mut stmt = conn
        .prepare(
            "SELECT fs.id, fs.name, fs.amount, fs.due_date, fs.class_id, fs.academic_year_id,
                    fs.grace_days, fs.fine_type, fs.fine_value,
                    (SELECT COUNT(*) FROM student_fees sf WHERE sf.fee_structure_id = fs.id)
             FROM fee_structures fs
             WHERE fs.school_code = ?
             ORDER BY fs.due_date, fs.name",
        )
        .map_err(db_query)?;
    let structures = stmt
        .query_map([school], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "amount": r.get::<_, f64>(2)?,
                "dueDate": r.get::<_, String>(3)?,
                "classId": r.get::<_, Option<String>>(4)?,
                "academicYearId": r.get::<_, Option<String>>(5)?,
                "graceDays": r.get::<_, i64>(6)?,
                "fineType": r.get::<_, String>(7)?,
                "fineValue": r.get::<_, f64>(8)?,
                "assignedCount": r.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "structures": structures }))
}

fn structures_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let name = required_str(params, "name")?;
    let amount = required_f64(params, "amount")?;
    if amount <= 0.0 {
        return Err(HandlerErr::bad_params("amount must be positive"));
    }
    let due_date = required_date(params, "dueDate")?;
    let grace_days = optional_i64(params, "graceDays")?.unwrap_or(0);
    if grace_days < 0 {
        return Err(HandlerErr::bad_params("graceDays must not be negative"));
    }
    let fine_type: FineType = optional_str(params, "fineType")
        .unwrap_or_default()
        .parse()?;
    let fine_value = optional_f64(params, "fineValue")?.unwrap_or(0.0);
    if fine_value < 0.0 {
        return Err(HandlerErr::bad_params("fineValue must not be negative"));
    }
    let class_id = optional_str(params, "classId");
    if let Some(c) = class_id.as_deref() {
        ensure_exists(conn, "classes", "class", school, c)?;
    }
    let year_id = optional_str(params, "academicYearId");
    if let Some(y) = year_id.as_deref() {
        ensure_exists(conn, "academic_years", "academic year", school, y)?;
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fee_structures(
           id, school_code, name, amount, due_date, class_id, academic_year_id,
           grace_days, fine_type, fine_value, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            school,
            &name,
            round_off_2_decimals(amount),
            format_date(due_date),
            class_id,
            year_id,
            grace_days,
            fine_type.as_str(),
            fine_value,
            now_rfc3339(),
        ],
    )
    .map_err(db_write("db_insert_failed", "fee_structures"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "fees.structures.create",
            entity: "fee_structure",
            entity_id: Some(&id),
            details: Some(json!({ "name": name, "amount": amount })),
        },
    );
    Ok(json!({ "feeStructureId": id, "name": name }))
}

fn fees_assign(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let structure_id = required_str(params, "feeStructureId")?;
    let structure: Option<(f64, Option<String>)> = conn
        .query_row(
            "SELECT amount, class_id FROM fee_structures WHERE school_code = ? AND id = ?",
            (school, &structure_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((amount, class_id)) = structure else {
        return Err(HandlerErr::not_found("fee structure"));
    };

    let student_ids = match (string_list(params, "studentIds"), class_id) {
        (Some(ids), _) => {
            for id in &ids {
                ensure_exists(conn, "students", "student", school, id)?;
            }
            ids
        }
        (None, Some(class_id)) => {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM students
                     WHERE school_code = ? AND class_id = ? AND status = 'active'",
                )
                .map_err(db_query)?;
            stmt.query_map((school, &class_id), |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_query)?
        }
        (None, None) => {
            return Err(HandlerErr::bad_params(
                "studentIds required for a structure without a class",
            ))
        }
    };

    let now = now_rfc3339();
    let mut assigned = 0usize;
    let mut skipped = 0usize;
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for student_id in &student_ids {
        let n = tx
            .execute(
                "INSERT OR IGNORE INTO student_fees(id, school_code, fee_structure_id, student_id, amount, created_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    school,
                    &structure_id,
                    student_id,
                    amount,
                    &now,
                ),
            )
            .map_err(db_write("db_insert_failed", "student_fees"))?;
        if n == 0 {
            skipped += 1;
        } else {
            assigned += 1;
        }
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "fees.assign",
            entity: "fee_structure",
            entity_id: Some(&structure_id),
            details: Some(json!({ "assigned": assigned, "skipped": skipped })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "assigned": assigned, "skipped": skipped }))
}

fn fees_student(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    let as_of = optional_date(params, "asOf")?.unwrap_or_else(today);
    let fees = student_fee_lines(conn, school, &student_id, as_of)?;
    let total_due: f64 = fees
        .iter()
        .filter_map(|f| f.get("totalDue").and_then(|v| v.as_f64()))
        .sum();

    let mut stmt = conn
        .prepare(
            "SELECT p.receipt_no, p.amount, p.principal_component, p.fine_component,
                    p.method, p.reference, p.paid_on, fs.name
             FROM fee_payments p
             JOIN student_fees sf ON sf.id = p.student_fee_id
             JOIN fee_structures fs ON fs.id = sf.fee_structure_id
             WHERE p.school_code = ? AND sf.student_id = ?
             ORDER BY p.paid_on, p.created_at",
        )
        .map_err(db_query)?;
    let payments = stmt
        .query_map((school, &student_id), |r| {
            Ok(json!({
                "receiptNo": r.get::<_, String>(0)?,
                "amount": r.get::<_, f64>(1)?,
                "principalComponent": r.get::<_, f64>(2)?,
                "fineComponent": r.get::<_, f64>(3)?,
                "method": r.get::<_, String>(4)?,
                "reference": r.get::<_, Option<String>>(5)?,
                "paidOn": r.get::<_, String>(6)?,
                "feeName": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    Ok(json!({
        "studentId": student_id,
        "asOf": format_date(as_of),
        "fees": fees,
        "payments": payments,
        "totalDue": round_off_2_decimals(total_due),
    }))
}

fn fees_pay(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_fee_id = required_str(params, "studentFeeId")?;
    let amount = round_off_2_decimals(required_f64(params, "amount")?);
    let method = required_str(params, "method")?.to_ascii_lowercase();
    if !PAYMENT_METHODS.contains(&method.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown payment method: {}", method))
            .with_details(json!({ "allowed": PAYMENT_METHODS })));
    }
    let paid_on = optional_date(params, "paidOn")?.unwrap_or_else(today);

    let line = load_lines(
        conn,
        "WHERE sf.school_code = ? AND sf.id = ?",
        (school, &student_fee_id),
    )?
    .into_iter()
    .next()
    .ok_or_else(|| HandlerErr::not_found("student fee"))?;
    let priced = line.price(paid_on);
    let split = allocate_payment(amount, priced.fine_due, priced.balance)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let seq = db::next_sequence(&tx, school, "receipt")
        .map_err(db_write("db_update_failed", "sequences"))?;
    let receipt_no = format!("{}-R{}", school, seq);
    tx.execute(
        "UPDATE student_fees
         SET principal_paid = principal_paid + ?, fine_paid = fine_paid + ?
         WHERE id = ?",
        (
            split.principal_component,
            split.fine_component,
            &student_fee_id,
        ),
    )
    .map_err(db_write("db_update_failed", "student_fees"))?;
    tx.execute(
        "INSERT INTO fee_payments(
           id, school_code, student_fee_id, receipt_no, amount, principal_component,
           fine_component, method, reference, paid_on, recorded_by, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            school,
            &student_fee_id,
            &receipt_no,
            amount,
            split.principal_component,
            split.fine_component,
            &method,
            optional_str(params, "reference"),
            format_date(paid_on),
            caller.actor(),
            now_rfc3339(),
        ],
    )
    .map_err(db_write("db_insert_failed", "fee_payments"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "fees.pay",
            entity: "student_fee",
            entity_id: Some(&student_fee_id),
            details: Some(json!({ "receiptNo": receipt_no, "amount": amount })),
        },
    );
    tx.commit().map_err(db_commit)?;
    tracing::info!(school, receipt = %receipt_no, amount, "fee payment recorded");

    let remaining = round_off_2_decimals((priced.total_due - amount).max(0.0));
    Ok(json!({
        "receiptNo": receipt_no,
        "amount": amount,
        "fineComponent": split.fine_component,
        "principalComponent": split.principal_component,
        "remainingDue": remaining,
        "studentId": line.student_id,
    }))
}

fn fees_defaulters(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let as_of = optional_date(params, "asOf")?.unwrap_or_else(today);
    let lines = load_lines(conn, "WHERE sf.school_code = ?", [school])?;

    // student id -> (overdue fees, total due)
    let mut by_student: std::collections::BTreeMap<String, (usize, f64)> =
        std::collections::BTreeMap::new();
    for line in &lines {
        let p = line.price(as_of);
        if p.status != FeeStatus::Overdue {
            continue;
        }
        let entry = by_student.entry(line.student_id.clone()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += p.total_due;
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.admission_no, s.last_name || ', ' || s.first_name, c.name, s.guardian_phone
             FROM students s LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
        )
        .map_err(db_query)?;
    let mut defaulters = Vec::with_capacity(by_student.len());
    for (student_id, (overdue_fees, total_due)) in by_student {
        let (admission_no, name, class_name, phone): (String, String, Option<String>, Option<String>) = stmt
            .query_row([&student_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .map_err(db_query)?;
        defaulters.push(json!({
            "studentId": student_id,
            "admissionNo": admission_no,
            "displayName": name,
            "className": class_name,
            "guardianPhone": phone,
            "overdueFees": overdue_fees,
            "totalDue": round_off_2_decimals(total_due),
        }));
    }
    defaulters.sort_by(|a, b| {
        let due_a = a["totalDue"].as_f64().unwrap_or(0.0);
        let due_b = b["totalDue"].as_f64().unwrap_or(0.0);
        due_b.total_cmp(&due_a)
    });
    Ok(json!({ "asOf": format_date(as_of), "defaulters": defaulters }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "fees.structures.list" => structures_list,
        "fees.structures.create" => structures_create,
        "fees.assign" => fees_assign,
        "fees.student" => fees_student,
        "fees.pay" => fees_pay,
        "fees.defaulters" => fees_defaulters,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn line(principal_paid: f64, fine_paid: f64) -> FeeLine {
        FeeLine {
            student_fee_id: "sf".into(),
            student_id: "s".into(),
            name: "Term 1".into(),
            amount: 1000.0,
            principal_paid,
            fine_paid,
            due_date: d(2024, 4, 10),
            policy: FinePolicy {
                fine_type: FineType::PerDay,
                value: 10.0,
                grace_days: 5,
            },
        }
    }

    #[test]
    fn fine_already_paid_is_not_charged_twice() {
        let p = line(0.0, 0.0).price(d(2024, 4, 22));
        assert_eq!(p.late_fee, 70.0);
        assert_eq!(p.total_due, 1070.0);
        assert_eq!(p.status, FeeStatus::Overdue);

        let p = line(0.0, 70.0).price(d(2024, 4, 22));
        assert_eq!(p.fine_due, 0.0);
        assert_eq!(p.total_due, 1000.0);
    }

    #[test]
    fn settled_fee_reports_paid() {
        let p = line(1000.0, 0.0).price(d(2024, 6, 1));
        assert_eq!(p.balance, 0.0);
        assert_eq!(p.total_due, 0.0);
        assert_eq!(p.status, FeeStatus::Paid);
    }
}
