use crate::audit::{self, AuditEntry};
use crate::dates::{days_between, format_date, now_rfc3339, parse_date, today};
use crate::grading::round_off_2_decimals;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::handlers::schools::library_fine_per_day;
use crate::ipc::helpers::{
    ensure_exists, object_param, optional_date, optional_i64, optional_str, required_date,
    required_str, run, Handler,
};
use crate::ipc::types::{AppState, Caller, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Fine for returning on `returned_on` a loan due on `due`.
pub fn overdue_fine(due: NaiveDate, returned_on: NaiveDate, per_day: f64) -> (i64, f64) {
    let days = days_between(due, returned_on).max(0);
    (days, round_off_2_decimals(days as f64 * per_day))
}

fn books_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let search = optional_str(params, "search").map(|s| format!("%{}%", s.to_lowercase()));
    let mut stmt = conn
        .prepare(
            "SELECT id, title, author, isbn, copies_total, copies_available
             FROM library_books
             WHERE school_code = ?1
               AND (?2 IS NULL
                    OR lower(title) LIKE ?2
                    OR lower(COALESCE(author, '')) LIKE ?2
                    OR lower(COALESCE(isbn, '')) LIKE ?2)
             ORDER BY title",
        )
        .map_err(db_query)?;
    let books = stmt
        .query_map((school, search), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "author": r.get::<_, Option<String>>(2)?,
                "isbn": r.get::<_, Option<String>>(3)?,
                "copiesTotal": r.get::<_, i64>(4)?,
                "copiesAvailable": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "books": books }))
}

fn books_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let title = required_str(params, "title")?;
    let copies = optional_i64(params, "copies")?.unwrap_or(1);
    if copies < 1 {
        return Err(HandlerErr::bad_params("copies must be at least 1"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO library_books(id, school_code, title, author, isbn, copies_total, copies_available, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            school,
            &title,
            optional_str(params, "author"),
            optional_str(params, "isbn"),
            copies,
            copies,
            now_rfc3339(),
        ],
    )
    .map_err(db_write("db_insert_failed", "library_books"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "library.books.create",
            entity: "book",
            entity_id: Some(&id),
            details: Some(json!({ "title": title, "copies": copies })),
        },
    );
    Ok(json!({ "bookId": id, "title": title, "copies": copies }))
}

fn books_update(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let book_id = required_str(params, "bookId")?;
    let patch = object_param(params, "patch")?;
    let patch_value = serde_json::Value::Object(patch.clone());

    let (total, available): (i64, i64) = conn
        .query_row(
            "SELECT copies_total, copies_available FROM library_books WHERE school_code = ? AND id = ?",
            (school, &book_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;

    let mut updates: Vec<(&'static str, Option<String>)> = Vec::new();
    for (key, column, required) in [
        ("title", "title", true),
        ("author", "author", false),
        ("isbn", "isbn", false),
    ] {
        if !patch.contains_key(key) {
            continue;
        }
        let value = optional_str(&patch_value, key);
        if required && value.is_none() {
            return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
        }
        updates.push((column, value));
    }

    let copies = optional_i64(&patch_value, "copies")?;
    let on_loan = total - available;
    if let Some(copies) = copies {
        if copies < on_loan.max(1) {
            return Err(HandlerErr::bad_params("copies cannot drop below copies on loan")
                .with_details(json!({ "onLoan": on_loan })));
        }
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (column, value) in &updates {
        let sql = format!("UPDATE library_books SET {} = ? WHERE id = ?", column);
        tx.execute(&sql, (value, &book_id))
            .map_err(db_write("db_update_failed", "library_books"))?;
    }
    if let Some(copies) = copies {
        tx.execute(
            "UPDATE library_books SET copies_total = ?, copies_available = ? WHERE id = ?",
            (copies, copies - on_loan, &book_id),
        )
        .map_err(db_write("db_update_failed", "library_books"))?;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "library.books.update",
            entity: "book",
            entity_id: Some(&book_id),
            details: Some(patch_value),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true }))
}

fn books_delete(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let book_id = required_str(params, "bookId")?;
    ensure_exists(conn, "library_books", "book", school, &book_id)?;
    let open_loans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM library_loans WHERE book_id = ? AND returned_on IS NULL",
            [&book_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if open_loans > 0 {
        return Err(HandlerErr::bad_params("book has copies on loan")
            .with_details(json!({ "openLoans": open_loans })));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM library_loans WHERE book_id = ?", [&book_id])
        .map_err(db_write("db_delete_failed", "library_loans"))?;
    tx.execute("DELETE FROM library_books WHERE id = ?", [&book_id])
        .map_err(db_write("db_delete_failed", "library_books"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "library.books.delete",
            entity: "book",
            entity_id: Some(&book_id),
            details: None,
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true }))
}

fn library_issue(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let book_id = required_str(params, "bookId")?;
    let student_id = optional_str(params, "studentId");
    let staff_id = optional_str(params, "staffId");
    match (student_id.as_deref(), staff_id.as_deref()) {
        (Some(s), None) => ensure_exists(conn, "students", "student", school, s)?,
        (None, Some(s)) => ensure_exists(conn, "staff", "staff member", school, s)?,
        _ => return Err(HandlerErr::bad_params("pass exactly one of studentId or staffId")),
    }
    let issued_on = optional_date(params, "issuedOn")?.unwrap_or_else(today);
    let due_date = required_date(params, "dueDate")?;
    if due_date < issued_on {
        return Err(HandlerErr::bad_params("dueDate must not be before the issue date"));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let available: Option<i64> = tx
        .query_row(
            "SELECT copies_available FROM library_books WHERE school_code = ? AND id = ?",
            (school, &book_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    match available {
        None => return Err(HandlerErr::not_found("book")),
        Some(n) if n <= 0 => return Err(HandlerErr::bad_params("no copies available")),
        Some(_) => {}
    }
    let loan_id = Uuid::new_v4().to_string();
    tx.execute(
        "UPDATE library_books SET copies_available = copies_available - 1 WHERE id = ?",
        [&book_id],
    )
    .map_err(db_write("db_update_failed", "library_books"))?;
    tx.execute(
        "INSERT INTO library_loans(id, school_code, book_id, student_id, staff_id, issued_on, due_date)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &loan_id,
            school,
            &book_id,
            student_id,
            staff_id,
            format_date(issued_on),
            format_date(due_date),
        ],
    )
    .map_err(db_write("db_insert_failed", "library_loans"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "library.issue",
            entity: "loan",
            entity_id: Some(&loan_id),
            details: Some(json!({ "bookId": book_id })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "loanId": loan_id, "dueDate": format_date(due_date) }))
}

fn library_return(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let loan_id = required_str(params, "loanId")?;
    let returned_on = optional_date(params, "returnedOn")?.unwrap_or_else(today);

    let loan: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT book_id, due_date, returned_on FROM library_loans WHERE school_code = ? AND id = ?",
            (school, &loan_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((book_id, due_raw, already)) = loan else {
        return Err(HandlerErr::not_found("loan"));
    };
    if already.is_some() {
        return Err(HandlerErr::bad_params("loan already returned"));
    }
    let due = parse_date(&due_raw)?;
    let (days_overdue, fine) = overdue_fine(due, returned_on, library_fine_per_day(conn, school)?);

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "UPDATE library_loans SET returned_on = ?, fine = ? WHERE id = ?",
        (format_date(returned_on), fine, &loan_id),
    )
    .map_err(db_write("db_update_failed", "library_loans"))?;
    tx.execute(
        "UPDATE library_books SET copies_available = MIN(copies_total, copies_available + 1) WHERE id = ?",
        [&book_id],
    )
    .map_err(db_write("db_update_failed", "library_books"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "library.return",
            entity: "loan",
            entity_id: Some(&loan_id),
            details: Some(json!({ "daysOverdue": days_overdue, "fine": fine })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "loanId": loan_id, "daysOverdue": days_overdue, "fine": fine }))
}

fn library_loans(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let status = optional_str(params, "status").map(|s| s.to_ascii_lowercase());
    let filter = match status.as_deref() {
        None => "",
        Some("open") | Some("overdue") => "AND l.returned_on IS NULL",
        Some("returned") => "AND l.returned_on IS NOT NULL",
        Some(other) => {
            return Err(HandlerErr::bad_params(format!("unknown loan status: {}", other)))
        }
    };
    let as_of = format_date(today());
    let sql = format!(
        "SELECT l.id, l.book_id, b.title, l.student_id, l.staff_id,
                COALESCE(s.last_name || ', ' || s.first_name, st.last_name || ', ' || st.first_name),
                l.issued_on, l.due_date, l.returned_on, l.fine
         FROM library_loans l
         JOIN library_books b ON b.id = l.book_id
         LEFT JOIN students s ON s.id = l.student_id
         LEFT JOIN staff st ON st.id = l.staff_id
         WHERE l.school_code = ? {}
         ORDER BY l.due_date, b.title",
        filter
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let mut loans = stmt
        .query_map([school], |r| {
            let due: String = r.get(7)?;
            let returned: Option<String> = r.get(8)?;
            // ISO dates compare correctly as strings.
            let overdue = returned.is_none() && due < as_of;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "bookId": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "studentId": r.get::<_, Option<String>>(3)?,
                "staffId": r.get::<_, Option<String>>(4)?,
                "borrowerName": r.get::<_, Option<String>>(5)?,
                "issuedOn": r.get::<_, String>(6)?,
                "dueDate": due,
                "returnedOn": returned,
                "fine": r.get::<_, f64>(9)?,
                "overdue": overdue,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    if status.as_deref() == Some("overdue") {
        loans.retain(|l| l["overdue"].as_bool() == Some(true));
    }
    Ok(json!({ "loans": loans }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "library.books.list" => books_list,
        "library.books.create" => books_create,
        "library.books.update" => books_update,
        "library.books.delete" => books_delete,
        "library.issue" => library_issue,
        "library.return" => library_return,
        "library.loans" => library_loans,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
