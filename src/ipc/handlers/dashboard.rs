use crate::dates::{format_date, today};
use crate::ipc::error::{db_query, HandlerErr};
use crate::ipc::handlers::{attendance, fees};
use crate::ipc::helpers::respond;
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;

fn cache_key(school: &str) -> String {
    format!("{}:dashboard", school)
}

fn count(conn: &Connection, sql: &str, school: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [school], |r| r.get(0)).map_err(db_query)
}

fn load_stats(conn: &Connection, school: &str) -> Result<serde_json::Value, HandlerErr> {
    let as_of = today();
    let students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE school_code = ? AND status = 'active'",
        school,
    )?;
    let staff = count(
        conn,
        "SELECT COUNT(*) FROM staff WHERE school_code = ? AND status = 'active'",
        school,
    )?;
    let classes = count(conn, "SELECT COUNT(*) FROM classes WHERE school_code = ?", school)?;
    let books_on_loan = count(
        conn,
        "SELECT COUNT(*) FROM library_loans WHERE school_code = ? AND returned_on IS NULL",
        school,
    )?;
    let pending_leave = count(
        conn,
        "SELECT COUNT(*) FROM leave_requests WHERE school_code = ? AND status = 'pending'",
        school,
    )?;
    let (collected, outstanding) = fees::school_totals(conn, school, as_of)?;
    let attendance_today = attendance::school_day_percentage(conn, school, as_of)?;

    Ok(json!({
        "asOf": format_date(as_of),
        "students": students,
        "staff": staff,
        "classes": classes,
        "feesCollected": collected,
        "feesOutstanding": outstanding,
        "attendanceTodayPercentage": attendance_today,
        "booksOnLoan": books_on_loan,
        "pendingLeaveRequests": pending_leave,
    }))
}

fn dashboard_stats(state: &mut AppState, caller: &Caller) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let AppState { db, cache, .. } = state;
    let conn = db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    cache.get_or_load(&cache_key(school), || load_stats(conn, school))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(respond(&req.id, dashboard_stats(state, caller))),
        _ => None,
    }
}
