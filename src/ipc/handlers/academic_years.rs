use crate::academic::{self, PromotionTarget};
use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, now_rfc3339};
use crate::db::is_unique_violation;
use crate::ipc::error::{db_query, db_write, HandlerErr};
use crate::ipc::helpers::{
    ensure_exists, optional_bool, optional_str, required_date, required_str, run, string_list,
    Handler,
};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn years_list(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, is_current, status
             FROM academic_years
             WHERE school_code = ?
             ORDER BY start_date DESC",
        )
        .map_err(db_query)?;
    let years = stmt
        .query_map([school], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0,
                "status": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "academicYears": years }))
}

fn years_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let name = required_str(params, "name")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if start >= end {
        return Err(HandlerErr::bad_params("startDate must be before endDate"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, school_code, name, start_date, end_date, is_current, status, created_at)
         VALUES(?, ?, ?, ?, ?, 0, 'planned', ?)",
        (
            &id,
            school,
            &name,
            format_date(start),
            format_date(end),
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::bad_params("academic year name already exists")
                .with_details(json!({ "field": "name" }))
        } else {
            db_write("db_insert_failed", "academic_years")(e)
        }
    })?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "academicYears.create",
            entity: "academic_year",
            entity_id: Some(&id),
            details: Some(json!({ "name": name })),
        },
    );
    Ok(json!({ "academicYearId": id, "name": name, "status": "planned" }))
}

fn years_activate(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let year_id = required_str(params, "academicYearId")?;
    let activation = academic::activate_year(conn, school, &year_id, &caller.actor())?;
    tracing::info!(school, year = %activation.activated_id, "academic year activated");
    Ok(json!({
        "academicYearId": activation.activated_id,
        "closedAcademicYearId": activation.closed_id,
    }))
}

fn years_promote(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let from_class = required_str(params, "fromClassId")?;
    let target = match (
        optional_str(params, "toClassId"),
        optional_bool(params, "graduate").unwrap_or(false),
    ) {
        (Some(_), true) => {
            return Err(HandlerErr::bad_params(
                "pass either toClassId or graduate, not both",
            ))
        }
        (Some(to), false) => PromotionTarget::Class(to),
        (None, true) => PromotionTarget::Graduate,
        (None, false) => return Err(HandlerErr::bad_params("missing toClassId")),
    };
    let year_id = optional_str(params, "academicYearId");
    if let Some(y) = year_id.as_deref() {
        ensure_exists(conn, "academic_years", "academic year", school, y)?;
    }
    let student_ids = string_list(params, "studentIds");

    let promotion = academic::promote_students(
        conn,
        school,
        &from_class,
        &target,
        student_ids.as_deref(),
        year_id.as_deref(),
        &caller.actor(),
    )?;
    Ok(json!({
        "moved": promotion.moved,
        "skipped": promotion.skipped,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "academicYears.list" => years_list,
        "academicYears.create" => years_create,
        "academicYears.activate" => years_activate,
        "academicYears.promote" => years_promote,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
