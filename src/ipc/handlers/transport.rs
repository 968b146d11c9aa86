use crate::audit::{self, AuditEntry};
use crate::dates::now_rfc3339;
use crate::db::is_unique_violation;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_f64, optional_str, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn routes_list(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.name, r.vehicle_no, r.driver_name, r.driver_phone, r.fare,
               (SELECT COUNT(*) FROM transport_assignments a WHERE a.route_id = r.id) AS riders
             FROM transport_routes r
             WHERE r.school_code = ?
             ORDER BY r.name",
        )
        .map_err(db_query)?;
    let routes = stmt
        .query_map([school], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "vehicleNo": r.get::<_, Option<String>>(2)?,
                "driverName": r.get::<_, Option<String>>(3)?,
                "driverPhone": r.get::<_, Option<String>>(4)?,
                "fare": r.get::<_, f64>(5)?,
                "riderCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "routes": routes }))
}

fn routes_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let name = required_str(params, "name")?;
    let fare = optional_f64(params, "fare")?.unwrap_or(0.0);
    if fare < 0.0 {
        return Err(HandlerErr::bad_params("fare must not be negative"));
    }
    let route_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO transport_routes(id, school_code, name, vehicle_no, driver_name, driver_phone, fare, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &route_id,
            school,
            &name,
            optional_str(params, "vehicleNo"),
            optional_str(params, "driverName"),
            optional_str(params, "driverPhone"),
            fare,
            now_rfc3339(),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::bad_params("route name already exists").with_details(json!({ "field": "name" }))
        } else {
            db_write("db_insert_failed", "transport_routes")(e)
        }
    })?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "transport.routes.create",
            entity: "route",
            entity_id: Some(&route_id),
            details: Some(json!({ "name": name })),
        },
    );
    Ok(json!({ "routeId": route_id, "name": name }))
}

fn routes_delete(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let route_id = required_str(params, "routeId")?;
    ensure_exists(conn, "transport_routes", "route", school, &route_id)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let released = tx
        .execute(
            "DELETE FROM transport_assignments WHERE route_id = ?",
            [&route_id],
        )
        .map_err(db_write("db_delete_failed", "transport_assignments"))?;
    tx.execute("DELETE FROM transport_routes WHERE id = ?", [&route_id])
        .map_err(db_write("db_delete_failed", "transport_routes"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "transport.routes.delete",
            entity: "route",
            entity_id: Some(&route_id),
            details: Some(json!({ "releasedRiders": released })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true, "releasedRiders": released }))
}

fn transport_assign(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let route_id = required_str(params, "routeId")?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "transport_routes", "route", school, &route_id)?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM students WHERE school_code = ? AND id = ?",
            (school, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    match status.as_deref() {
        None => return Err(HandlerErr::not_found("student")),
        Some("active") => {}
        Some(_) => return Err(HandlerErr::bad_params("student is not active")),
    }

    let previous: Option<String> = conn
        .query_row(
            "SELECT route_id FROM transport_assignments WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    // One route per student; a new assignment replaces the old one.
    conn.execute(
        "INSERT INTO transport_assignments(student_id, school_code, route_id, stop_name, assigned_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           route_id = excluded.route_id,
           stop_name = excluded.stop_name,
           assigned_at = excluded.assigned_at",
        (
            &student_id,
            school,
            &route_id,
            optional_str(params, "stopName"),
            now_rfc3339(),
        ),
    )
    .map_err(db_write("db_insert_failed", "transport_assignments"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "transport.assign",
            entity: "student",
            entity_id: Some(&student_id),
            details: Some(json!({ "routeId": route_id, "previousRouteId": previous })),
        },
    );
    Ok(json!({ "ok": true, "previousRouteId": previous }))
}

fn transport_unassign(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    let removed = conn
        .execute(
            "DELETE FROM transport_assignments WHERE school_code = ? AND student_id = ?",
            (school, &student_id),
        )
        .map_err(db_write("db_delete_failed", "transport_assignments"))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("transport assignment"));
    }
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "transport.unassign",
            entity: "student",
            entity_id: Some(&student_id),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

fn transport_roster(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let route_id = required_str(params, "routeId")?;
    ensure_exists(conn, "transport_routes", "route", school, &route_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.admission_no, s.last_name || ', ' || s.first_name, c.name,
                    a.stop_name, s.guardian_phone
             FROM transport_assignments a
             JOIN students s ON s.id = a.student_id
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE a.route_id = ?
             ORDER BY a.stop_name, s.last_name, s.first_name",
        )
        .map_err(db_query)?;
    let riders = stmt
        .query_map([&route_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "admissionNo": r.get::<_, String>(1)?,
                "displayName": r.get::<_, String>(2)?,
                "className": r.get::<_, Option<String>>(3)?,
                "stopName": r.get::<_, Option<String>>(4)?,
                "guardianPhone": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "routeId": route_id, "riders": riders }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "transport.routes.list" => routes_list,
        "transport.routes.create" => routes_create,
        "transport.routes.delete" => routes_delete,
        "transport.assign" => transport_assign,
        "transport.unassign" => transport_unassign,
        "transport.roster" => transport_roster,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
