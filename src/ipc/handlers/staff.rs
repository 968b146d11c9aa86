use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, now_rfc3339};
use crate::db::is_unique_violation;
use crate::ipc::error::{db_query, db_write, HandlerErr};
use crate::ipc::handlers::schools::check_password_strength;
use crate::ipc::helpers::{
    ensure_exists, object_param, optional_bool, optional_date, optional_str, required_str, run,
    Handler,
};
use crate::ipc::types::{AppState, Caller, Request};
use crate::password::hash_password;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLE_KINDS: &[&str] = &["teacher", "accountant"];

fn parse_role_kind(raw: Option<String>) -> Result<String, HandlerErr> {
    let kind = raw
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| HandlerErr::bad_params("missing roleKind"))?;
    if !ROLE_KINDS.contains(&kind.as_str()) {
        return Err(HandlerErr::bad_params("roleKind must be teacher or accountant")
            .with_details(json!({ "field": "roleKind" })));
    }
    Ok(kind)
}

fn duplicate_employee_code(e: rusqlite::Error, code: &'static str) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::bad_params("employee code already in use")
            .with_details(json!({ "field": "employeeCode" }))
    } else {
        db_write(code, "staff")(e)
    }
}

fn staff_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "employeeCode": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "lastName": r.get::<_, String>(3)?,
        "roleKind": r.get::<_, String>(4)?,
        "designation": r.get::<_, Option<String>>(5)?,
        "phone": r.get::<_, Option<String>>(6)?,
        "email": r.get::<_, Option<String>>(7)?,
        "joiningDate": r.get::<_, Option<String>>(8)?,
        "status": r.get::<_, String>(9)?,
        "hasLogin": r.get::<_, Option<String>>(10)?.is_some(),
    }))
}

const STAFF_COLUMNS: &str = "id, employee_code, first_name, last_name, role_kind, designation,
     phone, email, joining_date, status, password_hash";

fn load_staff(conn: &Connection, school: &str, staff_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM staff WHERE school_code = ? AND id = ?",
        STAFF_COLUMNS
    );
    let mut member = conn
        .query_row(&sql, (school, staff_id), staff_json)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| HandlerErr::not_found("staff member"))?;

    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.name FROM staff_roles sr JOIN roles r ON r.id = sr.role_id
             WHERE sr.staff_id = ? ORDER BY r.name",
        )
        .map_err(db_query)?;
    let roles = stmt
        .query_map([staff_id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    member["roles"] = json!(roles);
    Ok(member)
}

fn staff_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let include_inactive = optional_bool(params, "includeInactive").unwrap_or(false);
    let sql = format!(
        "SELECT {} FROM staff
         WHERE school_code = ? AND (? = 1 OR status = 'active')
         ORDER BY last_name, first_name",
        STAFF_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let staff = stmt
        .query_map((school, include_inactive as i64), staff_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "staff": staff }))
}

fn staff_get(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    load_staff(conn, school, &required_str(params, "staffId")?)
}

fn staff_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let employee_code = required_str(params, "employeeCode")?;
    let first_name = required_str(params, "firstName")?;
    let last_name = required_str(params, "lastName")?;
    let role_kind = parse_role_kind(optional_str(params, "roleKind"))?;
    let joining = optional_date(params, "joiningDate")?;
    let password_hash = match params.get("password").and_then(|v| v.as_str()) {
        Some(p) => {
            check_password_strength(p)?;
            Some(hash_password(p))
        }
        None => None,
    };

    let staff_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO staff(
           id, school_code, employee_code, first_name, last_name, role_kind,
           designation, phone, email, joining_date, password_hash, status, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        rusqlite::params![
            &staff_id,
            school,
            &employee_code,
            &first_name,
            &last_name,
            &role_kind,
            optional_str(params, "designation"),
            optional_str(params, "phone"),
            optional_str(params, "email"),
            joining.map(format_date),
            password_hash,
            now_rfc3339(),
        ],
    )
    .map_err(|e| duplicate_employee_code(e, "db_insert_failed"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "staff.create",
            entity: "staff",
            entity_id: Some(&staff_id),
            details: Some(json!({ "employeeCode": employee_code, "roleKind": role_kind })),
        },
    );
    load_staff(conn, school, &staff_id)
}

fn staff_update(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let patch = object_param(params, "patch")?;
    let patch_value = serde_json::Value::Object(patch.clone());

    for (key, column, required) in [
        ("employeeCode", "employee_code", true),
        ("firstName", "first_name", true),
        ("lastName", "last_name", true),
        ("designation", "designation", false),
        ("phone", "phone", false),
        ("email", "email", false),
    ] {
        if !patch.contains_key(key) {
            continue;
        }
        let value = optional_str(&patch_value, key);
        if required && value.is_none() {
            return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
        }
        let sql = format!("UPDATE staff SET {} = ? WHERE id = ?", column);
        conn.execute(&sql, (value, &staff_id))
            .map_err(|e| duplicate_employee_code(e, "db_update_failed"))?;
    }
    if patch.contains_key("roleKind") {
        let kind = parse_role_kind(optional_str(&patch_value, "roleKind"))?;
        conn.execute("UPDATE staff SET role_kind = ? WHERE id = ?", (kind, &staff_id))
            .map_err(db_write("db_update_failed", "staff"))?;
    }
    if patch.contains_key("joiningDate") {
        let joining = optional_date(&patch_value, "joiningDate")?;
        conn.execute(
            "UPDATE staff SET joining_date = ? WHERE id = ?",
            (joining.map(format_date), &staff_id),
        )
        .map_err(db_write("db_update_failed", "staff"))?;
    }
    conn.execute(
        "UPDATE staff SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), &staff_id),
    )
    .map_err(db_write("db_update_failed", "staff"))?;

    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "staff.update",
            entity: "staff",
            entity_id: Some(&staff_id),
            details: Some(patch_value),
        },
    );
    load_staff(conn, school, &staff_id)
}

fn staff_delete(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    conn.execute(
        "UPDATE staff SET status = 'inactive', updated_at = ? WHERE id = ?",
        (now_rfc3339(), &staff_id),
    )
    .map_err(db_write("db_update_failed", "staff"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "staff.delete",
            entity: "staff",
            entity_id: Some(&staff_id),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

fn staff_set_password(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    check_password_strength(password)?;
    conn.execute(
        "UPDATE staff SET password_hash = ? WHERE id = ?",
        (hash_password(password), &staff_id),
    )
    .map_err(db_write("db_update_failed", "staff"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "staff.setPassword",
            entity: "staff",
            entity_id: Some(&staff_id),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "staff.list" => staff_list,
        "staff.get" => staff_get,
        "staff.create" => staff_create,
        "staff.update" => staff_update,
        "staff.delete" => staff_delete,
        "staff.setPassword" => staff_set_password,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
