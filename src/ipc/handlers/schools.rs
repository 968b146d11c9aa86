use crate::audit::{self, AuditEntry};
use crate::dates::now_rfc3339;
use crate::db;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{object_param, optional_str, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use crate::password::{hash_password, verify_password, MIN_PASSWORD_LEN};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub const LIBRARY_FINE_KEY: &str = "library.finePerDay";
pub const DEFAULT_LIBRARY_FINE_PER_DAY: f64 = 1.0;

pub fn normalize_school_code(raw: &str) -> Result<String, HandlerErr> {
    let code = raw.trim().to_ascii_uppercase();
    if !(2..=16).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(HandlerErr::bad_params(
            "schoolCode must be 2-16 letters or digits",
        )
        .with_details(json!({ "field": "schoolCode" })));
    }
    Ok(code)
}

pub fn check_password_strength(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

pub fn library_fine_per_day(conn: &Connection, school_code: &str) -> Result<f64, HandlerErr> {
    Ok(db::settings_get_json(conn, school_code, LIBRARY_FINE_KEY)
        .map_err(db_query)?
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_LIBRARY_FINE_PER_DAY))
}

fn schools_register(
    conn: &Connection,
    _caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = normalize_school_code(&required_str(params, "schoolCode")?)?;
    let name = required_str(params, "name")?;
    let password = params
        .get("adminPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    check_password_strength(password)?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM schools WHERE code = ?", [&code], |r| r.get(0))
        .optional()
        .map_err(db_query)?;
    if exists.is_some() {
        return Err(HandlerErr::bad_params("school code already registered")
            .with_details(json!({ "field": "schoolCode" })));
    }

    conn.execute(
        "INSERT INTO schools(code, name, address, phone, email, admin_password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &code,
            &name,
            optional_str(params, "address"),
            optional_str(params, "phone"),
            optional_str(params, "email"),
            hash_password(password),
            now_rfc3339(),
        ),
    )
    .map_err(db_write("db_insert_failed", "schools"))?;
    db::settings_set_json(conn, &code, LIBRARY_FINE_KEY, &json!(DEFAULT_LIBRARY_FINE_PER_DAY))
        .map_err(db_write("db_insert_failed", "settings"))?;

    audit::record(
        conn,
        AuditEntry {
            school_code: &code,
            actor: "anonymous",
            action: "schools.register",
            entity: "school",
            entity_id: Some(&code),
            details: Some(json!({ "name": name })),
        },
    );
    tracing::info!(school = %code, "school registered");
    Ok(json!({ "schoolCode": code, "name": name }))
}

fn school_profile(conn: &Connection, code: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT name, address, phone, email, current_academic_year_id, created_at
             FROM schools WHERE code = ?",
            [code],
            |r| {
                Ok(json!({
                    "schoolCode": code,
                    "name": r.get::<_, String>(0)?,
                    "address": r.get::<_, Option<String>>(1)?,
                    "phone": r.get::<_, Option<String>>(2)?,
                    "email": r.get::<_, Option<String>>(3)?,
                    "currentAcademicYearId": r.get::<_, Option<String>>(4)?,
                    "createdAt": r.get::<_, String>(5)?,
                }))
            },
        )
        .optional()
        .map_err(db_query)?;
    let mut profile = row.ok_or_else(|| HandlerErr::not_found("school"))?;
    profile["libraryFinePerDay"] = json!(library_fine_per_day(conn, code)?);
    Ok(profile)
}

fn schools_get(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    school_profile(conn, caller.school()?)
}

fn schools_update(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = caller.school()?;
    let patch = object_param(params, "patch")?;

    let mut updates: Vec<(&'static str, Option<String>)> = Vec::new();
    for (key, column) in [
        ("name", "name"),
        ("address", "address"),
        ("phone", "phone"),
        ("email", "email"),
    ] {
        let Some(v) = patch.get(key) else { continue };
        let value = v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        if key == "name" && value.is_none() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        updates.push((column, value));
    }
    let fine = match patch.get("libraryFinePerDay") {
        Some(v) => Some(
            v.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .ok_or_else(|| {
                    HandlerErr::bad_params("libraryFinePerDay must be a non-negative number")
                })?,
        ),
        None => None,
    };

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (column, value) in &updates {
        let sql = format!("UPDATE schools SET {} = ? WHERE code = ?", column);
        tx.execute(&sql, (value, code))
            .map_err(db_write("db_update_failed", "schools"))?;
    }
    if let Some(fine) = fine {
        db::settings_set_json(&tx, code, LIBRARY_FINE_KEY, &json!(fine))
            .map_err(db_write("db_update_failed", "settings"))?;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: code,
            actor: &caller.actor(),
            action: "schools.update",
            entity: "school",
            entity_id: Some(code),
            details: Some(serde_json::Value::Object(patch.clone())),
        },
    );
    tx.commit().map_err(db_commit)?;
    school_profile(conn, code)
}

fn schools_change_password(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = caller.school()?;
    let current = params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let new = params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    check_password_strength(new)?;

    let stored: String = conn
        .query_row(
            "SELECT admin_password_hash FROM schools WHERE code = ?",
            [code],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if !verify_password(current, &stored) {
        return Err(HandlerErr::bad_params("current password is incorrect"));
    }
    conn.execute(
        "UPDATE schools SET admin_password_hash = ? WHERE code = ?",
        (hash_password(new), code),
    )
    .map_err(db_write("db_update_failed", "schools"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: code,
            actor: &caller.actor(),
            action: "schools.changePassword",
            entity: "school",
            entity_id: Some(code),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "schools.register" => schools_register,
        "schools.get" => schools_get,
        "schools.update" => schools_update,
        "schools.changePassword" => schools_change_password,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
