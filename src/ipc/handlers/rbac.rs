use crate::audit::{self, AuditEntry};
use crate::dates::now_rfc3339;
use crate::db::is_unique_violation;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_str, required_str, run, string_list, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use crate::rbac::{self, MODULES};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

struct Grant {
    module: String,
    sub_module: String,
    can_view: bool,
    can_edit: bool,
}

fn parse_grant(v: &serde_json::Value) -> Result<Grant, HandlerErr> {
    let module = required_str(v, "module")?;
    let sub_module = required_str(v, "subModule")?;
    if !rbac::is_known(&module, &sub_module) {
        return Err(HandlerErr::bad_params(format!(
            "unknown module: {}/{}",
            module, sub_module
        )));
    }
    let can_edit = v.get("canEdit").and_then(|x| x.as_bool()).unwrap_or(false);
    // Edit implies view.
    let can_view = can_edit || v.get("canView").and_then(|x| x.as_bool()).unwrap_or(false);
    Ok(Grant {
        module,
        sub_module,
        can_view,
        can_edit,
    })
}

fn rbac_modules(
    _conn: &Connection,
    _caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let modules: Vec<serde_json::Value> = MODULES
        .iter()
        .map(|(m, subs)| json!({ "module": m, "subModules": subs }))
        .collect();
    Ok(json!({ "modules": modules }))
}

fn roles_list(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.name, r.description,
               (SELECT COUNT(*) FROM staff_roles sr WHERE sr.role_id = r.id) AS staff_count
             FROM roles r
             WHERE r.school_code = ?
             ORDER BY r.name",
        )
        .map_err(db_query)?;
    let mut roles = stmt
        .query_map([school], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "staffCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut perm_stmt = conn
        .prepare(
            "SELECT module, sub_module, can_view, can_edit
             FROM role_permissions WHERE role_id = ?
             ORDER BY module, sub_module",
        )
        .map_err(db_query)?;
    for role in roles.iter_mut() {
        let role_id = role["id"].as_str().unwrap_or_default().to_string();
        let perms = perm_stmt
            .query_map([&role_id], |r| {
                Ok(json!({
                    "module": r.get::<_, String>(0)?,
                    "subModule": r.get::<_, String>(1)?,
                    "canView": r.get::<_, i64>(2)? != 0,
                    "canEdit": r.get::<_, i64>(3)? != 0,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?;
        role["permissions"] = json!(perms);
    }
    Ok(json!({ "roles": roles }))
}

fn roles_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let name = required_str(params, "name")?;
    let role_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO roles(id, school_code, name, description, created_at) VALUES(?, ?, ?, ?, ?)",
        (
            &role_id,
            school,
            &name,
            optional_str(params, "description"),
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::bad_params("role name already exists")
                .with_details(json!({ "field": "name" }))
        } else {
            db_write("db_insert_failed", "roles")(e)
        }
    })?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "rbac.roles.create",
            entity: "role",
            entity_id: Some(&role_id),
            details: Some(json!({ "name": name })),
        },
    );
    Ok(json!({ "roleId": role_id, "name": name }))
}

fn roles_delete(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let role_id = required_str(params, "roleId")?;
    ensure_exists(conn, "roles", "role", school, &role_id)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM role_permissions WHERE role_id = ?", [&role_id])
        .map_err(db_write("db_delete_failed", "role_permissions"))?;
    tx.execute("DELETE FROM staff_roles WHERE role_id = ?", [&role_id])
        .map_err(db_write("db_delete_failed", "staff_roles"))?;
    tx.execute("DELETE FROM roles WHERE id = ?", [&role_id])
        .map_err(db_write("db_delete_failed", "roles"))?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "rbac.roles.delete",
            entity: "role",
            entity_id: Some(&role_id),
            details: None,
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true }))
}

fn roles_set_permissions(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let role_id = required_str(params, "roleId")?;
    ensure_exists(conn, "roles", "role", school, &role_id)?;
    let grants = params
        .get("permissions")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing permissions"))?
        .iter()
        .map(parse_grant)
        .collect::<Result<Vec<_>, _>>()?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM role_permissions WHERE role_id = ?", [&role_id])
        .map_err(db_write("db_delete_failed", "role_permissions"))?;
    for g in &grants {
        tx.execute(
            "INSERT INTO role_permissions(role_id, module, sub_module, can_view, can_edit)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(role_id, module, sub_module) DO UPDATE SET
               can_view = excluded.can_view, can_edit = excluded.can_edit",
            (
                &role_id,
                &g.module,
                &g.sub_module,
                g.can_view as i64,
                g.can_edit as i64,
            ),
        )
        .map_err(db_write("db_insert_failed", "role_permissions"))?;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "rbac.roles.setPermissions",
            entity: "role",
            entity_id: Some(&role_id),
            details: Some(json!({ "grants": grants.len() })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true, "grants": grants.len() }))
}

fn staff_assign_roles(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let role_ids =
        string_list(params, "roleIds").ok_or_else(|| HandlerErr::bad_params("missing roleIds"))?;
    for role_id in &role_ids {
        ensure_exists(conn, "roles", "role", school, role_id)?;
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM staff_roles WHERE staff_id = ?", [&staff_id])
        .map_err(db_write("db_delete_failed", "staff_roles"))?;
    for role_id in &role_ids {
        tx.execute(
            "INSERT OR IGNORE INTO staff_roles(staff_id, role_id) VALUES(?, ?)",
            (&staff_id, role_id),
        )
        .map_err(db_write("db_insert_failed", "staff_roles"))?;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "rbac.staff.assignRoles",
            entity: "staff",
            entity_id: Some(&staff_id),
            details: Some(json!({ "roleIds": role_ids })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true }))
}

fn staff_set_override(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let g = parse_grant(params)?;
    conn.execute(
        "INSERT INTO staff_permissions(staff_id, module, sub_module, can_view, can_edit)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(staff_id, module, sub_module) DO UPDATE SET
           can_view = excluded.can_view, can_edit = excluded.can_edit",
        (
            &staff_id,
            &g.module,
            &g.sub_module,
            g.can_view as i64,
            g.can_edit as i64,
        ),
    )
    .map_err(db_write("db_update_failed", "staff_permissions"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "rbac.staff.setOverride",
            entity: "staff",
            entity_id: Some(&staff_id),
            details: Some(json!({
                "module": g.module,
                "subModule": g.sub_module,
                "canView": g.can_view,
                "canEdit": g.can_edit,
            })),
        },
    );
    Ok(json!({ "ok": true }))
}

fn staff_clear_override(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let module = required_str(params, "module")?;
    let sub_module = required_str(params, "subModule")?;
    let removed = conn
        .execute(
            "DELETE FROM staff_permissions WHERE staff_id = ? AND module = ? AND sub_module = ?",
            (&staff_id, &module, &sub_module),
        )
        .map_err(db_write("db_delete_failed", "staff_permissions"))?;
    if removed > 0 {
        audit::record(
            conn,
            AuditEntry {
                school_code: school,
                actor: &caller.actor(),
                action: "rbac.staff.clearOverride",
                entity: "staff",
                entity_id: Some(&staff_id),
                details: Some(json!({ "module": module, "subModule": sub_module })),
            },
        );
    }
    Ok(json!({ "removed": removed }))
}

fn rbac_check(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let staff_id = required_str(params, "staffId")?;
    ensure_exists(conn, "staff", "staff member", school, &staff_id)?;
    let module = required_str(params, "module")?;
    let sub_module = required_str(params, "subModule")?;
    let r = rbac::resolve(conn, school, &staff_id, &module, &sub_module).map_err(db_query)?;
    Ok(json!({
        "canView": r.can_view || r.can_edit,
        "canEdit": r.can_edit,
        "source": r.source.as_str(),
        "roleId": r.role_id,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "rbac.modules" => rbac_modules,
        "rbac.roles.list" => roles_list,
        "rbac.roles.create" => roles_create,
        "rbac.roles.delete" => roles_delete,
        "rbac.roles.setPermissions" => roles_set_permissions,
        "rbac.staff.assignRoles" => staff_assign_roles,
        "rbac.staff.setOverride" => staff_set_override,
        "rbac.staff.clearOverride" => staff_clear_override,
        "rbac.check" => rbac_check,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
