use crate::audit::{self, DEFAULT_LIST_LIMIT};
use crate::ipc::error::{db_query, HandlerErr};
use crate::ipc::helpers::{optional_i64, optional_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;

fn audit_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let entity = optional_str(params, "entity");
    let limit = optional_i64(params, "limit")?.unwrap_or(DEFAULT_LIST_LIMIT);
    let entries = audit::list(conn, school, entity.as_deref(), limit).map_err(db_query)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "audit.list" => audit_list,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
