use crate::ipc::error::{db_query, HandlerErr};
use crate::ipc::helpers::respond;
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

fn school_codes(conn: &Connection) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT code FROM schools ORDER BY code")
        .map_err(db_query)?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

fn health(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let schools = match state.db.as_ref() {
        Some(conn) => Some(school_codes(conn)?.len()),
        None => None,
    };
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "schools": schools,
    }))
}

fn workspace_select(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let path = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::bad_params("missing params.path"))?;

    state
        .open_workspace(&path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    let schools = match state.db.as_ref() {
        Some(conn) => school_codes(conn)?,
        None => Vec::new(),
    };
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "schoolCodes": schools,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, _caller: &Caller) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(respond(&req.id, health(state))),
        "workspace.select" => Some(respond(&req.id, workspace_select(state, req))),
        _ => None,
    }
}
