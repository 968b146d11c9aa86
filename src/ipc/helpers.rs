use crate::dates;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Caller, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};

pub type Handler = fn(&Connection, &Caller, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>;

pub fn require_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Runs a connection-scoped handler and wraps its outcome in the envelope.
pub fn run(state: &AppState, req: &Request, caller: &Caller, handler: Handler) -> serde_json::Value {
    let result = require_conn(state).and_then(|conn| handler(conn, caller, &req.params));
    respond(&req.id, result)
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    optional_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string parameter; blank counts as absent.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    optional_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    optional_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_date(params: &serde_json::Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    let Some(raw) = optional_str(params, key) else {
        return Ok(None);
    };
    dates::parse_date(&raw)
        .map(Some)
        .map_err(|e| HandlerErr::bad_params(format!("{}: {}", key, e)))
}

pub fn string_list(params: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

pub fn object_param<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a serde_json::Map<String, serde_json::Value>, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// True when a row with `id` exists in `table` for this school.
pub fn row_exists(
    conn: &Connection,
    table: &'static str,
    school_code: &str,
    id: &str,
) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE school_code = ? AND id = ?", table);
    conn.query_row(&sql, (school_code, id), |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(crate::ipc::error::db_query)
}

pub fn ensure_exists(
    conn: &Connection,
    table: &'static str,
    what: &str,
    school_code: &str,
    id: &str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, school_code, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what))
    }
}
