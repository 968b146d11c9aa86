use crate::dates::now_unix;
use crate::ipc::error::{db_query, HandlerErr};
use crate::ipc::handlers::schools::normalize_school_code;
use crate::ipc::helpers::{optional_str, require_conn, required_str, respond};
use crate::ipc::types::{AppState, Caller, Request};
use crate::password::verify_password;
use crate::rate_limit::Decision;
use crate::session::Role;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const BAD_CREDENTIALS: &str = "invalid credentials";

/// Returns the subject id (school code for admins, row id otherwise) when
/// the credentials match an active account.
fn check_credentials(
    conn: &Connection,
    role: Role,
    school_code: &str,
    username: Option<&str>,
    password: &str,
) -> Result<Option<String>, HandlerErr> {
    let row: Option<(String, Option<String>)> = match role {
        Role::School => conn
            .query_row(
                "SELECT code, admin_password_hash FROM schools WHERE code = ?",
                [school_code],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_query)?,
        Role::Teacher | Role::Accountant => {
            let Some(employee_code) = username else {
                return Err(HandlerErr::bad_params("missing username"));
            };
            let kind = if role == Role::Teacher { "teacher" } else { "accountant" };
            conn.query_row(
                "SELECT id, password_hash FROM staff
                 WHERE school_code = ? AND employee_code = ? AND role_kind = ? AND status = 'active'",
                (school_code, employee_code, kind),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_query)?
        }
        Role::Student => {
            let Some(admission_no) = username else {
                return Err(HandlerErr::bad_params("missing username"));
            };
            conn.query_row(
                "SELECT id, password_hash FROM students
                 WHERE school_code = ? AND admission_no = ? AND status = 'active'",
                (school_code, admission_no),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_query)?
        }
    };
    Ok(match row {
        Some((subject, Some(hash))) if verify_password(password, &hash) => Some(subject),
        _ => None,
    })
}

fn session_not_issued(role: Role, e: &anyhow::Error) -> HandlerErr {
    tracing::error!(error = %e, "session token could not be issued");
    HandlerErr::new("unauthenticated", "session could not be issued")
        .with_details(json!({ "loginPath": role.login_path() }))
}

fn session_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let params = &req.params;
    let kind = required_str(params, "kind")?.to_ascii_lowercase();
    let role = Role::from_login_kind(&kind)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown login kind: {}", kind)))?;
    let school_code = normalize_school_code(&required_str(params, "schoolCode")?)?;
    let username = optional_str(params, "username");
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let limit_key = format!(
        "login:{}:{}:{}",
        kind,
        school_code,
        username.as_deref().unwrap_or("").to_ascii_lowercase()
    );
    if let Decision::Limited { retry_after } = state.login_limiter.check(&limit_key) {
        tracing::warn!(key = %limit_key, "login rate limited");
        let secs = retry_after.as_secs().max(1);
        return Err(HandlerErr::new("rate_limited", "too many login attempts")
            .with_details(json!({ "retryAfterSecs": secs })));
    }

    let conn = require_conn(state)?;
    let Some(subject_id) =
        check_credentials(conn, role, &school_code, username.as_deref(), password)?
    else {
        tracing::info!(school = %school_code, kind = %kind, "login rejected");
        return Err(HandlerErr::new("unauthenticated", BAD_CREDENTIALS)
            .with_details(json!({ "loginPath": role.login_path() })));
    };

    let (token, expires_at) = state
        .sessions
        .issue(role, &school_code, &subject_id, now_unix())
        .map_err(|e| session_not_issued(role, &e))?;
    state.login_limiter.reset(&limit_key);
    tracing::info!(school = %school_code, role = %role.tag(&school_code), "login");

    Ok(json!({
        "token": token,
        "role": role.tag(&school_code),
        "schoolCode": school_code,
        "subjectId": subject_id,
        "expiresAt": expires_at,
    }))
}

fn session_whoami(caller: &Caller) -> Result<serde_json::Value, HandlerErr> {
    let s = caller.session()?;
    Ok(json!({
        "role": s.role_tag(),
        "schoolCode": s.school_code,
        "subjectId": s.subject_id,
        "expiresAt": s.expires_at,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.login" => Some(respond(&req.id, session_login(state, req))),
        "session.whoami" => Some(respond(&req.id, session_whoami(caller))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_issue_reports_unauthenticated_with_login_path() {
        let e = session_not_issued(Role::Teacher, &anyhow::anyhow!("encode failed"));
        let resp = e.response("7");
        assert_eq!(resp["ok"].as_bool(), Some(false));
        assert_eq!(resp["error"]["code"].as_str(), Some("unauthenticated"));
        assert_eq!(
            resp["error"]["details"]["loginPath"].as_str(),
            Some("/teacher/login")
        );
    }
}
