use super::access;
use super::handlers;
use super::types::{AppState, Caller, Request};
use crate::ipc::error::err;

/// Final method segments that never mutate data.
const READ_ONLY_SUFFIXES: &[&str] = &[
    "list", "get", "day", "summary", "student", "defaulters", "loans", "roster", "results",
    "check", "modules", "stats", "me", "whoami", "export",
];

fn is_read_only(method: &str) -> bool {
    match method.rsplit('.').next() {
        Some(last) => READ_ONLY_SUFFIXES.contains(&last) || method == "health",
        None => false,
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");

    let caller = match access::authorize(state, &req) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let resp = dispatch(state, &req, &caller);

    let succeeded = resp.get("ok").and_then(|v| v.as_bool()) == Some(true);
    if succeeded && !is_read_only(&req.method) {
        if let Some(session) = caller.session.as_ref() {
            state
                .cache
                .invalidate_prefix(&format!("{}:", session.school_code));
        }
    }
    resp
}

fn dispatch(state: &mut AppState, req: &Request, caller: &Caller) -> serde_json::Value {
    type TryHandle = fn(&mut AppState, &Request, &Caller) -> Option<serde_json::Value>;
    const FAMILIES: &[TryHandle] = &[
        handlers::core::try_handle,
        handlers::auth::try_handle,
        handlers::schools::try_handle,
        handlers::rbac::try_handle,
        handlers::academic_years::try_handle,
        handlers::classes::try_handle,
        handlers::students::try_handle,
        handlers::staff::try_handle,
        handlers::attendance::try_handle,
        handlers::fees::try_handle,
        handlers::library::try_handle,
        handlers::transport::try_handle,
        handlers::exams::try_handle,
        handlers::certificates::try_handle,
        handlers::leave::try_handle,
        handlers::gate_passes::try_handle,
        handlers::reports::try_handle,
        handlers::dashboard::try_handle,
        handlers::audit_log::try_handle,
    ];

    for family in FAMILIES {
        if let Some(resp) = family(state, req, caller) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_detection() {
        assert!(is_read_only("students.list"));
        assert!(is_read_only("fees.student"));
        assert!(is_read_only("dashboard.stats"));
        assert!(is_read_only("health"));
        assert!(!is_read_only("students.create"));
        assert!(!is_read_only("fees.pay"));
        assert!(!is_read_only("academicYears.activate"));
    }
}
