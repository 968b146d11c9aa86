use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({ "id": id, "ok": false, "error": error })
}

/// Handler failure carried up to the response envelope.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        if self.code.starts_with("db_") || self.code == "io_failed" {
            tracing::warn!(id, code = self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(id, code = self.code, message = %self.message, "request rejected");
        }
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_query(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_tx(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

pub fn db_commit(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_commit_failed", e.to_string())
}

/// Maps a write failure to `code`, tagging the table involved.
pub fn db_write(code: &'static str, table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
}

impl From<crate::academic::AcademicError> for HandlerErr {
    fn from(e: crate::academic::AcademicError) -> Self {
        use crate::academic::AcademicError;
        match e {
            AcademicError::YearNotFound => HandlerErr::not_found("academic year"),
            AcademicError::ClassNotFound(id) => {
                HandlerErr::not_found("class").with_details(json!({ "classId": id }))
            }
            AcademicError::AlreadyCurrent | AcademicError::SameClass => {
                HandlerErr::bad_params(e.to_string())
            }
            AcademicError::Db(inner) => HandlerErr::new("db_update_failed", inner.to_string()),
        }
    }
}

impl From<crate::fees::FeeError> for HandlerErr {
    fn from(e: crate::fees::FeeError) -> Self {
        HandlerErr::bad_params(e.to_string())
    }
}

impl From<crate::dates::DateError> for HandlerErr {
    fn from(e: crate::dates::DateError) -> Self {
        HandlerErr::bad_params(e.to_string())
    }
}
