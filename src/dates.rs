use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DateError {
    #[error("date must not be empty")]
    Empty,
    #[error("unrecognised date: {0}")]
    Unrecognised(String),
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY`, `DD-MM-YYYY`, and RFC 3339 timestamps
/// (only the date part is kept).
pub fn parse_date(raw: &str) -> Result<NaiveDate, DateError> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(DateError::Empty);
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(t, fmt) {
            return Ok(d);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(t) {
        return Ok(ts.date_naive());
    }
    Err(DateError::Unrecognised(t.to_string()))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Whole days from `from` to `to`; negative when `to` is earlier.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}
