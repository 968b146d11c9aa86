//! Signed session tokens.
//!
//! A token is `hex(payload_json) "." hex(signature)` where the signature is
//! `sha256(secret || sha256(secret || payload_json))`. The payload carries the
//! role tag (`school:<CODE>`, `teacher`, `student`, `accountant`), the tenant,
//! the subject id and an expiry in unix seconds.

use crate::password::constant_time_eq;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    School,
    Teacher,
    Student,
    Accountant,
}

impl Role {
    pub fn tag(self, school_code: &str) -> String {
        match self {
            Role::School => format!("school:{}", school_code),
            Role::Teacher => "teacher".to_string(),
            Role::Student => "student".to_string(),
            Role::Accountant => "accountant".to_string(),
        }
    }

    /// Parses a role tag. For `school:<CODE>` the embedded code is returned too.
    pub fn parse_tag(tag: &str) -> Option<(Role, Option<&str>)> {
        if let Some(code) = tag.strip_prefix("school:") {
            return (!code.is_empty()).then_some((Role::School, Some(code)));
        }
        match tag {
            "teacher" => Some((Role::Teacher, None)),
            "student" => Some((Role::Student, None)),
            "accountant" => Some((Role::Accountant, None)),
            _ => None,
        }
    }

    pub fn from_login_kind(kind: &str) -> Option<Role> {
        match kind {
            "school" | "admin" => Some(Role::School),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "accountant" => Some(Role::Accountant),
            _ => None,
        }
    }

    pub fn login_path(self) -> &'static str {
        match self {
            Role::School => "/login",
            Role::Teacher => "/teacher/login",
            Role::Student => "/student/login",
            Role::Accountant => "/accountant/login",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    role: String,
    school_code: String,
    subject_id: String,
    exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub role: Role,
    pub school_code: String,
    pub subject_id: String,
    pub expires_at: i64,
}

impl Session {
    pub fn role_tag(&self) -> String {
        self.role.tag(&self.school_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("malformed session token")]
    Malformed,
    #[error("session signature mismatch")]
    BadSignature,
    #[error("session expired")]
    Expired,
    #[error("unknown role tag: {0}")]
    UnknownRole(String),
}

pub struct SessionKeys {
    secret: Vec<u8>,
    ttl_secs: i64,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Returns `(token, expires_at)`.
    pub fn issue(
        &self,
        role: Role,
        school_code: &str,
        subject_id: &str,
        now: i64,
    ) -> anyhow::Result<(String, i64)> {
        let exp = now.saturating_add(self.ttl_secs);
        let payload = Payload {
            role: role.tag(school_code),
            school_code: school_code.to_string(),
            subject_id: subject_id.to_string(),
            exp,
        };
        let body = serde_json::to_vec(&payload)?;
        let token = format!("{}.{}", hex::encode(&body), hex::encode(self.sign(&body)));
        Ok((token, exp))
    }

    pub fn verify(&self, token: &str, now: i64) -> Result<Session, SessionError> {
        let (body_hex, sig_hex) = token.trim().split_once('.').ok_or(SessionError::Malformed)?;
        let body = hex::decode(body_hex).map_err(|_| SessionError::Malformed)?;
        let sig = hex::decode(sig_hex).map_err(|_| SessionError::Malformed)?;
        if !constant_time_eq(&self.sign(&body), &sig) {
            return Err(SessionError::BadSignature);
        }
        let payload: Payload =
            serde_json::from_slice(&body).map_err(|_| SessionError::Malformed)?;
        if payload.exp <= now {
            return Err(SessionError::Expired);
        }
        let (role, tag_code) = Role::parse_tag(&payload.role)
            .ok_or_else(|| SessionError::UnknownRole(payload.role.clone()))?;
        if tag_code.is_some_and(|c| c != payload.school_code) {
            return Err(SessionError::Malformed);
        }
        Ok(Session {
            role,
            school_code: payload.school_code,
            subject_id: payload.subject_id,
            expires_at: payload.exp,
        })
    }

    fn sign(&self, body: &[u8]) -> Vec<u8> {
        let inner = Sha256::new()
            .chain_update(&self.secret)
            .chain_update(body)
            .finalize();
        Sha256::new()
            .chain_update(&self.secret)
            .chain_update(inner)
            .finalize()
            .to_vec()
    }
}
