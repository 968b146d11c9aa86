use std::path::{Path, PathBuf};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::rate_limit::RateLimiter;
use crate::session::{Role, Session, SessionKeys};
use rusqlite::Connection;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub session: Option<String>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub sessions: SessionKeys,
    pub login_limiter: RateLimiter,
    pub cache: CacheStore,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let secret = match config.session_secret.as_deref() {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => {
                tracing::warn!("no session secret configured; sessions will not survive a restart");
                Uuid::new_v4().to_string()
            }
        };
        Self {
            workspace: None,
            db: None,
            sessions: SessionKeys::new(&secret, config.session_ttl_secs),
            login_limiter: RateLimiter::new(config.login_rate_limit, config.login_rate_window()),
            cache: CacheStore::new(config.cache_ttl()),
        }
    }

    pub fn open_workspace(&mut self, path: &Path) -> anyhow::Result<()> {
        let conn = db::open_db(path)?;
        self.workspace = Some(path.to_path_buf());
        self.db = Some(conn);
        self.cache.invalidate_prefix("");
        tracing::info!(path = %path.display(), "workspace opened");
        Ok(())
    }
}

/// Who is calling. Public methods may run without a session.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub session: Option<Session>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self { session: None }
    }

    pub fn session(&self) -> Result<&Session, HandlerErr> {
        self.session
            .as_ref()
            .ok_or_else(|| HandlerErr::new("unauthenticated", "sign in first"))
    }

    pub fn school(&self) -> Result<&str, HandlerErr> {
        self.session().map(|s| s.school_code.as_str())
    }

    /// Audit actor label: `school:<CODE>` for admins, `<role>:<subject>` otherwise.
    pub fn actor(&self) -> String {
        match self.session.as_ref() {
            Some(s) if s.role == Role::School => s.role_tag(),
            Some(s) => format!("{}:{}", s.role_tag(), s.subject_id),
            None => "anonymous".to_string(),
        }
    }
}
