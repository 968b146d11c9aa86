use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// School-management sidecar: one JSON request per stdin line, one JSON
/// response per stdout line.
#[derive(Debug, Clone, Parser)]
#[command(name = "schoold", version)]
pub struct Config {
    /// Workspace directory to open at startup.
    #[arg(long, env = "SCHOOLD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Secret used to sign session tokens. A random one is generated when unset.
    #[arg(long, env = "SCHOOLD_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    #[arg(long, env = "SCHOOLD_SESSION_TTL_SECS", default_value_t = 12 * 60 * 60)]
    pub session_ttl_secs: u64,

    /// Login attempts allowed per account within one window.
    #[arg(long, env = "SCHOOLD_LOGIN_RATE_LIMIT", default_value_t = 5)]
    pub login_rate_limit: u32,

    #[arg(long, env = "SCHOOLD_LOGIN_RATE_WINDOW_SECS", default_value_t = 60)]
    pub login_rate_window_secs: u64,

    /// TTL for cached dashboard views; 0 disables caching.
    #[arg(long, env = "SCHOOLD_CACHE_TTL_SECS", default_value_t = 30)]
    pub cache_ttl_secs: u64,

    /// `tracing` filter directive, e.g. `info` or `schoold=debug`.
    #[arg(long, env = "SCHOOLD_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Config {
    pub fn login_rate_window(&self) -> Duration {
        Duration::from_secs(self.login_rate_window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags() {
        let cfg = Config::try_parse_from(["schoold"]).expect("parse");
        assert_eq!(cfg.session_ttl_secs, 43_200);
        assert_eq!(cfg.login_rate_limit, 5);
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::try_parse_from([
            "schoold",
            "--workspace",
            "/tmp/ws",
            "--cache-ttl-secs",
            "0",
            "--login-rate-limit",
            "2",
        ])
        .expect("parse");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/ws")));
        assert!(cfg.cache_ttl().is_zero());
        assert_eq!(cfg.login_rate_limit, 2);
    }
}
