use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};

pub const DEFAULT_LOCK_PREFIX: &str = "remotelock:";
const LOCK_DB_FILE_NAME: &str = "mailpoll-locks.db";

/// Connect and read timeouts handed to the transport on `begin()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            read: Duration::from_secs(30),
        }
    }
}

/// Runtime settings. Defaults work without any file; a TOML file and
/// `MAILPOLL_*` environment variables override them, in that order.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub lock_prefix: String,
    pub lock_retry_millis: u64,
    pub lock_wait_secs: u64,
    /// Holds not renewed for this long are considered abandoned. Zero (the
    /// default) disables expiry: a crashed worker's hold then stays until
    /// removed by hand, but a live hold can never be taken over.
    pub lock_lease_secs: u64,
    pub poll_interval_secs: u64,
    pub convert_html: bool,
    pub wrap_width: usize,
    pub lock_db: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            lock_retry_millis: 500,
            lock_wait_secs: 10,
            lock_lease_secs: 0,
            poll_interval_secs: 60,
            convert_html: true,
            wrap_width: 80,
            lock_db: None,
        }
    }
}

impl Settings {
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let base = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AppError::Config(format!("reading {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    pub fn from_toml_str(raw: &str) -> AppResult<Self> {
        let settings: Settings =
            toml::from_str(raw).map_err(|e| AppError::Config(format!("invalid TOML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn with_env_overrides(mut self) -> AppResult<Self> {
        if let Some(v) = env_u64("MAILPOLL_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = env_u64("MAILPOLL_READ_TIMEOUT_SECS") {
            self.read_timeout_secs = v;
        }
        if let Ok(v) = env::var("MAILPOLL_LOCK_PREFIX") {
            self.lock_prefix = v;
        }
        if let Some(v) = env_u64("MAILPOLL_LOCK_RETRY_MILLIS") {
            self.lock_retry_millis = v;
        }
        if let Some(v) = env_u64("MAILPOLL_LOCK_WAIT_SECS") {
            self.lock_wait_secs = v;
        }
        if let Some(v) = env_u64("MAILPOLL_LOCK_LEASE_SECS") {
            self.lock_lease_secs = v;
        }
        if let Some(v) = env_u64("MAILPOLL_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = v;
        }
        if let Ok(v) = env::var("MAILPOLL_CONVERT_HTML") {
            self.convert_html = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("MAILPOLL_LOCK_DB") {
            self.lock_db = Some(PathBuf::from(v));
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> AppResult<()> {
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(AppError::Config("timeouts must be at least one second".into()));
        }
        if self.lock_prefix.is_empty() {
            return Err(AppError::Config("lock_prefix must not be empty".into()));
        }
        if self.wrap_width < 10 {
            return Err(AppError::Config("wrap_width must be at least 10".into()));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
        }
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_millis.max(1))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        (self.lock_lease_secs > 0).then(|| Duration::from_secs(self.lock_lease_secs))
    }

    /// How often a pass refreshes its hold: three times per lease.
    pub fn lock_renew_interval(&self) -> Option<Duration> {
        self.lock_lease().map(|lease| lease / 3)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn lock_db_path(&self) -> AppResult<PathBuf> {
        if let Some(path) = &self.lock_db {
            return Ok(path.clone());
        }
        let base = dirs::data_dir()
            .ok_or_else(|| AppError::Config("no data directory for lock database".into()))?;
        Ok(base.join("mailpoll").join(LOCK_DB_FILE_NAME))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_transport_timeouts() {
        let settings = Settings::default();
        assert_eq!(settings.timeouts(), Timeouts::default());
        assert_eq!(settings.lock_prefix, "remotelock:");
        assert_eq!(settings.lock_lease(), None);
        assert_eq!(settings.lock_renew_interval(), None);
    }

    #[test]
    fn lease_renews_three_times_per_period() {
        let settings = Settings::from_toml_str("lock_lease_secs = 90").expect("parse");
        assert_eq!(settings.lock_lease(), Some(Duration::from_secs(90)));
        assert_eq!(settings.lock_renew_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str("read_timeout_secs = 5\nconvert_html = false\n")
            .expect("parse");
        assert_eq!(settings.read_timeout_secs, 5);
        assert!(!settings.convert_html);
        assert_eq!(settings.connect_timeout_secs, 30);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = Settings::from_toml_str("connect_timeout_secs = 0").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
