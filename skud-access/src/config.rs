//! Runtime configuration
//!
//! Everything is read from environment variables. Unset variables fall back
//! to defaults; malformed ones are errors rather than silently ignored.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use log::warn;
use thiserror::Error;

use crate::challenge::DEFAULT_CHALLENGE_TTL_SECS;
use crate::card::DEFAULT_TOKEN_GRACE_SECS;
use crate::crypto::AesKey;
use crate::desfire::session::DEFAULT_SESSION_TTL_SECS;
use crate::identity::IdentityPolicy;
use crate::store::snapshot::default_storage_dir;

/// Master key used when none is configured. Development only.
pub const DEV_MASTER_KEY_HEX: &str = "0123456789ABCDEF0123456789ABCDEF";

/// Default DESFire application id
pub const DEFAULT_APP_ID: [u8; 3] = [0x01, 0x00, 0x00];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DESFIRE_MASTER_KEY must be 32 hex characters")]
    InvalidMasterKey,
    #[error("DESFIRE_APP_ID must be 6 hex characters")]
    InvalidAppId,
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{name} must be a boolean, got {value:?}")]
    InvalidFlag { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub master_key: AesKey,
    /// True when `master_key` is the built-in development key
    pub dev_master_key: bool,
    pub app_id: [u8; 3],
    pub session_ttl: Duration,
    pub session_sweep: StdDuration,
    pub challenge_ttl: Duration,
    pub challenge_sweep: StdDuration,
    pub token_grace: Duration,
    pub token_sweep: StdDuration,
    /// Access logs older than this are purged; `None` keeps them forever
    pub log_retention: Option<Duration>,
    pub identity_policy: IdentityPolicy,
    pub storage_dir: PathBuf,
    pub snapshot_interval: StdDuration,
}

impl Default for Config {
    fn default() -> Self {
        let mut master_key = [0u8; 16];
        // Constant is valid hex of the right length
        let _ = hex::decode_to_slice(DEV_MASTER_KEY_HEX, &mut master_key);
        Self {
            master_key,
            dev_master_key: true,
            app_id: DEFAULT_APP_ID,
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            session_sweep: StdDuration::from_secs(10),
            challenge_ttl: Duration::seconds(DEFAULT_CHALLENGE_TTL_SECS),
            challenge_sweep: StdDuration::from_secs(60),
            token_grace: Duration::seconds(DEFAULT_TOKEN_GRACE_SECS),
            token_sweep: StdDuration::from_secs(60),
            log_retention: None,
            identity_policy: IdentityPolicy::Lenient,
            storage_dir: default_storage_dir(),
            snapshot_interval: StdDuration::from_secs(30),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dev_master_key", &self.dev_master_key)
            .field("app_id", &hex::encode_upper(self.app_id))
            .field("session_ttl", &self.session_ttl)
            .field("challenge_ttl", &self.challenge_ttl)
            .field("token_grace", &self.token_grace)
            .field("log_retention", &self.log_retention)
            .field("identity_policy", &self.identity_policy)
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<u64>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<bool>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidFlag { name, value }),
        },
    }
}

/// Upper bound keeps chrono's range checks out of reach
const MAX_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn chrono_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_SECS) as i64)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        match lookup("DESFIRE_MASTER_KEY").filter(|v| !v.trim().is_empty()) {
            Some(value) => {
                hex::decode_to_slice(value.trim(), &mut config.master_key)
                    .map_err(|_| ConfigError::InvalidMasterKey)?;
                config.dev_master_key = false;
            }
            None => warn!("DESFIRE_MASTER_KEY not set, using the development master key"),
        }

        if let Some(value) = lookup("DESFIRE_APP_ID") {
            hex::decode_to_slice(value.trim(), &mut config.app_id).map_err(|_| ConfigError::InvalidAppId)?;
        }

        if let Some(secs) = seconds(&lookup, "SKUD_SESSION_TTL_SECS")? {
            config.session_ttl = chrono_secs(secs);
        }
        if let Some(secs) = seconds(&lookup, "SKUD_SESSION_SWEEP_SECS")? {
            config.session_sweep = StdDuration::from_secs(secs.max(1));
        }
        if let Some(secs) = seconds(&lookup, "SKUD_CHALLENGE_TTL_SECS")? {
            config.challenge_ttl = chrono_secs(secs);
        }
        if let Some(secs) = seconds(&lookup, "SKUD_CHALLENGE_SWEEP_SECS")? {
            config.challenge_sweep = StdDuration::from_secs(secs.max(1));
        }
        if let Some(secs) = seconds(&lookup, "SKUD_TOKEN_GRACE_SECS")? {
            config.token_grace = chrono_secs(secs);
        }
        if let Some(secs) = seconds(&lookup, "SKUD_TOKEN_SWEEP_SECS")? {
            config.token_sweep = StdDuration::from_secs(secs.max(1));
        }
        if let Some(days) = seconds(&lookup, "SKUD_LOG_RETENTION_DAYS")? {
            config.log_retention = (days > 0).then(|| chrono_secs(days.saturating_mul(24 * 60 * 60)));
        }
        if let Some(secs) = seconds(&lookup, "SKUD_SNAPSHOT_SECS")? {
            config.snapshot_interval = StdDuration::from_secs(secs.max(1));
        }
        if let Some(strict) = flag(&lookup, "SKUD_REQUIRE_HARDWARE_ID")? {
            config.identity_policy = if strict { IdentityPolicy::Strict } else { IdentityPolicy::Lenient };
        }
        if let Some(dir) = lookup("SKUD_STORAGE_DIR").filter(|v| !v.trim().is_empty()) {
            config.storage_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}
