use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Weekday};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::MINUTE_MS;
use crate::crypto::{DEFAULT_KDF_ITERATIONS, MIN_KDF_ITERATIONS};
use crate::policy::{CriticalDayCalendar, PolicyEngineConfig};
use crate::token::{TokenLifetimes, TokenSettings};

const DEFAULT_DB_PATH: &str = "token_guard.db";
const DEFAULT_DEVICE_ID: &str = "local-device";
const DEFAULT_ROTATION_INTERVAL_MS: u64 = 5 * MINUTE_MS;
const DEFAULT_POLICY_CACHE_TTL_MS: u64 = 30_000;
const DEFAULT_EVALUATION_LOG_ENTRIES: usize = 1_000;

#[derive(Debug, Deserialize, Default)]
struct GuardConfigFile {
    db_path: Option<String>,
    device_secret_path: Option<PathBuf>,
    device_id: Option<String>,
    tokens: Option<TokensConfigFile>,
    rotation: Option<RotationConfigFile>,
    crypto: Option<CryptoConfigFile>,
    policy: Option<PolicyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TokensConfigFile {
    access_lifetime_ms: Option<u64>,
    refresh_lifetime_ms: Option<u64>,
    emergency_lifetime_ms: Option<u64>,
    temporary_lifetime_ms: Option<u64>,
    event_day_bonus_ms: Option<u64>,
    event_day_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RotationConfigFile {
    threshold_percent: Option<u8>,
    max_attempts: Option<u32>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CryptoConfigFile {
    kdf_iterations: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    cache_ttl_ms: Option<u64>,
    critical_weekdays: Option<Vec<String>>,
    critical_dates: Option<Vec<String>>,
    utc_offset_minutes: Option<i32>,
    policy_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub db_path: String,
    /// Defaults to `<db>.device.secret` next to the database.
    pub device_secret_path: Option<PathBuf>,
    pub device_id: String,
    pub tokens: TokenSettings,
    pub rotation_interval: Duration,
    pub kdf_iterations: u32,
    pub policy: PolicySettings,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub cache_ttl_ms: u64,
    pub calendar: CriticalDayCalendar,
    /// Extra policies loaded on top of the built-in set.
    pub policy_file: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            device_secret_path: None,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            tokens: TokenSettings::default(),
            rotation_interval: Duration::from_millis(DEFAULT_ROTATION_INTERVAL_MS),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            policy: PolicySettings {
                cache_ttl_ms: DEFAULT_POLICY_CACHE_TTL_MS,
                calendar: CriticalDayCalendar::default(),
                policy_file: None,
            },
        }
    }
}

impl GuardConfig {
    /// File named by `TOKEN_GUARD_CONFIG` (if any), then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TOKEN_GUARD_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Explicit path, or `<db stem>.device.secret` beside the database.
    /// SQLite `file:` URIs are reduced to their path part.
    pub fn device_secret_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.device_secret_path {
            return Ok(path.clone());
        }
        let db_file = match self.db_path.strip_prefix("file:") {
            Some(uri) => uri.split_once('?').map_or(uri, |(path, _)| path),
            None => self.db_path.as_str(),
        };
        if db_file.is_empty() || db_file == ":memory:" {
            return Err(anyhow!(
                "cannot place a device secret next to db_path '{}'; set device_secret_path",
                self.db_path
            ));
        }
        Ok(Path::new(db_file).with_extension("device.secret"))
    }

    pub fn engine_config(&self) -> PolicyEngineConfig {
        PolicyEngineConfig {
            cache_ttl_ms: self.policy.cache_ttl_ms,
            calendar: self.policy.calendar.clone(),
            max_log_entries: DEFAULT_EVALUATION_LOG_ENTRIES,
        }
    }

    fn from_file(file: GuardConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let tokens_file = file.tokens.unwrap_or_default();
        let rotation_file = file.rotation.unwrap_or_default();
        let policy_file = file.policy.unwrap_or_default();
        let default_lifetimes = defaults.tokens.lifetimes.clone();

        let tokens = TokenSettings {
            lifetimes: TokenLifetimes {
                access_ms: tokens_file
                    .access_lifetime_ms
                    .unwrap_or(default_lifetimes.access_ms),
                refresh_ms: tokens_file
                    .refresh_lifetime_ms
                    .unwrap_or(default_lifetimes.refresh_ms),
                emergency_ms: tokens_file
                    .emergency_lifetime_ms
                    .unwrap_or(default_lifetimes.emergency_ms),
                temporary_ms: tokens_file
                    .temporary_lifetime_ms
                    .unwrap_or(default_lifetimes.temporary_ms),
            },
            event_day_bonus_ms: tokens_file
                .event_day_bonus_ms
                .unwrap_or(defaults.tokens.event_day_bonus_ms),
            event_day_grace_ms: tokens_file
                .event_day_grace_ms
                .unwrap_or(defaults.tokens.event_day_grace_ms),
            rotation_threshold_percent: rotation_file
                .threshold_percent
                .unwrap_or(defaults.tokens.rotation_threshold_percent),
            max_rotation_attempts: rotation_file
                .max_attempts
                .unwrap_or(defaults.tokens.max_rotation_attempts),
        };

        let calendar = CriticalDayCalendar {
            weekdays: match policy_file.critical_weekdays {
                Some(days) => parse_weekdays(&days)?,
                None => defaults.policy.calendar.weekdays.clone(),
            },
            dates: match policy_file.critical_dates {
                Some(dates) => parse_dates(&dates)?,
                None => Vec::new(),
            },
            utc_offset_minutes: policy_file.utc_offset_minutes.unwrap_or(0),
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            device_secret_path: file.device_secret_path,
            device_id: file.device_id.unwrap_or(defaults.device_id),
            tokens,
            rotation_interval: rotation_file
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.rotation_interval),
            kdf_iterations: file
                .crypto
                .and_then(|crypto| crypto.kdf_iterations)
                .unwrap_or(defaults.kdf_iterations),
            policy: PolicySettings {
                cache_ttl_ms: policy_file
                    .cache_ttl_ms
                    .unwrap_or(defaults.policy.cache_ttl_ms),
                calendar,
                policy_file: policy_file.policy_file,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("TOKEN_GUARD_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(path) = std::env::var("TOKEN_GUARD_DEVICE_SECRET_PATH") {
            if !path.trim().is_empty() {
                self.device_secret_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(device_id) = std::env::var("TOKEN_GUARD_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id.trim().to_string();
            }
        }
        if let Ok(interval) = std::env::var("TOKEN_GUARD_ROTATION_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("TOKEN_GUARD_ROTATION_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.rotation_interval = Duration::from_millis(ms);
        }
        if let Ok(max) = std::env::var("TOKEN_GUARD_MAX_ROTATIONS") {
            self.tokens.max_rotation_attempts = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("TOKEN_GUARD_MAX_ROTATIONS must be a positive integer"))?;
        }
        if let Ok(dates) = std::env::var("TOKEN_GUARD_CRITICAL_DATES") {
            let parsed = split_csv(&dates);
            if !parsed.is_empty() {
                self.policy.calendar.dates = parse_dates(&parsed)?;
            }
        }
        if let Ok(ttl) = std::env::var("TOKEN_GUARD_POLICY_CACHE_TTL_MS") {
            self.policy.cache_ttl_ms = ttl.trim().parse().map_err(|_| {
                anyhow!("TOKEN_GUARD_POLICY_CACHE_TTL_MS must be an integer number of milliseconds")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path cannot be empty"));
        }
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device_id cannot be empty"));
        }
        for token_type in crate::token::TokenType::ALL {
            if self.tokens.lifetimes.base(token_type) == 0 {
                return Err(anyhow!("{} token lifetime must be greater than zero", token_type));
            }
        }
        let threshold = self.tokens.rotation_threshold_percent;
        if threshold == 0 || threshold > 100 {
            return Err(anyhow!(
                "rotation threshold must be within 1..=100 percent (got {})",
                threshold
            ));
        }
        if self.tokens.max_rotation_attempts == 0 {
            return Err(anyhow!("max rotation attempts must be at least 1"));
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(anyhow!(
                "kdf iterations must be >= {} (got {})",
                MIN_KDF_ITERATIONS,
                self.kdf_iterations
            ));
        }
        if self.rotation_interval.is_zero() {
            return Err(anyhow!("rotation interval must be greater than zero"));
        }
        if self.policy.cache_ttl_ms == 0 {
            return Err(anyhow!("policy cache ttl must be greater than zero"));
        }
        if self.policy.calendar.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(anyhow!("utc offset must be less than 24 hours"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GuardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_weekdays(values: &[String]) -> Result<Vec<Weekday>> {
    values
        .iter()
        .map(|value| {
            value
                .trim()
                .parse::<Weekday>()
                .map_err(|_| anyhow!("invalid weekday '{}'", value))
        })
        .collect()
}

fn parse_dates(values: &[String]) -> Result<Vec<NaiveDate>> {
    values
        .iter()
        .map(|value| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                .map_err(|_| anyhow!("invalid date '{}': expected YYYY-MM-DD", value))
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = GuardConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.tokens.rotation_threshold_percent, 80);
        assert_eq!(cfg.policy.calendar.weekdays, vec![Weekday::Sat]);
        assert_eq!(
            cfg.device_secret_path().unwrap(),
            PathBuf::from("token_guard.device.secret")
        );
    }

    #[test]
    fn secret_path_follows_db_path() {
        let mut cfg = GuardConfig {
            db_path: "data/guard.db".to_string(),
            ..GuardConfig::default()
        };
        assert_eq!(
            cfg.device_secret_path().unwrap(),
            PathBuf::from("data/guard.device.secret")
        );
        cfg.db_path = "file:data/guard.db?mode=rwc".to_string();
        assert_eq!(
            cfg.device_secret_path().unwrap(),
            PathBuf::from("data/guard.device.secret")
        );
        cfg.db_path = ":memory:".to_string();
        assert!(cfg.device_secret_path().is_err());
        cfg.device_secret_path = Some(PathBuf::from("/secure/device.secret"));
        assert_eq!(
            cfg.device_secret_path().unwrap(),
            PathBuf::from("/secure/device.secret")
        );
    }

    #[test]
    fn parses_calendar_values() {
        assert_eq!(
            parse_weekdays(&["Fri".to_string(), "sunday".to_string()]).unwrap(),
            vec![Weekday::Fri, Weekday::Sun]
        );
        assert!(parse_weekdays(&["someday".to_string()]).is_err());
        assert!(parse_dates(&["2024-02-30".to_string()]).is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut cfg = GuardConfig::default();
        cfg.tokens.rotation_threshold_percent = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GuardConfig::default();
        cfg.tokens.lifetimes.temporary_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GuardConfig::default();
        cfg.kdf_iterations = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = GuardConfig::default();
        cfg.rotation_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
