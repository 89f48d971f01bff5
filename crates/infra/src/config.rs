//! Configuration loading and representation.
//!
//! Every setting is a string-keyed property with a typed accessor and a
//! default. [`Settings`] resolves all of them once at startup so a malformed
//! value fails fast instead of surfacing inside a running job.

use std::collections::HashMap;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

/// Configuration error (bad value for a known key).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} is not {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, expected: &'static str) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }
}

/// String-keyed properties with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    /// Snapshot of the process environment.
    pub fn from_env() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    /// Build from explicit pairs (tests, embedding).
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.raw(key) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::invalid(key, value, "a boolean")),
        }
    }

    /// Integers accept `_` and `,` digit separators (`10_000`, `10,000`).
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        let Some(value) = self.raw(key) else {
            return Ok(default);
        };
        let digits: String = value.chars().filter(|c| !matches!(c, '_' | ',')).collect();
        digits
            .parse::<u64>()
            .map_err(|_| ConfigError::invalid(key, value, "a non-negative integer"))
    }

    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        let value = self.get_u64(key, u64::from(default))?;
        u32::try_from(value)
            .map_err(|_| ConfigError::invalid(key, &value.to_string(), "a 32-bit integer"))
    }

    pub fn get_secs(&self, key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
        self.get_u64(key, default_secs).map(Duration::from_secs)
    }
}

/// Weekday clock-time window in which gated jobs may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
    pub time_zone: Tz,
}

/// The four periodic job families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobFamily {
    Seed,
    Migration,
    Retry,
    Cleanup,
}

impl JobFamily {
    const fn enable_key(&self) -> &'static str {
        match self {
            JobFamily::Seed => "ENABLE_SEED_JOB",
            JobFamily::Migration => "ENABLE_MIGRATION_JOB",
            JobFamily::Retry => "ENABLE_RETRY_JOB",
            JobFamily::Cleanup => "ENABLE_CLEANUP_JOB",
        }
    }

    const fn delay_key(&self) -> (&'static str, u64) {
        match self {
            JobFamily::Seed => ("SEED_DELAY", 3_600),
            JobFamily::Migration => ("MIGRATION_DELAY", 0),
            JobFamily::Retry => ("RETRY_DELAY", 1_800),
            JobFamily::Cleanup => ("CLEANUP_DELAY", 3_600),
        }
    }
}

/// Gating and cadence of one job family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub enabled: bool,
    /// `None` when the family may run at any time.
    pub window: Option<WindowSettings>,
    pub default_delay: Duration,
}

/// Fully resolved worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub enable_global_locking: bool,
    pub global_lock_ttl: Duration,
    pub job_threads: usize,
    pub retry_threads: usize,
    pub seed: JobSettings,
    pub migration: JobSettings,
    pub retry: JobSettings,
    pub cleanup: JobSettings,
    pub retention_minutes: u64,
    pub batch_size: u32,
    pub retry_batch_size: u32,
    pub max_retries: u32,
    pub stale_range_after: Duration,
    pub database_url: String,
    pub redis_url: String,
    pub mover_failure_percent: u32,
    pub mover_target_prefix: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_properties(&Properties::from_env())
    }

    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let window = if props.get_bool("AFTER_HOURS", true)? {
            let zone_name = props.get_string("TIME_ZONE", "America/New_York");
            let time_zone = zone_name
                .parse::<Tz>()
                .map_err(|_| ConfigError::invalid("TIME_ZONE", &zone_name, "an IANA time zone"))?;
            Some(WindowSettings {
                start_hour: clock_field(props, "START_HOUR", 22, 23)?,
                start_minute: clock_field(props, "START_MINUTE", 0, 59)?,
                end_hour: clock_field(props, "END_HOUR", 6, 23)?,
                end_minute: clock_field(props, "END_MINUTE", 0, 59)?,
                time_zone,
            })
        } else {
            None
        };

        let enable_all = props.get_bool("ENABLE_JOB", false)?;
        let job = |family: JobFamily| -> Result<JobSettings, ConfigError> {
            let (delay_key, delay_default) = family.delay_key();
            Ok(JobSettings {
                enabled: props.get_bool(family.enable_key(), enable_all)?,
                window,
                default_delay: props.get_secs(delay_key, delay_default)?,
            })
        };

        Ok(Self {
            enable_global_locking: props.get_bool("ENABLE_GLOBAL_LOCKING", false)?,
            global_lock_ttl: Duration::from_secs(u64::from(positive(
                props,
                "GLOBAL_LOCK_TTL",
                7_200,
            )?)),
            job_threads: positive(props, "JOB_THREADS", 20)? as usize,
            retry_threads: positive(props, "RETRY_THREADS", 5)? as usize,
            seed: job(JobFamily::Seed)?,
            migration: job(JobFamily::Migration)?,
            retry: job(JobFamily::Retry)?,
            cleanup: job(JobFamily::Cleanup)?,
            retention_minutes: props.get_u64("RETENTION_PERIOD", 525_600)?,
            batch_size: positive(props, "BATCH_SIZE", 10_000)?,
            retry_batch_size: positive(props, "RETRY_BATCH_SIZE", 500)?,
            max_retries: props.get_u32("MAX_RETRIES", 3)?,
            stale_range_after: Duration::from_secs(
                props.get_u64("STALE_RANGE_MINUTES", 60)?.saturating_mul(60),
            ),
            database_url: props.get_string("DATABASE_URL", "postgres://localhost/migration"),
            redis_url: props.get_string("REDIS_URL", "redis://localhost:6379"),
            mover_failure_percent: clock_field(props, "MOVER_FAILURE_PERCENT", 5, 100)?,
            mover_target_prefix: props.get_string("MOVER_TARGET_PREFIX", "s3://migration-target/"),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Defaults never fail to parse.
        Self::from_properties(&Properties::default())
            .unwrap_or_else(|e| unreachable!("default settings are valid: {e}"))
    }
}

fn clock_field(props: &Properties, key: &str, default: u32, max: u32) -> Result<u32, ConfigError> {
    let value = props.get_u32(key, default)?;
    if value > max {
        return Err(ConfigError::invalid(key, &value.to_string(), "within range"));
    }
    Ok(value)
}

fn positive(props: &Properties, key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = props.get_u32(key, default)?;
    if value == 0 {
        return Err(ConfigError::invalid(key, "0", "a positive integer"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert!(!settings.enable_global_locking);
        assert_eq!(settings.global_lock_ttl, Duration::from_secs(7_200));
        assert_eq!(settings.job_threads, 20);
        assert_eq!(settings.retry_threads, 5);
        assert!(!settings.migration.enabled);
        assert_eq!(settings.migration.default_delay, Duration::ZERO);
        assert_eq!(settings.retry.default_delay, Duration::from_secs(1_800));
        assert_eq!(settings.batch_size, 10_000);
        assert_eq!(settings.stale_range_after, Duration::from_secs(3_600));

        let window = settings.seed.window.expect("after-hours is on by default");
        assert_eq!((window.start_hour, window.end_hour), (22, 6));
        assert_eq!(window.time_zone, chrono_tz::America::New_York);
    }

    #[test]
    fn integers_accept_digit_separators() {
        let props = Properties::from_pairs([("BATCH_SIZE", "25_000"), ("RETENTION_PERIOD", "1,440")]);
        let settings = Settings::from_properties(&props).unwrap();
        assert_eq!(settings.batch_size, 25_000);
        assert_eq!(settings.retention_minutes, 1_440);
    }

    #[test]
    fn family_switch_overrides_global_switch() {
        let props = Properties::from_pairs([
            ("ENABLE_JOB", "true"),
            ("ENABLE_RETRY_JOB", "false"),
            ("AFTER_HOURS", "false"),
        ]);
        let settings = Settings::from_properties(&props).unwrap();
        assert!(settings.seed.enabled);
        assert!(settings.migration.enabled);
        assert!(!settings.retry.enabled);
        assert!(settings.cleanup.window.is_none());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let props = Properties::from_pairs([("JOB_THREADS", "many")]);
        assert!(matches!(
            Settings::from_properties(&props),
            Err(ConfigError::Invalid { ref key, .. }) if key == "JOB_THREADS"
        ));

        let props = Properties::from_pairs([("ENABLE_JOB", "sometimes")]);
        assert!(Settings::from_properties(&props).is_err());

        let props = Properties::from_pairs([("START_HOUR", "24")]);
        assert!(Settings::from_properties(&props).is_err());

        let props = Properties::from_pairs([("TIME_ZONE", "Mars/Olympus")]);
        assert!(Settings::from_properties(&props).is_err());

        let props = Properties::from_pairs([("BATCH_SIZE", "0")]);
        assert!(Settings::from_properties(&props).is_err());

        for key in ["GLOBAL_LOCK_TTL", "JOB_THREADS", "RETRY_THREADS"] {
            let props = Properties::from_pairs([(key, "0")]);
            assert!(
                matches!(
                    Settings::from_properties(&props),
                    Err(ConfigError::Invalid { key: ref k, .. }) if k == key
                ),
                "{key}=0 must be rejected"
            );
        }
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let props = Properties::from_pairs([("GLOBAL_LOCK_TTL", "  ")]);
        let settings = Settings::from_properties(&props).unwrap();
        assert_eq!(settings.global_lock_ttl, Duration::from_secs(7_200));
    }
}
