//! Async host processing configuration.
//!
//! One [`TaskConfig`] per [`TaskKind`] plus settings shared by every collector.
//! The configuration is built once at startup and handed by reference to the
//! write API and the collectors; nothing reads ambient global state.
//!
//! ## Environment
//!
//! Per kind (`<KIND>` is `LABEL_MEMBERSHIP`, `POLICY_MEMBERSHIP`,
//! `SCHEDULED_QUERY_STATS` or `HOST_LAST_SEEN`):
//!
//! - `FLEET_ASYNC_<KIND>_ENABLED` (`true`/`false`/`1`/`0`)
//! - `FLEET_ASYNC_<KIND>_COLLECT_INTERVAL_SECS`
//! - `FLEET_ASYNC_<KIND>_INSERT_BATCH`, `..._DELETE_BATCH`, `..._UPDATE_BATCH`
//! - `FLEET_ASYNC_<KIND>_SCAN_PAGE_SIZE`, `..._POP_BATCH`
//!
//! Shared:
//!
//! - `FLEET_ASYNC_COLLECT_MAX_JITTER_PERCENT` (0-100)
//! - `FLEET_ASYNC_COLLECT_LOCK_TIMEOUT_SECS`
//! - `FLEET_ASYNC_KEY_RETENTION_SECS`
//! - `FLEET_ASYNC_LOG_STATS_INTERVAL_SECS`
//! - `FLEET_ASYNC_POLICY_RESULTS_CAP`

use std::time::Duration;

use crate::error::{Error, Result};
use crate::kind::TaskKind;

/// Default collection interval.
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(60);

/// Default maximum jitter applied to each collection wait, in percent.
pub const DEFAULT_MAX_JITTER_PERCENT: u8 = 10;

/// Default collector lock TTL, which also bounds a single run.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default minimum lifetime of buffered keys and active-index entries.
pub const DEFAULT_KEY_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default interval between collector stats log lines.
pub const DEFAULT_LOG_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on buffered policy results per host.
pub const DEFAULT_POLICY_RESULTS_CAP: usize = 1000;

/// Multiplier applied to the collect interval when computing buffer TTLs.
pub const KEY_TTL_INTERVAL_FACTOR: u32 = 10;

const ENV_PREFIX: &str = "FLEET_ASYNC";

/// Settings for one task kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    /// Whether writes are buffered and collected asynchronously.
    pub enabled: bool,
    /// Base wait between collection attempts.
    pub collect_interval: Duration,
    /// Maximum rows per durable insert/upsert statement.
    pub insert_batch_size: usize,
    /// Maximum rows per durable delete statement.
    pub delete_batch_size: usize,
    /// Maximum hosts per durable timestamp update.
    pub update_batch_size: usize,
    /// Entries requested per scan of the active index or a buffer hash.
    pub scan_page_size: usize,
    /// Entries popped per round trip when draining sorted-set buffers.
    pub pop_batch_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            insert_batch_size: 2000,
            delete_batch_size: 2000,
            update_batch_size: 1000,
            scan_page_size: 1000,
            pop_batch_size: 1000,
        }
    }
}

impl TaskConfig {
    /// Returns an enabled copy of the default settings.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    fn validate(&self, kind: TaskKind) -> Result<()> {
        let sizes = [
            ("insert_batch_size", self.insert_batch_size),
            ("delete_batch_size", self.delete_batch_size),
            ("update_batch_size", self.update_batch_size),
            ("scan_page_size", self.scan_page_size),
            ("pop_batch_size", self.pop_batch_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::configuration(format!(
                    "{kind}.{name} must be greater than 0"
                )));
            }
        }
        if self.collect_interval.is_zero() {
            return Err(Error::configuration(format!(
                "{kind}.collect_interval must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Configuration for the async host processing subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncConfig {
    /// Label membership settings.
    pub label_membership: TaskConfig,
    /// Policy membership settings.
    pub policy_membership: TaskConfig,
    /// Scheduled query stats settings.
    pub scheduled_query_stats: TaskConfig,
    /// Host last-seen settings.
    pub host_last_seen: TaskConfig,
    /// Maximum +/- jitter applied to each collection wait, in percent.
    pub max_jitter_percent: u8,
    /// Collector lock TTL; a run is cancelled once it exceeds this.
    pub lock_timeout: Duration,
    /// Minimum lifetime of buffered keys and active-index entries.
    pub key_retention: Duration,
    /// Interval between collector stats log lines.
    pub log_stats_interval: Duration,
    /// Maximum number of buffered policy results kept per host.
    pub policy_results_cap: usize,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            label_membership: TaskConfig::default(),
            policy_membership: TaskConfig::default(),
            scheduled_query_stats: TaskConfig::default(),
            host_last_seen: TaskConfig::default(),
            max_jitter_percent: DEFAULT_MAX_JITTER_PERCENT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            key_retention: DEFAULT_KEY_RETENTION,
            log_stats_interval: DEFAULT_LOG_STATS_INTERVAL,
            policy_results_cap: DEFAULT_POLICY_RESULTS_CAP,
        }
    }
}

impl AsyncConfig {
    /// Returns the default configuration with every task kind enabled.
    #[must_use]
    pub fn all_enabled() -> Self {
        let mut config = Self::default();
        for kind in TaskKind::ALL {
            config.task_mut(kind).enabled = true;
        }
        config
    }

    /// Returns the settings for a task kind.
    #[must_use]
    pub const fn task(&self, kind: TaskKind) -> &TaskConfig {
        match kind {
            TaskKind::LabelMembership => &self.label_membership,
            TaskKind::PolicyMembership => &self.policy_membership,
            TaskKind::ScheduledQueryStats => &self.scheduled_query_stats,
            TaskKind::HostLastSeen => &self.host_last_seen,
        }
    }

    /// Returns mutable settings for a task kind.
    pub fn task_mut(&mut self, kind: TaskKind) -> &mut TaskConfig {
        match kind {
            TaskKind::LabelMembership => &mut self.label_membership,
            TaskKind::PolicyMembership => &mut self.policy_membership,
            TaskKind::ScheduledQueryStats => &mut self.scheduled_query_stats,
            TaskKind::HostLastSeen => &mut self.host_last_seen,
        }
    }

    /// Returns the TTL applied to buffered keys of a task kind.
    ///
    /// The TTL is `max(key_retention, 10 x collect_interval)` so a buffer survives
    /// until the next collection even when several cycles are skipped.
    #[must_use]
    pub fn key_ttl(&self, kind: TaskKind) -> Duration {
        let interval_ttl = self
            .task(kind)
            .collect_interval
            .saturating_mul(KEY_TTL_INTERVAL_FACTOR);
        interval_ttl.max(self.key_retention)
    }

    /// Validates all settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        for kind in TaskKind::ALL {
            self.task(kind).validate(kind)?;
        }
        if self.max_jitter_percent > 100 {
            return Err(Error::configuration(format!(
                "max_jitter_percent must be at most 100, got {}",
                self.max_jitter_percent
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::configuration("lock_timeout must be greater than 0"));
        }
        if self.key_retention.is_zero() {
            return Err(Error::configuration("key_retention must be greater than 0"));
        }
        if self.policy_results_cap == 0 {
            return Err(Error::configuration(
                "policy_results_cap must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is present but invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is present but invalid.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        for kind in TaskKind::ALL {
            let prefix = format!("{ENV_PREFIX}_{}", kind.env_name());
            let task = config.task_mut(kind);

            if let Some(enabled) = parse_bool_env(&get_env, &format!("{prefix}_ENABLED"))? {
                task.enabled = enabled;
            }
            if let Some(secs) =
                parse_positive_u64_env(&get_env, &format!("{prefix}_COLLECT_INTERVAL_SECS"))?
            {
                task.collect_interval = Duration::from_secs(secs);
            }
            let sizes: [(&str, &mut usize); 5] = [
                ("INSERT_BATCH", &mut task.insert_batch_size),
                ("DELETE_BATCH", &mut task.delete_batch_size),
                ("UPDATE_BATCH", &mut task.update_batch_size),
                ("SCAN_PAGE_SIZE", &mut task.scan_page_size),
                ("POP_BATCH", &mut task.pop_batch_size),
            ];
            for (suffix, slot) in sizes {
                if let Some(value) = parse_positive_usize_env(&get_env, &format!("{prefix}_{suffix}"))? {
                    *slot = value;
                }
            }
        }

        let jitter_key = format!("{ENV_PREFIX}_COLLECT_MAX_JITTER_PERCENT");
        if let Some(raw) = get_env(&jitter_key) {
            let parsed = raw.trim().parse::<u8>().map_err(|_| {
                Error::configuration(format!("{jitter_key} must be an integer 0-100, got '{raw}'"))
            })?;
            config.max_jitter_percent = parsed;
        }
        if let Some(secs) =
            parse_positive_u64_env(&get_env, &format!("{ENV_PREFIX}_COLLECT_LOCK_TIMEOUT_SECS"))?
        {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) =
            parse_positive_u64_env(&get_env, &format!("{ENV_PREFIX}_KEY_RETENTION_SECS"))?
        {
            config.key_retention = Duration::from_secs(secs);
        }
        if let Some(secs) =
            parse_positive_u64_env(&get_env, &format!("{ENV_PREFIX}_LOG_STATS_INTERVAL_SECS"))?
        {
            config.log_stats_interval = Duration::from_secs(secs);
        }
        if let Some(cap) =
            parse_positive_usize_env(&get_env, &format!("{ENV_PREFIX}_POLICY_RESULTS_CAP"))?
        {
            config.policy_results_cap = cap;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_bool_env<F>(get_env: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::configuration(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(None);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than 0"
        )));
    }
    Ok(Some(parsed))
}

fn parse_positive_usize_env<F>(get_env: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    parse_positive_u64_env(get_env, key)?
        .map(|value| {
            usize::try_from(value).map_err(|_| {
                Error::configuration(format!("{key} value {value} exceeds supported range"))
            })
        })
        .transpose()
}
