//! Kernel configuration.
//!
//! Loaded from `seckernel.toml`. Every section and field is optional; a
//! missing value takes the default below. Policy keys left unset stay unset
//! so that the audit policy falls back to its strict behaviour.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::audit::sanitize::SanitizeLimits;
use crate::label::{Lattice, LabelError, DEFAULT_LEVELS};
use crate::policy::{
    Environment, PolicyValue, StaticPolicy, KEY_ALLOW_UNSIGNED_AUDIT, KEY_AUDIT_SAMPLE_RATE,
    KEY_ENVIRONMENT,
};
use crate::signing::rotation::RotationConfig;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KernelConfig {
    /// Classification lattice.
    #[serde(default)]
    pub lattice: LatticeConfig,

    /// Cache capacities.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Audit chain and writer settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Key rotation schedule.
    #[serde(default)]
    pub rotation: RotationSettings,

    /// Deployment policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Security context defaults.
    #[serde(default)]
    pub context: ContextConfig,
}

/// Ordered classification levels, lowest first.
#[derive(Debug, Clone, Deserialize)]
pub struct LatticeConfig {
    /// Level names.
    #[serde(default = "default_levels")]
    pub levels: Vec<String>,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
        }
    }
}

/// Bounded cache capacities.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// MAC decisions kept (LRU).
    #[serde(default = "default_decision_capacity")]
    pub decision_capacity: usize,

    /// Domain strings kept (FIFO).
    #[serde(default = "default_domain_capacity")]
    pub domain_capacity: usize,

    /// Resolved envelope keys kept (LRU).
    #[serde(default = "default_key_capacity")]
    pub key_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            decision_capacity: default_decision_capacity(),
            domain_capacity: default_domain_capacity(),
            key_capacity: default_key_capacity(),
        }
    }
}

/// Audit chain settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Envelopes buffered before the oldest is evicted.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Events queued between the sink and the writer task.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Seconds between periodic flush attempts.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// SQLite database for the audit chain and key history.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Maximum payload nesting depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum fields per payload object.
    #[serde(default = "default_max_fields")]
    pub max_fields: usize,

    /// Maximum characters per payload string.
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            channel_capacity: default_channel_capacity(),
            flush_interval_secs: default_flush_interval_secs(),
            db_path: None,
            max_depth: default_max_depth(),
            max_fields: default_max_fields(),
            max_string_len: default_max_string_len(),
        }
    }
}

impl AuditConfig {
    /// Payload limits for the sanitiser.
    pub fn limits(&self) -> SanitizeLimits {
        SanitizeLimits {
            max_depth: self.max_depth,
            max_fields: self.max_fields,
            max_string_len: self.max_string_len,
        }
    }

    /// Periodic flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// Rotation schedule settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RotationSettings {
    /// Whether the background scheduler runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hours between scheduled rotations.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Jitter as a fraction of the interval.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Seconds before a failed rotation is retried.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Rotation history entries kept in memory.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: default_interval_hours(),
            jitter_fraction: default_jitter_fraction(),
            retry_backoff_secs: default_retry_backoff_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl RotationSettings {
    /// Settings as consumed by the key lifecycle.
    pub fn to_rotation_config(&self) -> RotationConfig {
        RotationConfig {
            interval: Duration::from_secs(self.interval_hours.saturating_mul(3600).max(1)),
            jitter_fraction: self.jitter_fraction,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs.max(1)),
            history_limit: self.history_limit,
        }
    }
}

/// Deployment policy. Unset keys are left to the strict defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// `development`, `production` or `defense`.
    #[serde(default)]
    pub environment: Option<String>,

    /// Permit unsigned audit envelopes. Ignored in `defense`.
    #[serde(default)]
    pub allow_unsigned_audit: Option<bool>,

    /// Sampling rate for cached successful reads.
    #[serde(default)]
    pub audit_sample_rate: Option<f64>,
}

impl PolicyConfig {
    /// Effective environment; unrecognised names fall back to production.
    pub fn environment(&self) -> Environment {
        self.environment
            .as_deref()
            .and_then(Environment::parse)
            .unwrap_or_default()
    }

    /// Policy source built from the keys that are set, if any.
    pub fn policy_source(&self) -> Option<StaticPolicy> {
        if self.environment.is_none()
            && self.allow_unsigned_audit.is_none()
            && self.audit_sample_rate.is_none()
        {
            return None;
        }
        let mut policy = StaticPolicy::new();
        if let Some(env) = &self.environment {
            policy = policy.with(KEY_ENVIRONMENT, PolicyValue::Text(env.clone()));
        }
        if let Some(allow) = self.allow_unsigned_audit {
            policy = policy.with(KEY_ALLOW_UNSIGNED_AUDIT, PolicyValue::Bool(allow));
        }
        if let Some(rate) = self.audit_sample_rate {
            policy = policy.with(KEY_AUDIT_SAMPLE_RATE, PolicyValue::Number(rate));
        }
        Some(policy)
    }
}

/// Security context defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Minutes before a context expires.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
        }
    }
}

impl ContextConfig {
    /// Context lifetime.
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.ttl_minutes.max(1))
            .unwrap_or_else(|| chrono::Duration::minutes(60))
    }
}

impl KernelConfig {
    /// Build the lattice.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty or duplicated level list.
    pub fn build_lattice(&self) -> Result<Lattice, LabelError> {
        Lattice::new(self.lattice.levels.iter())
    }
}

// Default value functions for serde

fn default_levels() -> Vec<String> {
    DEFAULT_LEVELS.iter().map(|l| (*l).to_owned()).collect()
}
fn default_decision_capacity() -> usize {
    1024
}
fn default_domain_capacity() -> usize {
    256
}
fn default_key_capacity() -> usize {
    128
}
fn default_buffer_capacity() -> usize {
    10_000
}
fn default_channel_capacity() -> usize {
    4096
}
fn default_flush_interval_secs() -> u64 {
    5
}
fn default_max_depth() -> usize {
    8
}
fn default_max_fields() -> usize {
    64
}
fn default_max_string_len() -> usize {
    4096
}
fn default_true() -> bool {
    true
}
fn default_interval_hours() -> u64 {
    24
}
fn default_jitter_fraction() -> f64 {
    0.1
}
fn default_retry_backoff_secs() -> u64 {
    300
}
fn default_history_limit() -> usize {
    100
}
fn default_ttl_minutes() -> i64 {
    60
}

/// Load and parse a TOML config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<KernelConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    parse_config(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))
}

/// Parse TOML config text.
///
/// # Errors
///
/// Returns an error if the text is not valid config TOML.
pub fn parse_config(contents: &str) -> Result<KernelConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Resolve the config directory (`~/.seckernel`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".seckernel"))
}
