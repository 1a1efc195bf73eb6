//! Read-only policy lookups consulted before expensive or lossy work.
//!
//! A missing policy source, or a missing key, always resolves to the safest
//! behaviour: every decision audited and every audit envelope signed.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::mac::{MacDecision, Operation};

/// Policy key: whether unsigned audit envelopes may be committed.
pub const KEY_ALLOW_UNSIGNED_AUDIT: &str = "audit.allow_unsigned";

/// Policy key: fraction of cached successful reads that get audited.
pub const KEY_AUDIT_SAMPLE_RATE: &str = "audit.sample_rate";

/// Policy key: deployment environment name.
pub const KEY_ENVIRONMENT: &str = "deployment.environment";

/// External source of policy values.
pub trait PolicySource: Send + Sync {
    /// Look up a boolean value.
    fn get_bool(&self, key: &str) -> Option<bool>;

    /// Look up a string value.
    fn get_str(&self, key: &str) -> Option<String>;

    /// Look up a numeric value.
    fn get_f64(&self, key: &str) -> Option<f64>;
}

/// A single policy value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric value.
    Number(f64),
    /// Free-form string.
    Text(String),
}

/// Fixed in-memory policy, typically built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    values: HashMap<String, PolicyValue>,
}

impl StaticPolicy {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning the policy for chaining.
    pub fn with(mut self, key: impl Into<String>, value: PolicyValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

impl PolicySource for StaticPolicy {
    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            PolicyValue::Bool(b) => Some(*b),
            PolicyValue::Text(t) => t.parse().ok(),
            PolicyValue::Number(_) => None,
        }
    }

    fn get_str(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            PolicyValue::Text(t) => Some(t.clone()),
            PolicyValue::Bool(b) => Some(b.to_string()),
            PolicyValue::Number(n) => Some(n.to_string()),
        }
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            PolicyValue::Number(n) => Some(*n),
            PolicyValue::Text(t) => t.parse().ok(),
            PolicyValue::Bool(_) => None,
        }
    }
}

/// Deployment environment, from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    Development,
    /// Ordinary production.
    #[default]
    Production,
    /// Defense-grade deployment: unsigned audit is never accepted.
    Defense,
}

impl Environment {
    /// Parse an environment name; unknown names map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            "defense" | "defence" => Some(Self::Defense),
            _ => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Defense => "defense",
        })
    }
}

/// Resolved audit behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditPolicy {
    environment: Environment,
    allow_unsigned: bool,
    sample_rate: f64,
}

impl AuditPolicy {
    /// Full auditing, signatures required.
    pub fn strict(environment: Environment) -> Self {
        Self {
            environment,
            allow_unsigned: false,
            sample_rate: 1.0,
        }
    }

    /// Resolve the policy from an optional source.
    ///
    /// The source's environment key overrides `environment` when present and
    /// recognised. In [`Environment::Defense`] unsigned audit is refused
    /// regardless of the source.
    pub fn resolve(source: Option<&dyn PolicySource>, environment: Environment) -> Self {
        let Some(source) = source else {
            return Self::strict(environment);
        };
        let environment = source
            .get_str(KEY_ENVIRONMENT)
            .and_then(|name| Environment::parse(&name))
            .unwrap_or(environment);
        let allow_unsigned = environment != Environment::Defense
            && source.get_bool(KEY_ALLOW_UNSIGNED_AUDIT).unwrap_or(false);
        let sample_rate = source
            .get_f64(KEY_AUDIT_SAMPLE_RATE)
            .filter(|r| r.is_finite())
            .map(|r| r.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        Self {
            environment,
            allow_unsigned,
            sample_rate,
        }
    }

    /// The effective environment.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Whether an unsigned envelope may be committed.
    pub fn allow_unsigned(&self) -> bool {
        self.allow_unsigned
    }

    /// Sampling rate for cached successful reads.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Whether a decision must be written to the audit chain.
    ///
    /// Denials and writes are always recorded. Only successful reads served
    /// from the decision cache are subject to sampling.
    pub fn should_record(&self, decision: &MacDecision, cache_hit: bool) -> bool {
        if !decision.allowed || decision.operation == Operation::Write || !cache_hit {
            return true;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.sample_rate)
    }
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::strict(Environment::default())
    }
}
