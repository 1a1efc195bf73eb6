//! Classification lattice, security labels, and entity label extraction.
//!
//! A [`SecurityLabel`] pairs a classification level with a set of
//! compartments. Levels are only meaningful relative to a [`Lattice`], the
//! fixed ordered list of known classifications. A level missing from the
//! lattice has no rank and every check involving it denies.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Levels used when no lattice is configured, lowest first.
pub const DEFAULT_LEVELS: &[&str] = &["public", "internal", "confidential", "secret", "top_secret"];

/// Field that marks an entity as polyinstantiated.
pub const POLYINSTANTIATED_FIELD: &str = "classification_level";

/// Field holding a polyinstantiated entity's private payload.
pub const INSTANCE_DATA_FIELD: &str = "instance_data";

/// Errors building a lattice or parsing a label.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    /// The lattice was configured with no levels.
    #[error("lattice must contain at least one level")]
    EmptyLattice,
    /// A level appears twice in the lattice.
    #[error("duplicate lattice level: {0}")]
    DuplicateLevel(String),
    /// Label text could not be parsed.
    #[error("invalid label syntax: {0:?}")]
    InvalidSyntax(String),
}

/// A classification level plus a compartment set.
///
/// Compartments are case-sensitive and held in a [`BTreeSet`], so two labels
/// built from differently ordered compartment lists compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityLabel {
    /// Classification level name.
    pub classification: String,
    /// Compartment tags.
    #[serde(default)]
    pub compartments: BTreeSet<String>,
}

impl SecurityLabel {
    /// Build a label from a level and any iterable of compartments.
    pub fn new<I, S>(classification: impl Into<String>, compartments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classification: classification.into(),
            compartments: compartments.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a label with no compartments.
    pub fn level(classification: impl Into<String>) -> Self {
        Self {
            classification: classification.into(),
            compartments: BTreeSet::new(),
        }
    }
}

/// Parses `level` or `level:COMP1,COMP2`.
impl FromStr for SecurityLabel {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (level, comps) = match trimmed.split_once(':') {
            Some((level, comps)) => (level.trim(), comps),
            None => (trimmed, ""),
        };
        if level.is_empty() {
            return Err(LabelError::InvalidSyntax(s.to_owned()));
        }
        let compartments = comps
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(Self {
            classification: level.to_owned(),
            compartments,
        })
    }
}

impl fmt::Display for SecurityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.classification)?;
        if !self.compartments.is_empty() {
            let joined: Vec<&str> = self.compartments.iter().map(String::as_str).collect();
            write!(f, ":{}", joined.join(","))?;
        }
        Ok(())
    }
}

/// The fixed, totally ordered list of classification levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lattice {
    levels: Vec<String>,
}

impl Lattice {
    /// Build a lattice from levels ordered lowest to highest.
    ///
    /// Level names are stored lower-cased; lookups are ASCII
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or contains duplicates.
    pub fn new<I, S>(levels: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for level in levels {
            let normalized = level.as_ref().trim().to_ascii_lowercase();
            if out.contains(&normalized) {
                return Err(LabelError::DuplicateLevel(normalized));
            }
            out.push(normalized);
        }
        if out.is_empty() {
            return Err(LabelError::EmptyLattice);
        }
        Ok(Self { levels: out })
    }

    /// Known levels, lowest first.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Rank of a level, or `None` if the level is not in the lattice.
    pub fn rank(&self, classification: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(classification.trim()))
    }

    /// Name of the lowest level.
    pub fn lowest(&self) -> &str {
        // The constructor rejects empty lattices.
        self.levels.first().map(String::as_str).unwrap_or_default()
    }

    /// The fail-closed subject label: lowest level, no compartments.
    pub fn least_privileged(&self) -> SecurityLabel {
        SecurityLabel::level(self.lowest())
    }

    /// Whether the label's classification is a member of this lattice.
    pub fn is_known(&self, label: &SecurityLabel) -> bool {
        self.rank(&label.classification).is_some()
    }

    /// Extract the effective label of an entity.
    ///
    /// Polyinstantiated entities carry their level directly; standard
    /// entities carry an optional nested label. Anything missing or outside
    /// the lattice yields [`Lattice::least_privileged`].
    pub fn label_of(&self, entity: &Entity) -> SecurityLabel {
        let candidate = match entity {
            Entity::Polyinstantiated {
                classification_level,
                compartments,
                ..
            } => Some(SecurityLabel {
                classification: classification_level.clone(),
                compartments: compartments.clone(),
            }),
            Entity::Standard { label, .. } => label.clone(),
        };
        match candidate {
            Some(label) if self.is_known(&label) => label,
            _ => self.least_privileged(),
        }
    }
}

impl Default for Lattice {
    fn default() -> Self {
        Self {
            levels: DEFAULT_LEVELS.iter().map(|l| (*l).to_owned()).collect(),
        }
    }
}

/// A record as seen by the kernel, classified once at ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// An ordinary record with an optional nested `security_label`.
    Standard {
        /// Nested label, if one was present and well-formed.
        label: Option<SecurityLabel>,
        /// The full record.
        data: Value,
    },
    /// A record carrying `classification_level` directly, with its private
    /// payload under `instance_data`.
    Polyinstantiated {
        /// Level taken from the record itself.
        classification_level: String,
        /// Compartments taken from the record itself.
        compartments: BTreeSet<String>,
        /// The private payload for this instance.
        instance_data: Value,
    },
}

impl Entity {
    /// Classify a JSON record. Never fails; malformed labels become `None`.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::Standard {
                label: None,
                data: value,
            };
        };

        if let Some(Value::String(level)) = map.get(POLYINSTANTIATED_FIELD).cloned() {
            let compartments = map
                .get("compartments")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            let instance_data = match map.remove(INSTANCE_DATA_FIELD) {
                Some(data) => data,
                None => {
                    map.remove(POLYINSTANTIATED_FIELD);
                    map.remove("compartments");
                    Value::Object(map)
                }
            };
            return Self::Polyinstantiated {
                classification_level: level,
                compartments,
                instance_data,
            };
        }

        let label = map
            .get("security_label")
            .or_else(|| map.get("label"))
            .and_then(|raw| serde_json::from_value::<SecurityLabel>(raw.clone()).ok());
        Self::Standard {
            label,
            data: Value::Object(map),
        }
    }

    /// Whether this entity was ingested as polyinstantiated.
    pub fn is_polyinstantiated(&self) -> bool {
        matches!(self, Self::Polyinstantiated { .. })
    }

    /// The payload that gets encrypted for this entity.
    pub fn payload(&self) -> &Value {
        match self {
            Self::Standard { data, .. } => data,
            Self::Polyinstantiated { instance_data, .. } => instance_data,
        }
    }
}
