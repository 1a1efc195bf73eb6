//! Canonical crypto-domain strings.
//!
//! A domain names the key that protects data of a given label. Labels that
//! are equal as sets always map to the same domain, whatever order their
//! compartments were supplied in.

use std::sync::Mutex;

use crate::cache::{CacheCounters, CacheStats, FifoCache};
use crate::label::SecurityLabel;

/// Separator between the level and compartment parts.
pub const DOMAIN_SEPARATOR: &str = "::";

/// Compartment token used when a label has no compartments.
pub const NO_COMPARTMENTS: &str = "none";

const ESCAPED_NO_COMPARTMENTS: &str = "%6Eone";

/// Derive the canonical domain string for a label.
///
/// Lower-cases the level and each compartment, sorts and de-duplicates the
/// compartments and joins them with `,`. `%`, `,` and `:` inside names are
/// percent-escaped, and a lone compartment spelled like the empty-set token
/// is escaped too, so distinct compartment sets never share a domain.
pub fn domain_of(label: &SecurityLabel) -> String {
    let level = escape(&label.classification.trim().to_ascii_lowercase());
    let mut compartments: Vec<String> = label
        .compartments
        .iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    compartments.sort();
    compartments.dedup();

    let joined = if compartments.is_empty() {
        NO_COMPARTMENTS.to_owned()
    } else {
        let escaped: Vec<String> = compartments.iter().map(|c| escape(c)).collect();
        let joined = escaped.join(",");
        if joined == NO_COMPARTMENTS {
            // Escaped 'n'; `escape` never emits it.
            ESCAPED_NO_COMPARTMENTS.to_owned()
        } else {
            joined
        }
    };
    format!("{level}{DOMAIN_SEPARATOR}{joined}")
}

fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            ',' => out.push_str("%2C"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    out
}

/// Memoising wrapper around [`domain_of`] with FIFO eviction.
#[derive(Debug)]
pub struct DomainCache {
    inner: Mutex<FifoCache<SecurityLabel, String>>,
    counters: CacheCounters,
}

impl DomainCache {
    /// Create a cache holding up to `capacity` domains.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FifoCache::new(capacity)),
            counters: CacheCounters::default(),
        }
    }

    /// Domain for `label`, computed at most once while cached.
    pub fn domain_of(&self, label: &SecurityLabel) -> String {
        if let Some(hit) = self
            .inner
            .lock()
            .ok()
            .and_then(|cache| cache.get(label).cloned())
        {
            self.counters.hit();
            return hit;
        }
        self.counters.miss();
        let domain = domain_of(label);
        if let Ok(mut cache) = self.inner.lock() {
            cache.insert(label.clone(), domain.clone());
        }
        domain
    }

    /// Cache statistics.
    pub fn stats(&self) -> CacheStats {
        let len = self.inner.lock().map(|c| c.len()).unwrap_or(0);
        self.counters.snapshot(len)
    }
}
