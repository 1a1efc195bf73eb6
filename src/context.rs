//! The authenticated subject's security context.
//!
//! A [`ContextHandle`] holds at most one [`SecurityContext`] per session.
//! Contexts are replaced wholesale and handed out as immutable snapshots;
//! an expired or missing context reads as the least-privileged label.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::label::{Lattice, SecurityLabel};

/// An authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Authenticated user identifier.
    pub user_id: String,
    /// The subject's clearance.
    pub label: SecurityLabel,
    /// Roles in assignment order.
    pub roles: Vec<String>,
    /// Owning tenant.
    pub tenant_id: String,
    /// Instant after which the context no longer applies.
    pub expires_at: DateTime<Utc>,
}

impl SecurityContext {
    /// Whether the context has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Session-scoped holder for the active context.
#[derive(Debug)]
pub struct ContextHandle {
    lattice: Arc<Lattice>,
    active: RwLock<Option<Arc<SecurityContext>>>,
}

impl ContextHandle {
    /// Create an empty handle.
    pub fn new(lattice: Arc<Lattice>) -> Self {
        Self {
            lattice,
            active: RwLock::new(None),
        }
    }

    /// Replace the active context for `user_id` with a fresh one expiring
    /// after `ttl`. Roles are empty and the tenant is `"default"`.
    pub fn set_context(&self, user_id: impl Into<String>, label: SecurityLabel, ttl: Duration) {
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set_full_context(SecurityContext {
            user_id: user_id.into(),
            label,
            roles: Vec::new(),
            tenant_id: "default".to_owned(),
            expires_at,
        });
    }

    /// Replace the active context atomically.
    pub fn set_full_context(&self, context: SecurityContext) {
        debug!(
            user_id = %context.user_id,
            label = %context.label,
            expires_at = %context.expires_at,
            "security context replaced"
        );
        let snapshot = Arc::new(context);
        match self.active.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }

    /// Drop the active context (logout).
    pub fn clear(&self) {
        match self.active.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// The active, unexpired context snapshot.
    pub fn current(&self) -> Option<Arc<SecurityContext>> {
        self.current_at(Utc::now())
    }

    /// The context snapshot as of `now`. An expired context is dropped.
    pub fn current_at(&self, now: DateTime<Utc>) -> Option<Arc<SecurityContext>> {
        let snapshot = match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return None,
        }?;
        if !snapshot.is_expired_at(now) {
            return Some(snapshot);
        }
        debug!(user_id = %snapshot.user_id, "security context expired");
        if let Ok(mut guard) = self.active.write() {
            // Only clear if nobody replaced it in the meantime.
            if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, &snapshot)) {
                *guard = None;
            }
        }
        None
    }

    /// The subject label, or the least-privileged label when no valid
    /// context is active.
    pub fn subject(&self) -> SecurityLabel {
        self.current()
            .map(|ctx| ctx.label.clone())
            .unwrap_or_else(|| self.lattice.least_privileged())
    }
}
