//! Fire-and-forget audit emission and the audit-writer actor.
//!
//! Security checks hand events to an [`AuditSink`] and move on. The
//! [`ChannelSink`] pushes them onto a bounded [`mpsc`] channel with
//! `try_send`, so a slow or stalled writer can only cost dropped events,
//! never a blocked decision. [`run_audit_writer`] drains the channel into
//! the [`AuditChain`] and flushes it to durable storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use super::chain::AuditChain;
use super::event::AuditEvent;

/// Maximum events committed between two flushes.
const WRITER_BATCH: usize = 256;

/// Receives audit events without blocking the caller.
pub trait AuditSink: Send + Sync {
    /// Hand off an event. Must not block and must not fail the caller.
    fn emit(&self, event: AuditEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, event: AuditEvent) {
        trace!(event_type = %event.event_type, "audit event discarded");
    }
}

/// Sink backed by a bounded channel to the audit writer.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver the writer task consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelSink {
    fn emit(&self, event: AuditEvent) {
        let event_type = event.event_type;
        if let Err(err) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "channel full",
                mpsc::error::TrySendError::Closed(_) => "channel closed",
            };
            if event_type.is_critical() {
                warn!(event_type = %event_type, reason, "critical audit event dropped");
            } else {
                debug!(event_type = %event_type, reason, "audit event dropped");
            }
        }
    }
}

/// Run the audit-writer loop.
///
/// Commits each received event to `chain`, flushing after every batch and
/// every `flush_interval` so that envelopes returned to the buffer by a
/// failed flush are retried. On shutdown the channel is drained and flushed
/// once more before exiting.
pub async fn run_audit_writer(
    chain: Arc<AuditChain>,
    mut rx: mpsc::Receiver<AuditEvent>,
    flush_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(first) = received else { break };
                commit(&chain, first).await;
                let mut batch: usize = 1;
                while batch < WRITER_BATCH {
                    match rx.try_recv() {
                        Ok(event) => {
                            commit(&chain, event).await;
                            batch = batch.saturating_add(1);
                        }
                        Err(_) => break,
                    }
                }
                flush(&chain).await;
            }
            _ = ticker.tick() => {
                if chain.buffered() > 0 {
                    flush(&chain).await;
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    while let Ok(event) = rx.try_recv() {
        commit(&chain, event).await;
    }
    flush(&chain).await;
    trace!("audit writer stopped");
}

async fn commit(chain: &AuditChain, event: AuditEvent) {
    let event_type = event.event_type;
    if let Err(err) = chain.log_event(event).await {
        error!(event_type = %event_type, error = %err, "audit commit failed");
    }
}

async fn flush(chain: &AuditChain) {
    if let Err(err) = chain.flush().await {
        warn!(error = %err, buffered = chain.buffered(), "audit flush failed, will retry");
    }
}
