//! Outbound notification surface.
//!
//! The engine reports state changes through this sink so an external
//! dashboard or push channel can mirror them. Every callback is
//! fire-and-forget: implementations must return quickly and must never
//! block or fail into the engine.

use chrono::{DateTime, Utc};

pub trait NotificationSink: Send + Sync {
    /// The earliest pending occurrence time changed; `None` means nothing
    /// is scheduled.
    fn on_next_occurrence_changed(&self, _next: Option<DateTime<Utc>>) {}

    /// The host transitioned between Running and Stopped.
    fn on_host_status_changed(&self, _running: bool) {}

    /// An unexpected engine error was swallowed and retried.
    fn on_host_exception(&self, _message: &str) {}

    /// The pool's live worker count changed.
    fn on_active_worker_count_changed(&self, _count: usize) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone)]
pub struct NoopSink;

impl NotificationSink for NoopSink {}

/// Sink that mirrors engine events to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_next_occurrence_changed(&self, next: Option<DateTime<Utc>>) {
        tracing::debug!(next = ?next, "Next occurrence changed");
    }

    fn on_host_status_changed(&self, running: bool) {
        tracing::info!(running, "Host status changed");
    }

    fn on_host_exception(&self, message: &str) {
        tracing::error!(error = %message, "Host exception");
    }

    fn on_active_worker_count_changed(&self, count: usize) {
        tracing::debug!(count, "Active worker count changed");
    }
}
