// fault-core/src/proxy/state.rs
// Process-wide injection record and proxy counters

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Delay applied to every relayed command while active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Injection {
    pub delay: Duration,
    pub active: bool,
}

impl Injection {
    /// Delay to apply right now, if any.
    pub fn effective_delay(&self) -> Option<Duration> {
        (self.active && !self.delay.is_zero()).then_some(self.delay)
    }
}

/// Shared by every connection task. Writers replace the whole record, so readers
/// never observe a delay from one activation paired with the flag of another.
#[derive(Debug, Default)]
pub struct InjectionState {
    inner: RwLock<Injection>,
}

impl InjectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, delay: Duration) {
        *self.inner.write() = Injection {
            delay,
            active: true,
        };
    }

    pub fn deactivate(&self) {
        *self.inner.write() = Injection::default();
    }

    pub fn snapshot(&self) -> Injection {
        *self.inner.read()
    }
}

#[derive(Debug)]
pub struct ProxyMetrics {
    started_at: DateTime<Utc>,
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    commands_relayed: AtomicU64,
    commands_delayed: AtomicU64,
    control_commands: AtomicU64,
    upstream_errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyMetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub commands_relayed: u64,
    pub commands_delayed: u64,
    pub control_commands: u64,
    pub upstream_errors: u64,
}

/// Decrements the active connection gauge when the connection task ends.
pub struct ConnectionGuard<'a> {
    metrics: &'a ProxyMetrics,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            commands_relayed: AtomicU64::new(0),
            commands_delayed: AtomicU64::new(0),
            control_commands: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
        }
    }
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) -> ConnectionGuard<'_> {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { metrics: self }
    }

    pub fn record_relayed(&self) {
        self.commands_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delayed(&self) {
        self.commands_delayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control(&self) {
        self.control_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyMetricsSnapshot {
        ProxyMetricsSnapshot {
            started_at: self.started_at,
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            commands_relayed: self.commands_relayed.load(Ordering::Relaxed),
            commands_delayed: self.commands_delayed.load(Ordering::Relaxed),
            control_commands: self.control_commands.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}
