//! Logging setup and access counters

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber on stderr.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this twice is
/// harmless; the second install is ignored.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Counters for sessions handed out by [`crate::access::ProtocolApi`]
#[derive(Debug, Default)]
pub struct AccessMetrics {
    sessions_opened: AtomicU64,
    sessions_proxied: AtomicU64,
    sessions_failed: AtomicU64,
    bytes_delivered: AtomicU64,
}

impl AccessMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "sessions_opened", "Metric incremented");
    }

    pub fn session_proxied(&self) {
        self.sessions_proxied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "sessions_proxied", "Metric incremented");
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "sessions_failed", "Metric incremented");
    }

    pub fn bytes_delivered(&self, count: usize) {
        self.bytes_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_proxied: self.sessions_proxied.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_proxied: u64,
    pub sessions_failed: u64,
    pub bytes_delivered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = AccessMetrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_proxied();
        metrics.session_failed();
        metrics.bytes_delivered(512);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_opened, 2);
        assert_eq!(snapshot.sessions_proxied, 1);
        assert_eq!(snapshot.sessions_failed, 1);
        assert_eq!(snapshot.bytes_delivered, 512);
    }
}
