// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-wide counters, shared by the event loop and every worker.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected_conns: AtomicUsize,
    pub idle_evictions: AtomicUsize,
    pub handoff_violations: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected_conns: AtomicUsize::new(0),
            idle_evictions: AtomicUsize::new(0),
            handoff_violations: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evicted(&self) {
        self.idle_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handoff_violation(&self) {
        self.handoff_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected_conns: self.rejected_conns.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            handoff_violations: self.handoff_violations.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_conns: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub rejected_conns: usize,
    pub idle_evictions: usize,
    pub handoff_violations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_connection_lifecycle() {
        let m = ServerMetrics::new();
        m.inc_conn();
        m.inc_conn();
        m.dec_conn();
        m.inc_req();
        m.add_bytes(512);
        let snap = m.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.req_count, 1);
        assert_eq!(snap.bytes_sent, 512);
        assert_eq!(snap.handoff_violations, 0);
    }

    #[test]
    fn metrics_are_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<ServerMetrics>(), 64);
    }
}
