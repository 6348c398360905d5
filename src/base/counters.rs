//! Connection lifecycle counters.
//!
//! Every transport a pipeline opens is counted once as `new`, and exactly
//! once at its end of life as `successful` or `failed`, so at quiescence
//! `new == failed + successful`. The cause counters (`timed_out`, `crashed`,
//! `server_eof`) are diagnostic and may accompany either outcome.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    new_connections: AtomicU64,
    timed_out_connections: AtomicU64,
    crashed_connections: AtomicU64,
    server_eof_connections: AtomicU64,
    successful_connections: AtomicU64,
    failed_connections: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub new_connections: u64,
    pub timed_out_connections: u64,
    pub crashed_connections: u64,
    pub server_eof_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr_new(&self) {
        self.new_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_timed_out(&self) {
        self.timed_out_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_crashed(&self) {
        self.crashed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_server_eof(&self) {
        self.server_eof_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_successful(&self) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            new_connections: self.new_connections.load(Ordering::Relaxed),
            timed_out_connections: self.timed_out_connections.load(Ordering::Relaxed),
            crashed_connections: self.crashed_connections.load(Ordering::Relaxed),
            server_eof_connections: self.server_eof_connections.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.new_connections.store(0, Ordering::Relaxed);
        self.timed_out_connections.store(0, Ordering::Relaxed);
        self.crashed_connections.store(0, Ordering::Relaxed);
        self.server_eof_connections.store(0, Ordering::Relaxed);
        self.successful_connections.store(0, Ordering::Relaxed);
        self.failed_connections.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_and_snapshot() {
        let c = Counters::new();
        c.incr_new();
        c.incr_new();
        c.incr_successful();
        c.incr_failed();

        let s = c.snapshot();
        assert_eq!(s.new_connections, 2);
        assert_eq!(s.successful_connections, 1);
        assert_eq!(s.failed_connections, 1);
        assert_eq!(s.new_connections, s.successful_connections + s.failed_connections);
    }

    #[test]
    fn test_reset() {
        let c = Counters::new();
        c.incr_new();
        c.incr_crashed();
        c.reset();
        assert_eq!(c.snapshot(), CounterSnapshot::default());
    }
}
