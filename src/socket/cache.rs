//! Idle connection cache.
//!
//! Parked connections keep their negotiated protocol version and
//! pipelining permission, so a reused connection pipelines from the first
//! request. The cache may be shared between pipelines; the map provides
//! the required mutual exclusion.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use http::Version;

use crate::socket::BoxTransport;

/// Cache key: where the connection goes and over which transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host: String,
    pub port: u16,
    pub kind: &'static str,
}

impl CacheKey {
    pub fn new(host: impl Into<String>, port: u16, kind: &'static str) -> Self {
        Self { host: host.into().to_lowercase(), port, kind }
    }
}

/// An idle connection with its negotiated HTTP state.
pub struct ParkedConnection {
    pub(crate) transport: BoxTransport,
    pub(crate) key: CacheKey,
    pub(crate) version: Option<Version>,
    pub(crate) pipelining_allowed: bool,
    /// The transport's lifecycle has already been counted.
    pub(crate) counted: bool,
}

impl fmt::Debug for ParkedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkedConnection")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("pipelining_allowed", &self.pipelining_allowed)
            .finish()
    }
}

/// Eviction behavior of [`ConnectionCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Released connections are kept only while a pipeline is attached to
    /// the cache; otherwise they are closed immediately.
    Restrictive,
    /// Released connections are retained until [`ConnectionCache::close_all`].
    Aggressive,
}

/// Keyed pool of idle connections.
pub struct ConnectionCache {
    mode: CacheMode,
    idle: DashMap<CacheKey, Vec<ParkedConnection>>,
    attached: AtomicUsize,
}

impl ConnectionCache {
    pub fn new(mode: CacheMode) -> Self {
        Self { mode, idle: DashMap::new(), attached: AtomicUsize::new(0) }
    }

    pub fn restrictive() -> Self {
        Self::new(CacheMode::Restrictive)
    }

    pub fn aggressive() -> Self {
        Self::new(CacheMode::Aggressive)
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub(crate) fn attach(&self) {
        self.attached.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn detach(&self) {
        let before = self.attached.fetch_sub(1, Ordering::Relaxed);
        if before == 1 && self.mode == CacheMode::Restrictive {
            self.close_all();
        }
    }

    /// Takes an idle connection for the given target, if one is parked.
    pub fn acquire(&self, key: &CacheKey) -> Option<ParkedConnection> {
        let mut entry = self.idle.get_mut(key)?;
        let parked = entry.pop();
        if parked.is_some() {
            tracing::debug!(host = %key.host, port = key.port, "reusing idle connection");
        }
        parked
    }

    /// Parks a connection for reuse. In restrictive mode with no attached
    /// pipeline the connection is closed instead.
    pub fn release(&self, parked: ParkedConnection) {
        if self.mode == CacheMode::Restrictive && self.attached.load(Ordering::Relaxed) == 0 {
            // Dropping the transport closes it.
            return;
        }
        self.idle.entry(parked.key.clone()).or_default().push(parked);
    }

    /// Closes every idle connection.
    pub fn close_all(&self) {
        self.idle.clear();
    }

    /// Number of parked connections.
    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|e| e.len()).sum()
    }
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("mode", &self.mode)
            .field("idle", &self.idle_count())
            .field("attached", &self.attached.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked(key: CacheKey) -> ParkedConnection {
        ParkedConnection {
            transport: Box::new(tokio::io::duplex(16).0),
            key,
            version: Some(Version::HTTP_11),
            pipelining_allowed: true,
            counted: true,
        }
    }

    #[test]
    fn test_acquire_empty() {
        let cache = ConnectionCache::aggressive();
        assert!(cache.acquire(&CacheKey::new("h", 80, "tcp")).is_none());
    }

    #[test]
    fn test_release_and_acquire_aggressive() {
        let cache = ConnectionCache::aggressive();
        let key = CacheKey::new("h", 80, "tcp");
        cache.release(parked(key.clone()));
        assert_eq!(cache.idle_count(), 1);

        let got = cache.acquire(&key).unwrap();
        assert!(got.pipelining_allowed);
        assert_eq!(cache.idle_count(), 0);
    }

    #[test]
    fn test_restrictive_drops_when_detached() {
        let cache = ConnectionCache::restrictive();
        let key = CacheKey::new("h", 80, "tcp");
        cache.release(parked(key.clone()));
        assert_eq!(cache.idle_count(), 0);

        cache.attach();
        cache.release(parked(key.clone()));
        assert_eq!(cache.idle_count(), 1);

        // Last pipeline detaching empties the cache.
        cache.detach();
        assert_eq!(cache.idle_count(), 0);
    }

    #[test]
    fn test_key_host_case_insensitive() {
        let a = CacheKey::new("Host.Example", 80, "tcp");
        let b = CacheKey::new("host.example", 80, "tcp");
        assert_eq!(a, b);
    }

    #[test]
    fn test_close_all() {
        let cache = ConnectionCache::aggressive();
        cache.release(parked(CacheKey::new("a", 80, "tcp")));
        cache.release(parked(CacheKey::new("b", 80, "tcp")));
        assert_eq!(cache.idle_count(), 2);
        cache.close_all();
        assert_eq!(cache.idle_count(), 0);
    }
}
