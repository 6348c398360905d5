//! Pipeline options.

use std::time::Duration;

/// Request/response interleaving discipline per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronization {
    /// One request at a time; wait for each response.
    Sync,
    /// HTTP pipelining with up to this many in-flight requests
    /// (clamped to 1..=8).
    Pipelined(u8),
}

impl Default for Synchronization {
    fn default() -> Self {
        Synchronization::Pipelined(5)
    }
}

impl Synchronization {
    pub(crate) fn depth(&self) -> usize {
        match self {
            Synchronization::Sync => 1,
            Synchronization::Pipelined(n) => (*n).clamp(1, 8) as usize,
        }
    }
}

/// Tunables of a [`crate::Pipeline`], with the engine's defaults.
#[derive(Debug, Clone)]
pub struct Options {
    pub synchronization: Synchronization,
    /// Fresh connections one origin queue may burn before its pending
    /// calls fail.
    pub max_connection_failures: u32,
    /// Times a single call may be re-sent after connection errors.
    pub max_message_errors: u32,
    /// Mark every request `Connection: close` and never reuse connections.
    pub inhibit_persistency: bool,
    /// Inactivity bound between any two I/O events of a connection.
    pub connection_timeout: Duration,
    /// Connections per origin queue.
    pub parallel_connections: usize,
    pub max_redirections: u32,
    /// Wait for `100 Continue` before sending a body with `Expect`.
    pub handshake_timeout: Duration,
    pub user_agent: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            synchronization: Synchronization::default(),
            max_connection_failures: 2,
            max_message_errors: 2,
            inhibit_persistency: false,
            connection_timeout: Duration::from_secs(300),
            parallel_connections: 2,
            max_redirections: 5,
            handshake_timeout: Duration::from_secs(1),
            user_agent: concat!("pipenet/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
