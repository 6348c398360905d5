use std::io;
use thiserror::Error;

/// Error taxonomy of the pipeline engine.
///
/// Transport-level conditions and engine-level failures share one enum so
/// that a [`crate::http::CondensedStatus::ProtocolError`] can carry any of
/// them to the caller unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Operation on a torn-down resource.
    #[error("resource is closed")]
    Closed,
    /// Unparseable server output.
    #[error("bad message: {0}")]
    BadMessage(String),
    /// Call aborted because an earlier call on its connection failed and
    /// resending is not permitted, or because the pipeline was reset.
    #[error("no reply")]
    NoReply,
    /// Redirect depth exceeded the configured maximum.
    #[error("too many redirections")]
    TooManyRedirections,
    /// Name resolution failed for the given host.
    #[error("name resolution failed for {0}")]
    NameResolution(String),
    /// A post-redirect URI could not be parsed.
    #[error("URL syntax error: {0}")]
    UrlSyntax(String),
    /// Non-blocking operation has no data or space.
    #[error("operation would block")]
    WouldBlock,
    /// Signal arrived mid-I/O; retrying is valid.
    #[error("interrupted")]
    Interrupted,
    /// Write after EOF on a pipe.
    #[error("broken pipe")]
    BrokenPipe,
    #[error("connection timed out")]
    TimedOut,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    /// The server closed the connection.
    #[error("server closed connection")]
    ServerEof,
    /// Any other I/O failure, identified by kind.
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
}

impl NetError {
    /// Transient conditions that never escape the connection driver:
    /// the caller retries the operation instead of failing the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock | NetError::Interrupted)
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => NetError::WouldBlock,
            io::ErrorKind::Interrupted => NetError::Interrupted,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                NetError::ConnectionReset
            }
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::UnexpectedEof => NetError::ServerEof,
            io::ErrorKind::BrokenPipe => NetError::BrokenPipe,
            kind => NetError::Io(kind),
        }
    }
}
