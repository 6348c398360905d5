//! Transports, connection driver, cache, and proxy configuration.
//!
//! - [`Connector`]: the transport seam; the crate ships plain TCP, TLS and
//!   tunnel transports plug in here
//! - [`conn`]: the per-connection state machine driver
//! - [`cache`]: idle connection reuse across pipelines
//! - [`proxy`] / [`matcher`]: `http_proxy` configuration and `no_proxy`
//!   bypass rules

pub mod cache;
pub(crate) mod conn;
pub mod matcher;
pub mod proxy;
pub(crate) mod queue;

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::base::NetError;

pub use cache::{CacheMode, ConnectionCache};
pub use matcher::NoProxyMatcher;
pub use proxy::ProxyConfig;

/// A connected byte stream.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

pub type BoxTransport = Box<dyn TransportStream>;

/// Opens transports to resolved addresses. Implementations must not block;
/// TLS or proxy-tunnel providers implement this to wrap the engine's
/// connections.
pub trait Connector: Send + Sync {
    /// Transport kind tag, part of the connection cache key.
    fn kind(&self) -> &'static str;

    /// Opens a transport to `addr`. `host` is the logical server name, for
    /// connectors that need it (e.g. SNI).
    fn connect(&self, addr: SocketAddr, host: &str)
        -> BoxFuture<'static, Result<BoxTransport, NetError>>;
}

/// Plain TCP transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn connect(
        &self,
        addr: SocketAddr,
        _host: &str,
    ) -> BoxFuture<'static, Result<BoxTransport, NetError>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .map_err(NetError::from)?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}
