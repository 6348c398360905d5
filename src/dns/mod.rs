//! Name resolution seam.
//!
//! The [`Resolve`] trait is the pluggable resolver interface: it must not
//! block the caller, and addresses are returned with port 0 for the engine
//! to fill in. [`GaiResolver`] is the default `getaddrinfo`-in-thread-pool
//! implementation; [`StaticResolver`] overrides hostnames for tests and
//! local development.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;

use crate::base::NetError;

/// A hostname to resolve.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Iterator over resolved addresses (port 0).
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Future returned by a resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Asynchronous name resolution. Implementations must not block the
/// calling task.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// System resolver: `getaddrinfo` on the blocking thread pool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let lookup = host.clone();
            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %lookup, "resolving via getaddrinfo");
                (lookup.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            let addrs = result
                .map_err(|e| {
                    tracing::warn!(error = %e, "resolver task failed");
                    NetError::NameResolution(host.clone())
                })?
                .map_err(|e| {
                    tracing::debug!(host = %host, error = %e, "name resolution failed");
                    NetError::NameResolution(host.clone())
                })?;

            if addrs.is_empty() {
                return Err(NetError::NameResolution(host));
            }
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Fixed hostname-to-address table with an optional fallback resolver.
pub struct StaticResolver {
    table: HashMap<String, Vec<SocketAddr>>,
    fallback: Option<Arc<dyn Resolve>>,
}

impl StaticResolver {
    pub fn new(table: HashMap<String, Vec<SocketAddr>>) -> Self {
        Self { table, fallback: None }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Resolve>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.table.get(name.as_str()) {
            let addrs: Addrs = Box::new(addrs.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        match &self.fallback {
            Some(inner) => inner.resolve(name),
            None => {
                let host = name.as_str().to_string();
                Box::pin(std::future::ready(Err(NetError::NameResolution(host))))
            }
        }
    }
}

impl fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResolver")
            .field("entries", &self.table.len())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
