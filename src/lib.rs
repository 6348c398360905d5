//! # pipenet
//!
//! An asynchronous HTTP/1.1 client pipeline engine.
//!
//! `pipenet` accepts a dynamic queue of HTTP calls and multiplexes them
//! over persistent per-origin connections: requests are pipelined up to a
//! configurable depth, responses are matched in FIFO order, interrupted
//! idempotent calls are retransmitted on fresh connections, and 3xx/401/407
//! responses are handled inside the engine.
//!
//! ## Features
//!
//! - **Pipelining**: up to 8 in-flight requests per connection, enabled
//!   after the first HTTP/1.1 response
//! - **Selective retransmission**: idempotence-aware resend with bounded
//!   failure budgets per call and per origin
//! - **Authentication**: Basic and Digest (RFC 2617 `auth` qop, RFC 2069,
//!   MD5/MD5-sess), challenge-response and auth-in-advance
//! - **Redirects**: 301/302/303/307 with loop protection
//! - **Connection cache**: idle connections keep their negotiated protocol
//!   state and may be shared across pipelines
//! - **Proxy support**: `http_proxy`/`no_proxy` environment conventions
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use pipenet::{Call, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pipenet::NetError> {
//!     let mut pipeline = Pipeline::new();
//!     pipeline.add_with_callback(Call::get("http://example.com/")?, |call| {
//!         println!("{:?}", call.status());
//!     });
//!     pipeline.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`] - The orchestrator: queues, routing, retry and redirect policy
//! - [`http`] - Call model, bodies, and the HTTP/1.1 wire codec
//! - [`auth`] - Key handling and the Basic/Digest schemes
//! - [`socket`] - Connection driver, cache, transports, proxy rules
//! - [`dns`] - Pluggable name resolution
//! - [`pipe`] - Bounded typed pipe for worker signalling
//! - [`base`] - Error taxonomy and transfer counters

pub mod auth;
pub mod base;
pub mod dns;
pub mod http;
pub mod pipe;
pub mod pipeline;
pub mod socket;

pub use base::{CounterSnapshot, NetError};
pub use http::{
    Call, CondensedStatus, MethodDescriptor, ReconnectMode, RedirectMode, RequestBody,
    ResponseStore,
};
pub use pipeline::{Options, Pipeline, PipelineHandle, Synchronization};
pub use socket::{CacheMode, ConnectionCache, ProxyConfig};
