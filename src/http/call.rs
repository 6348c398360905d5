//! The HTTP call: one request/response transaction unit.
//!
//! A `Call` carries the request (method descriptor, URL, base header,
//! body), the response (head plus a per-call storage target), the condensed
//! outcome, and the per-call recovery policies. The engine never mutates
//! the base header; everything it adds goes into a per-transmission
//! effective header built in [`Call::prepare_transmission`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio::io::AsyncRead;
use url::{Position, Url};

use crate::auth::SharedSession;
use crate::base::NetError;
use crate::http::body::{RequestBody, ResponseStore};
use crate::http::codec::{self, ResponseHead};

/// Coarse classification of a call's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondensedStatus {
    /// Not served yet; response accessors are unavailable.
    Unserved,
    /// The transfer failed below the HTTP layer.
    ProtocolError(NetError),
    /// 2xx.
    Successful,
    /// 3xx delivered to the caller (redirect not followed).
    Redirection,
    /// 4xx.
    ClientError,
    /// 5xx.
    ServerError,
}

impl CondensedStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CondensedStatus::Unserved)
    }

    pub(crate) fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            s if s < 200 => CondensedStatus::Successful,
            200..=299 => CondensedStatus::Successful,
            300..=399 => CondensedStatus::Redirection,
            400..=499 => CondensedStatus::ClientError,
            _ => CondensedStatus::ServerError,
        }
    }
}

/// What to do with a call whose connection failed before the response.
#[derive(Clone, Default)]
pub enum ReconnectMode {
    /// Always re-queue on a fresh connection.
    SendAgain,
    /// Never resend; the call fails.
    RequestFails,
    /// Ask the given predicate.
    Inquire(Arc<dyn Fn(&Call) -> bool + Send + Sync>),
    /// Resend only idempotent methods (GET/HEAD).
    #[default]
    SendAgainIfIdem,
}

impl fmt::Debug for ReconnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectMode::SendAgain => f.write_str("SendAgain"),
            ReconnectMode::RequestFails => f.write_str("RequestFails"),
            ReconnectMode::Inquire(_) => f.write_str("Inquire(..)"),
            ReconnectMode::SendAgainIfIdem => f.write_str("SendAgainIfIdem"),
        }
    }
}

/// Whether the engine follows 3xx responses for this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    Never,
    #[default]
    IfIdempotent,
    Always,
}

/// Describes a request method's transfer properties.
///
/// One record replaces a class-per-method hierarchy: the engine consults it
/// for idempotence, body expectations, and the request-target form, and
/// runs `fixup` against the effective header just before transmission.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: Cow<'static, str>,
    /// Request-target to use when the URL path is empty ("/" or "*").
    pub empty_path_replacement: &'static str,
    pub idempotent: bool,
    pub has_request_body: bool,
    pub accepts_response_body: bool,
    pub fixup: Option<Arc<dyn Fn(&mut HeaderMap) + Send + Sync>>,
}

impl MethodDescriptor {
    fn simple(name: &'static str, idempotent: bool, has_request_body: bool) -> Self {
        Self {
            name: Cow::Borrowed(name),
            empty_path_replacement: "/",
            idempotent,
            has_request_body,
            accepts_response_body: true,
            fixup: None,
        }
    }

    pub fn get() -> Self {
        Self::simple("GET", true, false)
    }

    pub fn head() -> Self {
        let mut d = Self::simple("HEAD", true, false);
        d.accepts_response_body = false;
        d
    }

    pub fn post() -> Self {
        Self::simple("POST", false, true)
    }

    pub fn put() -> Self {
        Self::simple("PUT", false, true)
    }

    pub fn delete() -> Self {
        Self::simple("DELETE", false, false)
    }

    pub fn options() -> Self {
        let mut d = Self::simple("OPTIONS", true, false);
        d.empty_path_replacement = "*";
        d
    }

    pub fn trace() -> Self {
        Self::simple("TRACE", true, false)
    }

    /// Descriptor for an extension method.
    pub fn custom(name: impl Into<String>, idempotent: bool, has_request_body: bool) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            empty_path_replacement: "/",
            idempotent,
            has_request_body,
            accepts_response_body: true,
            fixup: None,
        }
    }

    /// Installs a closure run against the effective header before each
    /// transmission.
    pub fn with_fixup(mut self, f: impl Fn(&mut HeaderMap) + Send + Sync + 'static) -> Self {
        self.fixup = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("idempotent", &self.idempotent)
            .field("has_request_body", &self.has_request_body)
            .finish_non_exhaustive()
    }
}

pub(crate) type CallCallback = Box<dyn FnOnce(&Call) + Send>;

/// Auth session attached to a call, with the number of challenge rounds it
/// has answered.
pub(crate) struct AuthAttachment {
    pub session: SharedSession,
    pub rounds: u32,
}

/// One HTTP request/response transaction.
pub struct Call {
    pub(crate) method: MethodDescriptor,
    pub(crate) url: Url,
    base_headers: HeaderMap,
    pub(crate) request_body: RequestBody,
    pub(crate) store: ResponseStore,
    reconnect_mode: ReconnectMode,
    redirect_mode: RedirectMode,
    proxy_enabled: bool,
    status: CondensedStatus,
    pub(crate) response: Option<ResponseHead>,
    pub(crate) redirect_count: u32,
    /// Times this call has been put on the wire.
    pub(crate) transmissions: u32,
    /// Times this call was re-sent after a connection error. Independent
    /// of `transmissions`: redirect hops and auth rounds transmit too but
    /// do not consume the retry budget.
    pub(crate) resends: u32,
    pub(crate) auth: Option<AuthAttachment>,
    pub(crate) via_proxy: bool,
    /// Body of a response that may be handled internally (redirect, 401);
    /// copied into the store only if that response turns out to be final.
    pub(crate) interim_body: Option<Bytes>,
    /// A stream body was moved to the wire; the call can never be resent.
    pub(crate) stream_body_taken: bool,
    pub(crate) on_done: Option<CallCallback>,
}

impl Call {
    pub fn new(method: MethodDescriptor, url: Url) -> Self {
        Self {
            method,
            url,
            base_headers: HeaderMap::new(),
            request_body: RequestBody::Empty,
            store: ResponseStore::memory(),
            reconnect_mode: ReconnectMode::default(),
            redirect_mode: RedirectMode::default(),
            proxy_enabled: true,
            status: CondensedStatus::Unserved,
            response: None,
            redirect_count: 0,
            transmissions: 0,
            resends: 0,
            auth: None,
            via_proxy: false,
            interim_body: None,
            stream_body_taken: false,
            on_done: None,
        }
    }

    fn parse_url(url: &str) -> Result<Url, NetError> {
        Url::parse(url).map_err(|_| NetError::UrlSyntax(url.to_string()))
    }

    pub fn get(url: &str) -> Result<Self, NetError> {
        Ok(Self::new(MethodDescriptor::get(), Self::parse_url(url)?))
    }

    pub fn head(url: &str) -> Result<Self, NetError> {
        Ok(Self::new(MethodDescriptor::head(), Self::parse_url(url)?))
    }

    pub fn post(url: &str) -> Result<Self, NetError> {
        Ok(Self::new(MethodDescriptor::post(), Self::parse_url(url)?))
    }

    pub fn put(url: &str) -> Result<Self, NetError> {
        Ok(Self::new(MethodDescriptor::put(), Self::parse_url(url)?))
    }

    pub fn delete(url: &str) -> Result<Self, NetError> {
        Ok(Self::new(MethodDescriptor::delete(), Self::parse_url(url)?))
    }

    /// Effective request URL (updated when redirects are followed).
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method_name(&self) -> &str {
        &self.method.name
    }

    /// Adds a header to the base header. The engine copies but never
    /// mutates the base header.
    pub fn set_header(&mut self, name: header::HeaderName, value: HeaderValue) {
        self.base_headers.insert(name, value);
    }

    pub fn base_headers(&self) -> &HeaderMap {
        &self.base_headers
    }

    pub fn set_request_body(&mut self, body: impl Into<RequestBody>) {
        self.request_body = body.into();
    }

    /// Streams the request body from a reader; a `None` length switches the
    /// transfer to chunked coding. Stream bodies cannot be retransmitted.
    pub fn set_request_stream(
        &mut self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        length: Option<u64>,
    ) {
        self.request_body = RequestBody::Stream { reader: Box::new(reader), length };
    }

    pub fn set_response_store(&mut self, store: ResponseStore) {
        self.store = store;
    }

    pub fn set_reconnect_mode(&mut self, mode: ReconnectMode) {
        self.reconnect_mode = mode;
    }

    pub fn set_redirect_mode(&mut self, mode: RedirectMode) {
        self.redirect_mode = mode;
    }

    /// Disables the pipeline proxy for this call only.
    pub fn set_proxy_enabled(&mut self, enabled: bool) {
        self.proxy_enabled = enabled;
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy_enabled
    }

    /// Condensed outcome. Anything but `Unserved` is terminal.
    pub fn status(&self) -> &CondensedStatus {
        &self.status
    }

    pub fn is_served(&self) -> bool {
        self.status.is_terminal()
    }

    /// Response head; available once the call is terminal.
    pub fn response(&self) -> Option<&ResponseHead> {
        if self.status.is_terminal() {
            self.response.as_ref()
        } else {
            None
        }
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.response().map(|r| r.status)
    }

    /// Response body bytes for memory stores.
    pub fn response_body(&self) -> Option<&[u8]> {
        if self.status.is_terminal() {
            self.store.bytes()
        } else {
            None
        }
    }

    pub fn response_store(&self) -> &ResponseStore {
        &self.store
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    /// A fresh, unserved call sharing the base header and body payload.
    /// `None` when the body was a stream that has already been consumed.
    pub fn reload(&self) -> Option<Call> {
        let body = self.request_body.try_clone_payload()?;
        let mut call = Call::new(self.method.clone(), self.url.clone());
        call.base_headers = self.base_headers.clone();
        call.request_body = body;
        call.reconnect_mode = self.reconnect_mode.clone();
        call.redirect_mode = self.redirect_mode;
        call.proxy_enabled = self.proxy_enabled;
        Some(call)
    }

    // ---- engine internals -------------------------------------------------

    pub(crate) fn finish(&mut self, status: CondensedStatus) {
        debug_assert!(!self.status.is_terminal(), "call finished twice");
        self.status = status;
    }

    pub(crate) fn redirect_permitted(&self) -> bool {
        match self.redirect_mode {
            RedirectMode::Never => false,
            RedirectMode::IfIdempotent => self.method.idempotent,
            RedirectMode::Always => true,
        }
    }

    /// Whether a response with this status may be consumed internally
    /// (redirect to follow, auth round) rather than delivered.
    pub(crate) fn response_is_internal_candidate(
        &self,
        status: StatusCode,
        max_redirections: u32,
    ) -> bool {
        match status.as_u16() {
            301 | 302 | 303 | 307 => {
                self.redirect_permitted() && self.redirect_count < max_redirections
            }
            401 | 407 => true,
            _ => false,
        }
    }

    /// Reconnect policy decision for a call whose connection died after the
    /// request was (possibly partially) transmitted. The cap counts only
    /// connection-error resends, never redirect or auth retransmissions.
    pub(crate) fn may_resend(&self, max_message_errors: u32) -> bool {
        let policy = match &self.reconnect_mode {
            ReconnectMode::SendAgain => true,
            ReconnectMode::RequestFails => false,
            ReconnectMode::Inquire(f) => f(self),
            ReconnectMode::SendAgainIfIdem => self.method.idempotent,
        };
        policy && !self.stream_body_taken && self.resends < max_message_errors
    }

    /// Drops per-response state before a retransmission or re-route.
    pub(crate) fn reset_for_retransmit(&mut self) {
        self.response = None;
        self.interim_body = None;
        self.store.reset_for_retry();
    }

    /// Copies an internally buffered response body into the user's store,
    /// for interim responses that turned out to be final.
    pub(crate) fn commit_interim_body(&mut self) -> Result<(), NetError> {
        if let Some(body) = self.interim_body.take() {
            self.store.begin()?;
            self.store.write(&body)?;
            self.store.finish()?;
        }
        Ok(())
    }

    /// Builds the effective header and request target for one transmission.
    pub(crate) fn prepare_transmission(&mut self, cx: &TxContext<'_>) -> Result<TxPlan, NetError> {
        let target = if cx.via_proxy {
            self.url[Position::BeforeScheme..Position::AfterQuery].to_string()
        } else {
            let origin_form = &self.url[Position::BeforePath..Position::AfterQuery];
            if origin_form.is_empty() {
                self.method.empty_path_replacement.to_string()
            } else if origin_form == "/"
                && self.url.query().is_none()
                && self.method.empty_path_replacement != "/"
            {
                self.method.empty_path_replacement.to_string()
            } else {
                origin_form.to_string()
            }
        };

        let mut headers = self.base_headers.clone();

        // The engine owns connection management.
        if headers.remove(header::CONNECTION).is_some() {
            tracing::warn!(url = %self.url, "discarding user-set Connection header");
        }

        let host = self
            .url
            .host_str()
            .ok_or_else(|| NetError::UrlSyntax(self.url.to_string()))?;
        let host_value = match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&host_value)
                .map_err(|_| NetError::UrlSyntax(self.url.to_string()))?,
        );

        if !headers.contains_key(header::DATE) {
            headers.insert(header::DATE, imf_fixdate_now());
        }
        if !headers.contains_key(header::USER_AGENT) {
            if let Ok(ua) = HeaderValue::from_str(cx.user_agent) {
                headers.insert(header::USER_AGENT, ua);
            }
        }

        let body = std::mem::take(&mut self.request_body);
        let plan_body = match body {
            RequestBody::Empty => {
                if self.method.has_request_body {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
                BodyPlan::None
            }
            RequestBody::Bytes(b) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(b.len() as u64));
                // Keep a replayable copy for reconnects and redirects.
                self.request_body = RequestBody::Bytes(b.clone());
                BodyPlan::Known(b)
            }
            RequestBody::Stream { reader, length } => {
                self.stream_body_taken = true;
                match length {
                    Some(n) => {
                        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
                        BodyPlan::Stream { reader, length: Some(n) }
                    }
                    None => {
                        headers.insert(
                            header::TRANSFER_ENCODING,
                            HeaderValue::from_static("chunked"),
                        );
                        BodyPlan::Stream { reader, length: None }
                    }
                }
            }
        };

        if cx.inhibit_persistency || cx.mark_close {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        if let Some(att) = &self.auth {
            let mut session = att.session.lock().unwrap();
            let value = session.credentials(&self.method.name, &target)?;
            let name = if session.for_proxy() {
                header::PROXY_AUTHORIZATION
            } else {
                header::AUTHORIZATION
            };
            headers.insert(
                name,
                HeaderValue::from_str(&value)
                    .map_err(|_| NetError::BadMessage("invalid auth credentials".into()))?,
            );
        }
        if cx.via_proxy && !headers.contains_key(header::PROXY_AUTHORIZATION) {
            if let Some(value) = cx.proxy_authorization {
                headers.insert(header::PROXY_AUTHORIZATION, value.clone());
            }
        }

        if let Some(fixup) = &self.method.fixup {
            fixup(&mut headers);
        }

        let has_body = !matches!(plan_body, BodyPlan::None);
        let expect_continue =
            has_body && codec::header_has_token(&headers, header::EXPECT, "100-continue");

        self.transmissions += 1;

        Ok(TxPlan {
            method: self.method.name.to_string(),
            target,
            headers,
            body: plan_body,
            expect_continue,
        })
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method.name)
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("redirects", &self.redirect_count)
            .field("transmissions", &self.transmissions)
            .finish_non_exhaustive()
    }
}

/// Per-transmission context supplied by the connection driver.
pub(crate) struct TxContext<'a> {
    pub via_proxy: bool,
    pub inhibit_persistency: bool,
    /// Marks the request `Connection: close` (final request of a draining
    /// non-persistent exchange).
    pub mark_close: bool,
    pub user_agent: &'a str,
    pub proxy_authorization: Option<&'a HeaderValue>,
}

/// One serialized transmission: request line ingredients plus body plan.
pub(crate) struct TxPlan {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: BodyPlan,
    pub expect_continue: bool,
}

pub(crate) enum BodyPlan {
    None,
    Known(Bytes),
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: Option<u64>,
    },
}

fn imf_fixdate_now() -> HeaderValue {
    use time::macros::format_description;
    let fmt = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    time::OffsetDateTime::now_utc()
        .format(fmt)
        .ok()
        .and_then(|s| HeaderValue::from_str(&s).ok())
        .unwrap_or_else(|| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}
