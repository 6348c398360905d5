//! The pipeline: the user's handle to the engine.
//!
//! A pipeline accepts calls, routes each to the per-origin queue of its
//! effective target (origin server or proxy), binds calls to connection
//! drivers, and post-processes their responses: redirects are re-routed,
//! 401/407 challenges start authentication rounds, everything else
//! completes the call and fires its callback. `run()` drives the engine
//! until every accepted call is terminal.

pub mod options;

use std::collections::HashMap;
use std::sync::Arc;

use http::header;
use slab::Slab;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::auth::{AuthHandler, AuthRegistry, Challenge, Key, KeyHandler, KeyRing};
use crate::base::{CounterSnapshot, Counters, NetError};
use crate::dns::{GaiResolver, Resolve};
use crate::http::call::{AuthAttachment, Call, CallCallback, CondensedStatus, MethodDescriptor};
use crate::http::RequestBody;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::socket::cache::CacheKey;
use crate::socket::conn::{CloseCause, ConnCommand, ConnEvent, ConnId, ConnTuning, Connection};
use crate::socket::queue::{ConnSlot, OriginKey, OriginQueue};
use crate::socket::{ConnectionCache, Connector, ProxyConfig, TcpConnector};

pub use options::{Options, Synchronization};

/// Challenge rounds one call may answer before it is delivered verbatim.
const MAX_AUTH_ROUNDS: u32 = 3;

/// Event bus depth between connection drivers and the run loop.
const EVENT_BUS_CAPACITY: usize = 256;

type Injected = (Box<Call>, Option<CallCallback>);

/// Cloneable handle for adding calls from completion callbacks or other
/// tasks. Calls land in the pipeline the next time its run loop turns.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Injected>,
}

impl PipelineHandle {
    pub fn add(&self, call: Call) -> Result<(), NetError> {
        self.tx
            .send((Box::new(call), None))
            .map_err(|_| NetError::Closed)
    }

    pub fn add_with_callback(
        &self,
        call: Call,
        callback: impl FnOnce(&Call) + Send + 'static,
    ) -> Result<(), NetError> {
        self.tx
            .send((Box::new(call), Some(Box::new(callback))))
            .map_err(|_| NetError::Closed)
    }
}

/// Orchestrator owning per-origin queues, connection drivers, the auth
/// registry, and the transfer counters.
pub struct Pipeline {
    options: Options,
    resolver: Arc<dyn Resolve>,
    connector: Arc<dyn Connector>,
    cache: Arc<ConnectionCache>,
    auth: AuthRegistry,
    keys: Arc<KeyRing>,
    proxy: Option<ProxyConfig>,
    counters: Arc<Counters>,
    origins: HashMap<OriginKey, OriginQueue>,
    conn_origins: Slab<OriginKey>,
    events_rx: PipeReader<ConnEvent>,
    events_tx: PipeWriter<ConnEvent>,
    tasks: JoinSet<()>,
    open_calls: usize,
    injected_tx: mpsc::UnboundedSender<Injected>,
    injected_rx: mpsc::UnboundedReceiver<Injected>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// A pipeline with default options, the system resolver, plain TCP
    /// transport, and a private restrictive connection cache.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(ConnectionCache::restrictive()))
    }

    /// A pipeline sharing `cache` with other pipelines.
    pub fn with_cache(cache: Arc<ConnectionCache>) -> Self {
        cache.attach();
        let (events_rx, events_tx) = pipe(EVENT_BUS_CAPACITY);
        let (injected_tx, injected_rx) = mpsc::unbounded_channel();
        Self {
            options: Options::default(),
            resolver: Arc::new(GaiResolver::new()),
            connector: Arc::new(TcpConnector::new()),
            cache,
            auth: AuthRegistry::new(),
            keys: Arc::new(KeyRing::default()),
            proxy: None,
            counters: Arc::new(Counters::new()),
            origins: HashMap::new(),
            conn_origins: Slab::new(),
            events_rx,
            events_tx,
            tasks: JoinSet::new(),
            open_calls: 0,
            injected_tx,
            injected_rx,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Replaces the options. Affects connections opened afterwards.
    pub fn set_options(&mut self, options: Options) {
        self.options = options;
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn Resolve>) {
        self.resolver = resolver;
    }

    pub fn set_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connector = connector;
    }

    /// Routes subsequent calls through `proxy`, except hosts its
    /// `no_proxy` rules bypass.
    pub fn set_proxy(&mut self, proxy: ProxyConfig) {
        self.proxy = Some(proxy);
    }

    /// Configures the proxy from `http_proxy` / `no_proxy`. Returns
    /// whether a proxy was found.
    pub fn set_proxy_from_env(&mut self) -> bool {
        match ProxyConfig::from_env() {
            Some(p) => {
                self.proxy = Some(p);
                true
            }
            None => false,
        }
    }

    /// Registers an authentication scheme handler.
    pub fn register_auth_handler(&mut self, handler: Arc<dyn AuthHandler>) {
        self.auth.register(handler);
    }

    /// Installs the uplink credential source consulted on key-ring misses.
    pub fn set_key_handler(&mut self, uplink: Arc<dyn KeyHandler>) {
        self.keys = Arc::new(KeyRing::new(Some(uplink)));
    }

    /// Adds a credential to the key ring.
    pub fn add_key(&self, key: Key) {
        self.keys.add_key(key);
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Handle for adding calls from callbacks or other tasks.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle { tx: self.injected_tx.clone() }
    }

    /// Calls accepted and not yet terminal.
    pub fn open_calls(&self) -> usize {
        self.open_calls
    }

    /// Accepts a call. Must be invoked inside a tokio runtime; transfer
    /// progresses while [`Pipeline::run`] is awaited.
    pub fn add(&mut self, call: Call) {
        self.accept(Box::new(call), None);
    }

    /// Accepts a call with a completion callback, invoked exactly once
    /// from the run loop when the call turns terminal.
    pub fn add_with_callback(
        &mut self,
        call: Call,
        callback: impl FnOnce(&Call) + Send + 'static,
    ) {
        self.accept(Box::new(call), Some(Box::new(callback)));
    }

    fn accept(&mut self, mut call: Box<Call>, callback: Option<CallCallback>) {
        if let Some(cb) = callback {
            call.on_done = Some(cb);
        }
        self.open_calls += 1;
        self.route(call);
    }

    /// Drives the engine until every accepted call is terminal, then
    /// parks surviving connections in the cache.
    pub async fn run(&mut self) -> Result<(), NetError> {
        loop {
            // Callbacks may have enqueued further calls through the handle.
            while let Ok((call, cb)) = self.injected_rx.try_recv() {
                self.accept(call, cb);
            }
            if self.open_calls == 0 {
                break;
            }
            tokio::select! {
                ev = self.events_rx.read() => match ev {
                    Ok(Some(ev)) => self.on_event(ev).await,
                    Ok(None) => break,
                    Err(e) => return Err(e),
                },
                injected = self.injected_rx.recv() => {
                    if let Some((call, cb)) = injected {
                        self.accept(call, cb);
                    }
                }
            }
        }
        self.drain_connections().await;
        Ok(())
    }

    /// Aborts everything: every unfinished call turns
    /// `ProtocolError(NoReply)` and its callback fires; connections are
    /// returned to the cache or closed per their state.
    pub async fn reset(&mut self) {
        for queue in self.origins.values_mut() {
            for slot in queue.conns.iter_mut() {
                slot.accepting = false;
                let _ = slot.tx.send(ConnCommand::Abort);
            }
        }
        while !self.conn_origins.is_empty() {
            match self.events_rx.read().await {
                Ok(Some(ConnEvent::Closed { conn, unsent, unanswered, parked, .. })) => {
                    self.forget_conn(conn);
                    if let Some(p) = parked {
                        self.cache.release(p);
                    }
                    for call in unsent.into_iter().chain(unanswered) {
                        self.finalize(call, CondensedStatus::ProtocolError(NetError::NoReply));
                    }
                }
                Ok(Some(ConnEvent::Served { conn, call }))
                | Ok(Some(ConnEvent::Failed { conn, call })) => {
                    self.slot_done(conn);
                    self.finalize(call, CondensedStatus::ProtocolError(NetError::NoReply));
                }
                Ok(Some(ConnEvent::Idle { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }
        let keys: Vec<OriginKey> = self.origins.keys().cloned().collect();
        for key in keys {
            let waiting: Vec<Box<Call>> = self
                .origins
                .get_mut(&key)
                .map(|q| q.waiting.drain(..).collect())
                .unwrap_or_default();
            for call in waiting {
                self.finalize(call, CondensedStatus::ProtocolError(NetError::NoReply));
            }
        }
        self.origins.clear();
        while let Ok((mut call, cb)) = self.injected_rx.try_recv() {
            if let Some(cb) = cb {
                call.on_done = Some(cb);
            }
            if !call.is_served() {
                call.finish(CondensedStatus::ProtocolError(NetError::NoReply));
            }
            Self::invoke_callback(&mut call);
        }
        while self.tasks.join_next().await.is_some() {}
        self.open_calls = 0;
    }

    // ---- routing ----------------------------------------------------------

    fn route(&mut self, mut call: Box<Call>) {
        if call.auth.is_none() {
            if let Some(session) = self.auth.find_in_advance(call.url()) {
                call.auth = Some(AuthAttachment { session, rounds: 0 });
            }
        }

        let via_proxy = matches!(
            &self.proxy,
            Some(p) if call.proxy_enabled() && !p.should_bypass(call.url())
        );
        call.via_proxy = via_proxy;

        let key = if via_proxy {
            let p = self.proxy.as_ref().expect("proxy checked above");
            OriginKey::new(p.host(), p.port())
        } else {
            match (call.url().host_str(), call.url().port_or_known_default()) {
                (Some(host), Some(port)) => OriginKey::new(host, port),
                _ => {
                    let url = call.url().to_string();
                    self.finalize(call, CondensedStatus::ProtocolError(NetError::UrlSyntax(url)));
                    return;
                }
            }
        };

        let queue = self
            .origins
            .entry(key.clone())
            .or_insert_with(|| OriginQueue::new(key.clone(), via_proxy));
        queue.waiting.push_back(call);
        self.pump(&key);
    }

    /// Assigns waiting calls of one origin; opens a connection only when
    /// no existing one accepts work.
    fn pump(&mut self, key: &OriginKey) {
        enum Action {
            Assign(ConnId),
            Spawn,
            FailAll,
            Stop,
        }
        loop {
            let action = {
                let Some(queue) = self.origins.get_mut(key) else { return };
                if queue.waiting.is_empty() {
                    Action::Stop
                } else if let Some(slot) = queue.accepting_slot() {
                    Action::Assign(slot.id)
                } else if queue.connect_failures >= self.options.max_connection_failures
                    && queue.conns.is_empty()
                {
                    Action::FailAll
                } else if queue.conns.len() < self.options.parallel_connections {
                    Action::Spawn
                } else {
                    Action::Stop
                }
            };

            match action {
                Action::Stop => return,
                Action::Assign(id) => {
                    let Some(queue) = self.origins.get_mut(key) else { return };
                    let Some(call) = queue.waiting.pop_front() else { return };
                    let Some(slot) = queue.slot_mut(id) else {
                        queue.waiting.push_front(call);
                        continue;
                    };
                    match slot.tx.send(ConnCommand::Assign(call)) {
                        Ok(()) => slot.assigned += 1,
                        Err(rejected) => {
                            // Driver already gone; its Closed event will
                            // remove the slot.
                            slot.accepting = false;
                            if let ConnCommand::Assign(call) = rejected.0 {
                                queue.waiting.push_front(call);
                            }
                        }
                    }
                }
                Action::Spawn => self.spawn_conn(key.clone()),
                Action::FailAll => {
                    let (error, waiting) = {
                        let Some(queue) = self.origins.get_mut(key) else { return };
                        let error = queue.last_error.clone().unwrap_or(NetError::NoReply);
                        let waiting: Vec<Box<Call>> = queue.waiting.drain(..).collect();
                        (error, waiting)
                    };
                    tracing::warn!(host = %key.host, port = key.port, error = %error,
                        "connection failure budget exhausted, failing pending calls");
                    for call in waiting {
                        self.finalize(call, CondensedStatus::ProtocolError(error.clone()));
                    }
                    return;
                }
            }
        }
    }

    fn spawn_conn(&mut self, key: OriginKey) {
        let via_proxy = self
            .origins
            .get(&key)
            .map(|q| q.via_proxy)
            .unwrap_or(false);
        let cache_key = CacheKey::new(key.host.clone(), key.port, self.connector.kind());
        let reuse = self.cache.acquire(&cache_key);
        let id = self.conn_origins.insert(key.clone());
        let (tx, commands) = mpsc::unbounded_channel();

        let tuning = ConnTuning {
            depth: self.options.synchronization.depth(),
            connection_timeout: self.options.connection_timeout,
            handshake_timeout: self.options.handshake_timeout,
            inhibit_persistency: self.options.inhibit_persistency,
            max_redirections: self.options.max_redirections,
            user_agent: self.options.user_agent.clone(),
            via_proxy,
            proxy_authorization: if via_proxy {
                self.proxy.as_ref().and_then(|p| p.authorization())
            } else {
                None
            },
        };

        tracing::debug!(conn = id, host = %key.host, port = key.port, reused = reuse.is_some(),
            "starting connection");
        let driver = Connection {
            id,
            key: cache_key,
            tuning,
            resolver: self.resolver.clone(),
            connector: self.connector.clone(),
            counters: self.counters.clone(),
            events: self.events_tx.clone(),
            commands,
            reuse,
        };
        self.tasks.spawn(driver.run());

        if let Some(queue) = self.origins.get_mut(&key) {
            queue.conns.push(ConnSlot { id, tx, assigned: 0, accepting: true });
        }
    }

    // ---- event handling ---------------------------------------------------

    async fn on_event(&mut self, ev: ConnEvent) {
        match ev {
            ConnEvent::Served { conn, call } => self.on_served(conn, call),
            ConnEvent::Failed { conn, call } => {
                self.slot_done(conn);
                let mut call = call;
                self.open_calls = self.open_calls.saturating_sub(1);
                Self::invoke_callback(&mut call);
                if let Some(key) = self.conn_origins.get(conn).cloned() {
                    self.pump(&key);
                }
            }
            ConnEvent::Idle { conn } => self.on_idle(conn),
            ConnEvent::Closed { conn, cause, unsent, unanswered, parked } => {
                self.on_closed(conn, cause, unsent, unanswered, parked);
            }
        }
    }

    fn on_served(&mut self, conn: ConnId, call: Box<Call>) {
        self.slot_done(conn);
        let origin = self.conn_origins.get(conn).cloned();
        if let Some(key) = &origin {
            if let Some(queue) = self.origins.get_mut(key) {
                // The origin is reachable and serving.
                queue.connect_failures = 0;
            }
        }

        match call.response.as_ref().map(|h| h.status.as_u16()) {
            Some(301) | Some(302) | Some(303) | Some(307) => self.handle_redirect(call),
            Some(401) => self.handle_auth(call, false),
            Some(407) => self.handle_auth(call, true),
            _ => self.deliver_verbatim(call),
        }

        if let Some(key) = origin {
            self.pump(&key);
        }
    }

    fn on_idle(&mut self, conn: ConnId) {
        let Some(key) = self.conn_origins.get(conn).cloned() else { return };
        let Some(queue) = self.origins.get_mut(&key) else { return };
        if queue.waiting.is_empty() && queue.outstanding() == 0 {
            // The origin owes no work: let the driver park itself.
            tracing::debug!(conn, host = %queue.key.host, "draining idle connection");
            if let Some(slot) = queue.slot_mut(conn) {
                slot.accepting = false;
                let _ = slot.tx.send(ConnCommand::Drain);
            }
        } else if !queue.waiting.is_empty() {
            self.pump(&key);
        }
    }

    fn on_closed(
        &mut self,
        conn: ConnId,
        cause: CloseCause,
        unsent: Vec<Box<Call>>,
        unanswered: Vec<Box<Call>>,
        parked: Option<crate::socket::cache::ParkedConnection>,
    ) {
        let key = self.forget_conn(conn);
        if let Some(p) = parked {
            self.cache.release(p);
        }

        let error = cause.error();
        let aborted = matches!(cause, CloseCause::Aborted);
        if error.is_some() {
            if let Some(key) = &key {
                if let Some(queue) = self.origins.get_mut(key) {
                    queue.connect_failures += 1;
                    queue.last_error = error.clone();
                }
            }
        }

        let mut requeue: Vec<Box<Call>> = Vec::new();
        for mut call in unanswered {
            if aborted {
                self.finalize(call, CondensedStatus::ProtocolError(NetError::NoReply));
            } else if call.may_resend(self.options.max_message_errors) {
                tracing::debug!(url = %call.url(), resends = call.resends + 1,
                    "re-queueing interrupted call");
                call.resends += 1;
                call.reset_for_retransmit();
                requeue.push(call);
            } else {
                let e = error.clone().unwrap_or(NetError::NoReply);
                self.finalize(call, CondensedStatus::ProtocolError(e));
            }
        }
        for call in unsent {
            if aborted {
                self.finalize(call, CondensedStatus::ProtocolError(NetError::NoReply));
            } else {
                // Never transmitted on this connection; reassignment is
                // always safe.
                requeue.push(call);
            }
        }

        let Some(key) = key else {
            for call in requeue {
                self.finalize(call, CondensedStatus::ProtocolError(NetError::NoReply));
            }
            return;
        };

        let overflowed = self
            .origins
            .get(&key)
            .map(|q| q.connect_failures >= self.options.max_connection_failures)
            .unwrap_or(false);
        if overflowed && !requeue.is_empty() {
            let e = error.unwrap_or(NetError::NoReply);
            tracing::warn!(host = %key.host, error = %e,
                "connection failure budget exhausted");
            for call in requeue {
                self.finalize(call, CondensedStatus::ProtocolError(e.clone()));
            }
            let waiting: Vec<Box<Call>> = self
                .origins
                .get_mut(&key)
                .map(|q| q.waiting.drain(..).collect())
                .unwrap_or_default();
            for call in waiting {
                self.finalize(call, CondensedStatus::ProtocolError(e.clone()));
            }
        } else {
            if let Some(queue) = self.origins.get_mut(&key) {
                for call in requeue.into_iter().rev() {
                    queue.waiting.push_front(call);
                }
            }
            self.pump(&key);
        }

        // Drop drained origin queues.
        let empty = self
            .origins
            .get(&key)
            .map(|q| q.waiting.is_empty() && q.conns.is_empty())
            .unwrap_or(false);
        if empty {
            self.origins.remove(&key);
        }
    }

    // ---- response post-processing ----------------------------------------

    fn handle_redirect(&mut self, mut call: Box<Call>) {
        if !call.redirect_permitted() {
            return self.deliver_verbatim(call);
        }
        if call.redirect_count >= self.options.max_redirections {
            return self.finalize(
                call,
                CondensedStatus::ProtocolError(NetError::TooManyRedirections),
            );
        }
        let location = call
            .response
            .as_ref()
            .and_then(|h| h.headers.get(header::LOCATION))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(location) = location else {
            return self.deliver_verbatim(call);
        };
        let new_url = match call.url().join(&location) {
            Ok(url) => url,
            Err(_) => {
                return self.finalize(
                    call,
                    CondensedStatus::ProtocolError(NetError::UrlSyntax(location)),
                )
            }
        };
        if !matches!(new_url.scheme(), "http" | "https") {
            return self.finalize(
                call,
                CondensedStatus::ProtocolError(NetError::UrlSyntax(new_url.to_string())),
            );
        }

        let status = call.response.as_ref().map(|h| h.status.as_u16()).unwrap_or(0);
        tracing::debug!(from = %call.url(), to = %new_url, status, "following redirect");

        // 303 rewrites to GET; 301/302/307 preserve the method.
        if status == 303 {
            call.method = MethodDescriptor::get();
            call.request_body = RequestBody::Empty;
        }
        if call.url().origin() != new_url.origin() {
            // Credentials never travel across origins.
            call.auth = None;
        }
        call.url = new_url;
        call.redirect_count += 1;
        call.reset_for_retransmit();
        self.route(call);
    }

    fn handle_auth(&mut self, mut call: Box<Call>, proxy: bool) {
        let challenge_header = if proxy {
            header::PROXY_AUTHENTICATE
        } else {
            header::WWW_AUTHENTICATE
        };
        let challenges = call
            .response
            .as_ref()
            .map(|h| Challenge::parse_all(&h.headers, challenge_header))
            .unwrap_or_default();
        if challenges.is_empty() {
            return self.deliver_verbatim(call);
        }

        // The call already carried credentials for this direction: ask the
        // session whether another round is worth trying (Digest stale).
        let mut replace_attachment = false;
        if let Some(att) = call.auth.as_ref() {
            let (session_proxy, scheme) = {
                let state = att.session.lock().unwrap();
                (state.for_proxy(), state.scheme())
            };
            if session_proxy == proxy {
                let retry = att.rounds < MAX_AUTH_ROUNDS && {
                    let mut state = att.session.lock().unwrap();
                    challenges
                        .iter()
                        .find(|c| c.scheme == scheme)
                        .map(|c| state.invalidate(c))
                        .unwrap_or(false)
                };
                if retry {
                    if let Some(att) = call.auth.as_mut() {
                        att.rounds += 1;
                    }
                    call.reset_for_retransmit();
                    self.route(call);
                } else {
                    self.deliver_verbatim(call);
                }
                return;
            }
            replace_attachment = true;
        }

        let endpoint: (String, u16) = if proxy {
            match &self.proxy {
                Some(p) => (p.host().to_string(), p.port()),
                None => return self.deliver_verbatim(call),
            }
        } else {
            match (call.url().host_str(), call.url().port_or_known_default()) {
                (Some(host), Some(port)) => (host.to_string(), port),
                _ => return self.deliver_verbatim(call),
            }
        };

        let session = self.auth.create_session(
            call.url(),
            (&endpoint.0, endpoint.1),
            &challenges,
            proxy,
            self.keys.as_ref(),
        );
        match session {
            Some(session) => {
                if replace_attachment {
                    tracing::debug!(url = %call.url(), "replacing auth attachment for proxy round");
                }
                call.auth = Some(AuthAttachment { session, rounds: 1 });
                call.reset_for_retransmit();
                self.route(call);
            }
            // No handler or no credentials: the challenge is delivered.
            None => self.deliver_verbatim(call),
        }
    }

    /// Delivers the response the server sent, condensing by status class.
    fn deliver_verbatim(&mut self, call: Box<Call>) {
        let condensed = call
            .response
            .as_ref()
            .map(|h| CondensedStatus::from_status(h.status))
            .unwrap_or(CondensedStatus::ProtocolError(NetError::NoReply));
        self.finalize(call, condensed);
    }

    fn finalize(&mut self, mut call: Box<Call>, status: CondensedStatus) {
        if !call.is_served() {
            let status = match call.commit_interim_body() {
                Ok(()) => status,
                Err(e) => CondensedStatus::ProtocolError(e),
            };
            call.finish(status);
        }
        self.open_calls = self.open_calls.saturating_sub(1);
        Self::invoke_callback(&mut call);
    }

    fn invoke_callback(call: &mut Box<Call>) {
        if let Some(cb) = call.on_done.take() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&**call)));
            if result.is_err() {
                tracing::warn!(url = %call.url(), "completion callback panicked");
            }
        }
    }

    // ---- bookkeeping ------------------------------------------------------

    fn slot_done(&mut self, conn: ConnId) {
        let Some(key) = self.conn_origins.get(conn).cloned() else { return };
        if let Some(queue) = self.origins.get_mut(&key) {
            if let Some(slot) = queue.slot_mut(conn) {
                slot.assigned = slot.assigned.saturating_sub(1);
            }
        }
    }

    fn forget_conn(&mut self, conn: ConnId) -> Option<OriginKey> {
        if !self.conn_origins.contains(conn) {
            return None;
        }
        let key = self.conn_origins.remove(conn);
        if let Some(queue) = self.origins.get_mut(&key) {
            queue.remove_slot(conn);
        }
        Some(key)
    }

    /// Parks surviving connections once every call is terminal.
    async fn drain_connections(&mut self) {
        for queue in self.origins.values_mut() {
            for slot in queue.conns.iter_mut() {
                slot.accepting = false;
                let _ = slot.tx.send(ConnCommand::Drain);
            }
        }
        while !self.conn_origins.is_empty() {
            match self.events_rx.read().await {
                Ok(Some(ConnEvent::Closed { conn, parked, .. })) => {
                    self.forget_conn(conn);
                    if let Some(p) = parked {
                        self.cache.release(p);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        self.origins.retain(|_, q| !q.waiting.is_empty() || !q.conns.is_empty());
        while self.tasks.join_next().await.is_some() {}
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cache.detach();
    }
}
