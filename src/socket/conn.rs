//! Connection state machine driver.
//!
//! One driver owns one transport and serves the calls a pipeline assigns
//! to it: Unconnected → Resolving → Connecting, then a duplex loop over
//! Idle/Sending/Awaiting/Reading until drained, aborted, or failed.
//! Responses are matched to requests in FIFO order; the in-flight window
//! never exceeds the pipelining depth, and stays at one request until the
//! first response proves the server speaks HTTP/1.1.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderValue, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::base::{Counters, NetError};
use crate::dns::{Name, Resolve};
use crate::http::call::{BodyPlan, Call, CondensedStatus, TxContext};
use crate::http::codec::{self, BodyFraming, ChunkedDecoder, ResponseHead};
use crate::pipe::PipeWriter;
use crate::socket::cache::{CacheKey, ParkedConnection};
use crate::socket::{BoxTransport, Connector};

pub(crate) type ConnId = usize;

/// Serialize another request only when the pending output is below this.
const WRITE_LOW_WATER: usize = 8 * 1024;

pub(crate) enum ConnCommand {
    Assign(Box<Call>),
    /// Finish assigned work, then park into the cache.
    Drain,
    /// Tear down immediately, returning every assigned call.
    Abort,
}

pub(crate) enum ConnEvent {
    /// A response was fully received for this call.
    Served { conn: ConnId, call: Box<Call> },
    /// The call failed before transmission (already terminal).
    Failed { conn: ConnId, call: Box<Call> },
    /// Nothing to do; awaiting further assignments.
    Idle { conn: ConnId },
    /// Driver finished. Unsent calls were never transmitted here;
    /// unanswered calls were on the wire without a complete response.
    Closed {
        conn: ConnId,
        cause: CloseCause,
        unsent: Vec<Box<Call>>,
        unanswered: Vec<Box<Call>>,
        parked: Option<ParkedConnection>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseCause {
    Drained,
    Aborted,
    /// Server closed a connection with nothing outstanding (keep-alive
    /// expiry, close-delimited response). Not a failure.
    ServerEof,
    TimedOut,
    Crashed(NetError),
    ConnectFailed(NetError),
}

impl CloseCause {
    /// The failure charged to the origin's connection budget. `None` for
    /// terminations that are not failures: drain, abort, and clean EOF,
    /// which only feeds the `server_eof` diagnostic counter.
    pub(crate) fn error(&self) -> Option<NetError> {
        match self {
            CloseCause::Drained | CloseCause::Aborted | CloseCause::ServerEof => None,
            CloseCause::TimedOut => Some(NetError::TimedOut),
            CloseCause::Crashed(e) | CloseCause::ConnectFailed(e) => Some(e.clone()),
        }
    }
}

/// Per-connection snapshot of the pipeline options.
#[derive(Clone)]
pub(crate) struct ConnTuning {
    pub depth: usize,
    pub connection_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inhibit_persistency: bool,
    pub max_redirections: u32,
    pub user_agent: String,
    pub via_proxy: bool,
    pub proxy_authorization: Option<HeaderValue>,
}

pub(crate) struct Connection {
    pub id: ConnId,
    pub key: CacheKey,
    pub tuning: ConnTuning,
    pub resolver: Arc<dyn Resolve>,
    pub connector: Arc<dyn Connector>,
    pub counters: Arc<Counters>,
    pub events: PipeWriter<ConnEvent>,
    pub commands: mpsc::UnboundedReceiver<ConnCommand>,
    pub reuse: Option<ParkedConnection>,
}

struct InflightEntry {
    call: Box<Call>,
    method: String,
    /// False while an Expect handshake holds the body back.
    body_sent: bool,
}

enum PendingBody {
    Known(Bytes),
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: Option<u64>,
    },
}

/// Request body held back for `Expect: 100-continue`.
struct Pending100 {
    body: PendingBody,
    deadline: Instant,
}

/// Actively transmitted stream body.
struct StreamTx {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    /// `None` = chunked coding.
    remaining: Option<u64>,
}

impl StreamTx {
    fn new(reader: Box<dyn AsyncRead + Send + Unpin>, length: Option<u64>) -> Self {
        Self { reader, remaining: length }
    }
}

enum Framing {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilEof,
}

enum ReadPhase {
    Head,
    Body {
        head: ResponseHead,
        internal: bool,
        framing: Framing,
        interim: BytesMut,
    },
}

enum Step {
    Command(Option<ConnCommand>),
    Wrote(std::io::Result<usize>),
    StreamRead(std::io::Result<usize>),
    Read(std::io::Result<usize>),
    HandshakeExpired,
    InactivityTimeout,
}

enum Exit {
    /// Work drained; eligible for parking.
    Graceful,
    Aborted,
    /// Peer closed with nothing outstanding.
    EofClean,
    /// Peer closed with work outstanding.
    EofCrashed,
    TimedOut,
    Crashed(NetError),
}

struct Engine {
    id: ConnId,
    key: CacheKey,
    tuning: ConnTuning,
    counters: Arc<Counters>,
    sendq: VecDeque<Box<Call>>,
    inflight: VecDeque<InflightEntry>,
    /// Unknown until the first status line arrives.
    version: Option<Version>,
    pipelining_allowed: bool,
    /// Server signalled `Connection: close`: drain, then close.
    peer_close: bool,
    /// We sent `Connection: close`; no further requests on this transport.
    close_sent: bool,
    counted: bool,
    served: u64,
    draining: bool,
    commands_open: bool,
    pending_100: Option<Pending100>,
    reading: ReadPhase,
}

impl Connection {
    pub(crate) async fn run(self) {
        let Connection {
            id,
            key,
            tuning,
            resolver,
            connector,
            counters,
            events,
            mut commands,
            reuse,
        } = self;

        let mut eng = Engine {
            id,
            key: key.clone(),
            tuning,
            counters,
            sendq: VecDeque::new(),
            inflight: VecDeque::new(),
            version: None,
            pipelining_allowed: false,
            peer_close: false,
            close_sent: false,
            counted: false,
            served: 0,
            draining: false,
            commands_open: true,
            pending_100: None,
            reading: ReadPhase::Head,
        };

        let transport: BoxTransport = match reuse {
            Some(parked) => {
                eng.version = parked.version;
                eng.pipelining_allowed = parked.pipelining_allowed
                    && eng.tuning.depth > 1
                    && !eng.tuning.inhibit_persistency;
                eng.counted = parked.counted;
                parked.transport
            }
            None => {
                eng.counters.incr_new();
                // Commands keep arriving while the connection comes up; an
                // Abort must not wait for the connect to finish.
                let established = {
                    let fut = establish(&key, &resolver, &connector, eng.tuning.connection_timeout);
                    tokio::pin!(fut);
                    loop {
                        tokio::select! {
                            r = &mut fut => break Some(r),
                            cmd = commands.recv(), if eng.commands_open => match cmd {
                                Some(ConnCommand::Assign(call)) => eng.sendq.push_back(call),
                                Some(ConnCommand::Drain) => eng.draining = true,
                                Some(ConnCommand::Abort) => break None,
                                None => {
                                    eng.commands_open = false;
                                    eng.draining = true;
                                }
                            },
                        }
                    }
                };
                let result = match established {
                    Some(result) => result,
                    None => {
                        eng.counters.incr_failed();
                        let unsent: Vec<Box<Call>> = eng.sendq.drain(..).collect();
                        let _ = events
                            .write(Some(ConnEvent::Closed {
                                conn: id,
                                cause: CloseCause::Aborted,
                                unsent,
                                unanswered: Vec::new(),
                                parked: None,
                            }))
                            .await;
                        return;
                    }
                };
                match result {
                    Ok(t) => t,
                    Err(e) => {
                        eng.counters.incr_failed();
                        let mut unsent: Vec<Box<Call>> = eng.sendq.drain(..).collect();
                        while let Ok(cmd) = commands.try_recv() {
                            if let ConnCommand::Assign(call) = cmd {
                                unsent.push(call);
                            }
                        }
                        tracing::debug!(conn = id, host = %key.host, error = %e, "connect failed");
                        let _ = events
                            .write(Some(ConnEvent::Closed {
                                conn: id,
                                cause: CloseCause::ConnectFailed(e),
                                unsent,
                                unanswered: Vec::new(),
                                parked: None,
                            }))
                            .await;
                        return;
                    }
                }
            }
        };

        let (mut rd, mut wr) = tokio::io::split(transport);
        let mut inbuf = BytesMut::with_capacity(16 * 1024);
        let mut out = BytesMut::new();
        let mut stream: Option<StreamTx> = None;
        let mut tmp = vec![0u8; WRITE_LOW_WATER];
        let mut last_io = Instant::now();

        let exit: Exit = loop {
            while eng.can_start_next(&stream) {
                if let Some(failed) = eng.start_request(&mut out, &mut stream) {
                    let _ = events.write(Some(ConnEvent::Failed { conn: id, call: failed })).await;
                }
            }

            if eng.is_idle(&out, &stream) {
                if eng.draining || !eng.commands_open {
                    break Exit::Graceful;
                }
                let _ = events.write(Some(ConnEvent::Idle { conn: id })).await;
                match tokio::time::timeout(eng.tuning.connection_timeout, commands.recv()).await {
                    Ok(Some(cmd)) => {
                        if !eng.apply_command(cmd) {
                            break Exit::Aborted;
                        }
                    }
                    Ok(None) => {
                        eng.commands_open = false;
                    }
                    // Nobody needed this connection for a full timeout.
                    Err(_) => break Exit::Graceful,
                }
                continue;
            }

            let want_write = !out.is_empty();
            let feed_stream = stream.is_some() && !want_write;
            let want_read = !eng.inflight.is_empty();
            let idle_deadline = last_io + eng.tuning.connection_timeout;
            let handshake_deadline = eng.pending_100.as_ref().map(|p| p.deadline);

            let step = tokio::select! {
                biased;
                cmd = commands.recv(), if eng.commands_open => Step::Command(cmd),
                r = wr.write_buf(&mut out), if want_write => Step::Wrote(r),
                r = read_stream_chunk(&mut stream, &mut tmp), if feed_stream => Step::StreamRead(r),
                r = rd.read_buf(&mut inbuf), if want_read => Step::Read(r),
                _ = tokio::time::sleep_until(handshake_deadline.unwrap_or(idle_deadline)),
                    if handshake_deadline.is_some() => Step::HandshakeExpired,
                _ = tokio::time::sleep_until(idle_deadline) => Step::InactivityTimeout,
            };

            match step {
                Step::Command(Some(cmd)) => {
                    if !eng.apply_command(cmd) {
                        break Exit::Aborted;
                    }
                }
                Step::Command(None) => {
                    eng.commands_open = false;
                    eng.draining = true;
                }
                Step::Wrote(Ok(0)) => {
                    break Exit::Crashed(NetError::Io(ErrorKind::WriteZero));
                }
                Step::Wrote(Ok(_)) => {
                    last_io = Instant::now();
                }
                Step::Wrote(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
                Step::Wrote(Err(e)) => break Exit::Crashed(e.into()),
                Step::StreamRead(Ok(n)) => {
                    last_io = Instant::now();
                    if let Err(e) = feed_stream_bytes(&mut stream, &mut out, &tmp[..n]) {
                        break Exit::Crashed(e);
                    }
                }
                Step::StreamRead(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
                Step::StreamRead(Err(e)) => break Exit::Crashed(e.into()),
                Step::Read(Ok(0)) => {
                    match eng.handle_eof(&events).await {
                        Ok(exit) => break exit,
                        Err(e) => break Exit::Crashed(e),
                    }
                }
                Step::Read(Ok(_)) => {
                    last_io = Instant::now();
                    match eng.process_input(&mut inbuf, &mut out, &mut stream, &events).await {
                        Ok(None) => {}
                        Ok(Some(exit)) => break exit,
                        Err(e) => break Exit::Crashed(e),
                    }
                }
                Step::Read(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
                Step::Read(Err(e)) => break Exit::Crashed(e.into()),
                Step::HandshakeExpired => {
                    tracing::debug!(conn = id, "100-continue handshake expired, sending body");
                    eng.release_pending_body(&mut out, &mut stream);
                }
                Step::InactivityTimeout => break Exit::TimedOut,
            }
        };

        // Diagnostics by cause.
        match &exit {
            Exit::EofClean => eng.counters.incr_server_eof(),
            Exit::EofCrashed | Exit::Crashed(_) => eng.counters.incr_crashed(),
            Exit::TimedOut => eng.counters.incr_timed_out(),
            _ => {}
        }

        // Exactly one terminal count per transport lifecycle.
        let failed_exit = matches!(
            exit,
            Exit::EofCrashed | Exit::TimedOut | Exit::Crashed(_) | Exit::Aborted
        );
        if !eng.counted {
            if failed_exit {
                eng.counters.incr_failed();
            } else {
                eng.counters.incr_successful();
            }
            eng.counted = true;
        }

        let park_eligible = matches!(exit, Exit::Graceful)
            && !eng.peer_close
            && !eng.close_sent
            && eng.inflight.is_empty()
            && inbuf.is_empty();
        let parked = if park_eligible {
            let transport = rd.unsplit(wr);
            Some(ParkedConnection {
                transport,
                key: eng.key.clone(),
                version: eng.version,
                pipelining_allowed: eng.pipelining_allowed,
                counted: true,
            })
        } else {
            None
        };

        let cause = match exit {
            Exit::Graceful => CloseCause::Drained,
            Exit::Aborted => CloseCause::Aborted,
            Exit::EofClean => CloseCause::ServerEof,
            Exit::EofCrashed => CloseCause::Crashed(NetError::ServerEof),
            Exit::TimedOut => CloseCause::TimedOut,
            Exit::Crashed(e) => CloseCause::Crashed(e),
        };

        let unanswered: Vec<Box<Call>> = eng.inflight.drain(..).map(|e| e.call).collect();
        let mut unsent: Vec<Box<Call>> = eng.sendq.drain(..).collect();
        while let Ok(cmd) = commands.try_recv() {
            if let ConnCommand::Assign(call) = cmd {
                unsent.push(call);
            }
        }

        tracing::debug!(
            conn = id,
            ?cause,
            served = eng.served,
            unsent = unsent.len(),
            unanswered = unanswered.len(),
            parked = parked.is_some(),
            "connection closed"
        );
        let _ = events
            .write(Some(ConnEvent::Closed { conn: id, cause, unsent, unanswered, parked }))
            .await;
    }
}

impl Engine {
    fn effective_depth(&self) -> usize {
        if self.pipelining_allowed {
            self.tuning.depth
        } else {
            1
        }
    }

    fn accepting_sends(&self) -> bool {
        !self.peer_close && !self.close_sent
    }

    fn can_start_next(&self, stream: &Option<StreamTx>) -> bool {
        !self.sendq.is_empty()
            && self.pending_100.is_none()
            && stream.is_none()
            && self.accepting_sends()
            && self.inflight.len() < self.effective_depth()
            && (self.inflight.is_empty() || self.pipelining_allowed)
    }

    fn is_idle(&self, out: &BytesMut, stream: &Option<StreamTx>) -> bool {
        self.sendq.is_empty()
            && self.inflight.is_empty()
            && out.is_empty()
            && stream.is_none()
            && self.pending_100.is_none()
    }

    /// Returns false when the command aborts the connection.
    fn apply_command(&mut self, cmd: ConnCommand) -> bool {
        match cmd {
            ConnCommand::Assign(call) => {
                self.sendq.push_back(call);
                true
            }
            ConnCommand::Drain => {
                self.draining = true;
                true
            }
            ConnCommand::Abort => false,
        }
    }

    /// Serializes the next queued request. Returns a call that failed
    /// during preparation, already marked terminal.
    fn start_request(
        &mut self,
        out: &mut BytesMut,
        stream: &mut Option<StreamTx>,
    ) -> Option<Box<Call>> {
        let mut call = match self.sendq.pop_front() {
            Some(call) => call,
            None => return None,
        };
        let cx = TxContext {
            via_proxy: self.tuning.via_proxy,
            inhibit_persistency: self.tuning.inhibit_persistency,
            mark_close: false,
            user_agent: &self.tuning.user_agent,
            proxy_authorization: self.tuning.proxy_authorization.as_ref(),
        };
        let plan = match call.prepare_transmission(&cx) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(conn = self.id, url = %call.url(), error = %e, "request preparation failed");
                call.finish(CondensedStatus::ProtocolError(e));
                return Some(call);
            }
        };

        codec::encode_request_head(&plan.method, &plan.target, &plan.headers, out);
        if self.tuning.inhibit_persistency {
            self.close_sent = true;
        }

        let mut entry = InflightEntry { call, method: plan.method, body_sent: true };
        match plan.body {
            BodyPlan::None => {}
            BodyPlan::Known(bytes) => {
                if plan.expect_continue {
                    entry.body_sent = false;
                    self.pending_100 = Some(Pending100 {
                        body: PendingBody::Known(bytes),
                        deadline: Instant::now() + self.tuning.handshake_timeout,
                    });
                } else {
                    out.extend_from_slice(&bytes);
                }
            }
            BodyPlan::Stream { reader, length } => {
                if plan.expect_continue {
                    entry.body_sent = false;
                    self.pending_100 = Some(Pending100 {
                        body: PendingBody::Stream { reader, length },
                        deadline: Instant::now() + self.tuning.handshake_timeout,
                    });
                } else {
                    *stream = Some(StreamTx::new(reader, length));
                }
            }
        }
        tracing::trace!(conn = self.id, method = %entry.method, target = %entry.call.url(), "request serialized");
        self.inflight.push_back(entry);
        None
    }

    fn release_pending_body(&mut self, out: &mut BytesMut, stream: &mut Option<StreamTx>) {
        if let Some(pending) = self.pending_100.take() {
            match pending.body {
                PendingBody::Known(bytes) => out.extend_from_slice(&bytes),
                PendingBody::Stream { reader, length } => {
                    *stream = Some(StreamTx::new(reader, length))
                }
            }
            if let Some(entry) = self.inflight.back_mut() {
                entry.body_sent = true;
            }
        }
    }

    /// Decodes as many responses as `inbuf` holds.
    async fn process_input(
        &mut self,
        inbuf: &mut BytesMut,
        out: &mut BytesMut,
        stream: &mut Option<StreamTx>,
        events: &PipeWriter<ConnEvent>,
    ) -> Result<Option<Exit>, NetError> {
        loop {
            match std::mem::replace(&mut self.reading, ReadPhase::Head) {
                ReadPhase::Head => {
                    let Some((head, consumed)) = codec::parse_response_head(inbuf)? else {
                        return Ok(None);
                    };
                    inbuf.advance(consumed);

                    if head.status == StatusCode::CONTINUE {
                        tracing::trace!(conn = self.id, "100 Continue releases the request body");
                        self.release_pending_body(out, stream);
                        continue;
                    }
                    if head.status.is_informational() {
                        continue;
                    }

                    let entry = self.inflight.front_mut().ok_or_else(|| {
                        NetError::BadMessage("response without a matching request".into())
                    })?;

                    if self.version.is_none() {
                        self.version = Some(head.version);
                        self.pipelining_allowed = head.version >= Version::HTTP_11
                            && self.tuning.depth > 1
                            && !self.tuning.inhibit_persistency;
                        tracing::debug!(
                            conn = self.id,
                            version = ?head.version,
                            pipelining = self.pipelining_allowed,
                            "protocol negotiated"
                        );
                    }
                    if !codec::wants_keep_alive(&head) {
                        self.peer_close = true;
                        self.pipelining_allowed = false;
                    }
                    // Final response while the Expect handshake still holds
                    // the body: the request framing cannot complete, close
                    // after this exchange.
                    if !entry.body_sent {
                        self.pending_100 = None;
                        entry.body_sent = true;
                        self.peer_close = true;
                    }

                    let framing = codec::body_framing(&entry.method, &head)?;
                    let internal = entry
                        .call
                        .response_is_internal_candidate(head.status, self.tuning.max_redirections);
                    if !internal {
                        entry.call.store.begin()?;
                    }

                    match framing {
                        BodyFraming::Empty | BodyFraming::Length(0) => {
                            if let Some(exit) = self
                                .complete_response(head, internal, BytesMut::new(), events)
                                .await?
                            {
                                return Ok(Some(exit));
                            }
                        }
                        BodyFraming::Length(n) => {
                            self.reading = ReadPhase::Body {
                                head,
                                internal,
                                framing: Framing::Length { remaining: n },
                                interim: BytesMut::new(),
                            };
                        }
                        BodyFraming::Chunked => {
                            self.reading = ReadPhase::Body {
                                head,
                                internal,
                                framing: Framing::Chunked(ChunkedDecoder::new()),
                                interim: BytesMut::new(),
                            };
                        }
                        BodyFraming::UntilEof => {
                            self.reading = ReadPhase::Body {
                                head,
                                internal,
                                framing: Framing::UntilEof,
                                interim: BytesMut::new(),
                            };
                        }
                    }
                }
                ReadPhase::Body { head, internal, mut framing, mut interim } => {
                    let done = match &mut framing {
                        Framing::Length { remaining } => {
                            let take = (*remaining).min(inbuf.len() as u64) as usize;
                            if take > 0 {
                                if internal {
                                    interim.extend_from_slice(&inbuf[..take]);
                                } else if let Some(entry) = self.inflight.front_mut() {
                                    entry.call.store.write(&inbuf[..take])?;
                                }
                                inbuf.advance(take);
                                *remaining -= take as u64;
                            }
                            *remaining == 0
                        }
                        Framing::Chunked(decoder) => {
                            if internal {
                                decoder.decode(inbuf, &mut |d| {
                                    interim.extend_from_slice(d);
                                    Ok(())
                                })?
                            } else if let Some(entry) = self.inflight.front_mut() {
                                decoder.decode(inbuf, &mut |d| entry.call.store.write(d))?
                            } else {
                                return Err(NetError::BadMessage(
                                    "response without a matching request".into(),
                                ));
                            }
                        }
                        Framing::UntilEof => {
                            if !inbuf.is_empty() {
                                if internal {
                                    interim.extend_from_slice(&inbuf[..]);
                                } else if let Some(entry) = self.inflight.front_mut() {
                                    entry.call.store.write(&inbuf[..])?;
                                }
                                let len = inbuf.len();
                                inbuf.advance(len);
                            }
                            false
                        }
                    };

                    if done {
                        if let Some(exit) =
                            self.complete_response(head, internal, interim, events).await?
                        {
                            return Ok(Some(exit));
                        }
                    } else {
                        self.reading = ReadPhase::Body { head, internal, framing, interim };
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Pops the head of the in-flight queue and dispatches its response.
    async fn complete_response(
        &mut self,
        head: ResponseHead,
        internal: bool,
        interim: BytesMut,
        events: &PipeWriter<ConnEvent>,
    ) -> Result<Option<Exit>, NetError> {
        let mut entry = self.inflight.pop_front().ok_or_else(|| {
            NetError::BadMessage("response without a matching request".into())
        })?;

        if internal {
            entry.call.interim_body = Some(interim.freeze());
        } else {
            entry.call.store.finish()?;
        }
        tracing::debug!(
            conn = self.id,
            status = %head.status,
            method = %entry.method,
            "response complete"
        );
        entry.call.response = Some(head);
        self.served += 1;

        let _ = events
            .write(Some(ConnEvent::Served { conn: self.id, call: entry.call }))
            .await;

        // Drain-then-close: the peer said close, the last in-flight
        // response has now arrived.
        if self.peer_close && self.inflight.is_empty() {
            return Ok(Some(Exit::Graceful));
        }
        Ok(None)
    }

    /// EOF from the server: an until-EOF body completes, anything else
    /// outstanding makes this a crash.
    async fn handle_eof(&mut self, events: &PipeWriter<ConnEvent>) -> Result<Exit, NetError> {
        if matches!(
            self.reading,
            ReadPhase::Body { framing: Framing::UntilEof, .. }
        ) {
            if let ReadPhase::Body { head, internal, interim, .. } =
                std::mem::replace(&mut self.reading, ReadPhase::Head)
            {
                self.complete_response(head, internal, interim, events).await?;
            }
        }
        if self.inflight.is_empty() && self.sendq.is_empty() {
            Ok(Exit::EofClean)
        } else {
            Ok(Exit::EofCrashed)
        }
    }
}

/// Reads a chunk from the active stream body.
async fn read_stream_chunk(
    stream: &mut Option<StreamTx>,
    tmp: &mut [u8],
) -> std::io::Result<usize> {
    match stream.as_mut() {
        Some(tx) => tx.reader.read(tmp).await,
        None => std::future::pending().await,
    }
}

/// Appends stream body bytes to the output, framed per the body plan.
/// An empty read is reader EOF.
fn feed_stream_bytes(
    stream: &mut Option<StreamTx>,
    out: &mut BytesMut,
    data: &[u8],
) -> Result<(), NetError> {
    let Some(tx) = stream.as_mut() else {
        return Ok(());
    };
    if data.is_empty() {
        match tx.remaining {
            None => codec::encode_final_chunk(out),
            Some(0) => {}
            Some(_) => {
                return Err(NetError::BadMessage(
                    "request body ended short of Content-Length".into(),
                ))
            }
        }
        *stream = None;
        return Ok(());
    }
    let mut finished = false;
    match tx.remaining.as_mut() {
        None => codec::encode_chunk(data, out),
        Some(remaining) => {
            let take = (*remaining).min(data.len() as u64) as usize;
            out.extend_from_slice(&data[..take]);
            *remaining -= take as u64;
            finished = *remaining == 0;
        }
    }
    if finished {
        *stream = None;
    }
    Ok(())
}

/// Resolve and connect, each phase bounded by the connection timeout.
async fn establish(
    key: &CacheKey,
    resolver: &Arc<dyn Resolve>,
    connector: &Arc<dyn Connector>,
    timeout: Duration,
) -> Result<BoxTransport, NetError> {
    let addrs: Vec<SocketAddr> = if let Ok(ip) = key.host.parse::<IpAddr>() {
        vec![SocketAddr::new(ip, key.port)]
    } else {
        let resolved =
            tokio::time::timeout(timeout, resolver.resolve(Name::new(key.host.as_str())))
                .await
                .map_err(|_| NetError::NameResolution(key.host.clone()))??;
        resolved.map(|a| SocketAddr::new(a.ip(), key.port)).collect()
    };
    if addrs.is_empty() {
        return Err(NetError::NameResolution(key.host.clone()));
    }

    let mut last = NetError::ConnectionRefused;
    for addr in addrs {
        tracing::debug!(host = %key.host, %addr, "connecting");
        match tokio::time::timeout(timeout, connector.connect(addr, &key.host)).await {
            Ok(Ok(transport)) => return Ok(transport),
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last = e;
            }
            Err(_) => last = NetError::TimedOut,
        }
    }
    Err(last)
}
