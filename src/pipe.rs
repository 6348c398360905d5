//! Bounded single-process typed pipe.
//!
//! A FIFO of typed messages with an end-of-stream sentinel, safe for
//! cross-thread use. The engine uses one as its internal completion event
//! bus; it is also exported for callers that need worker-thread signalling
//! integrated with the reactor.
//!
//! Readiness is exposed through [`PipeHandle`]s: the read handle becomes
//! ready when a message (or EOF) is available, the write handle when buffer
//! space exists. Handles are stable: every handle obtained from the same
//! endpoint observes the same underlying signal.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::base::NetError;

struct State<T> {
    buf: VecDeque<T>,
    capacity: usize,
    eof: bool,
    error: Option<NetError>,
    closed: bool,
    writers: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    read_ready: Notify,
    write_ready: Notify,
}

impl<T> Shared<T> {
    fn wake_all(&self) {
        self.read_ready.notify_waiters();
        self.write_ready.notify_waiters();
    }
}

/// Creates a bounded pipe with room for `capacity` messages.
///
/// The writer half is cloneable; EOF is signalled implicitly when the last
/// writer is dropped, or explicitly with [`PipeWriter::try_write`]`(None)`.
pub fn pipe<T>(capacity: usize) -> (PipeReader<T>, PipeWriter<T>) {
    assert!(capacity > 0, "pipe capacity must be positive");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            eof: false,
            error: None,
            closed: false,
            writers: 1,
        }),
        read_ready: Notify::new(),
        write_ready: Notify::new(),
    });
    (
        PipeReader { shared: shared.clone() },
        PipeWriter { shared },
    )
}

/// Receiving end of a [`pipe`].
pub struct PipeReader<T> {
    shared: Arc<Shared<T>>,
}

/// Sending end of a [`pipe`].
pub struct PipeWriter<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

/// Stable readiness handle for one side of a pipe.
pub struct PipeHandle<T> {
    shared: Arc<Shared<T>>,
    side: Side,
}

impl<T> PipeReader<T> {
    /// Non-blocking read.
    ///
    /// `Ok(Some(msg))` on data, `Ok(None)` once EOF was signalled and the
    /// buffer is drained (sticky thereafter), `Err(WouldBlock)` when the
    /// buffer is empty but the stream is still open.
    pub fn try_read(&self) -> Result<Option<T>, NetError> {
        let mut st = self.shared.state.lock().unwrap();
        if st.closed {
            return Err(NetError::Closed);
        }
        if let Some(e) = &st.error {
            return Err(e.clone());
        }
        match st.buf.pop_front() {
            Some(v) => {
                drop(st);
                self.shared.write_ready.notify_one();
                Ok(Some(v))
            }
            None if st.eof => Ok(None),
            None => Err(NetError::WouldBlock),
        }
    }

    /// Reads the next message, waiting for one to arrive.
    pub async fn read(&self) -> Result<Option<T>, NetError> {
        loop {
            let notified = self.shared.read_ready.notified();
            match self.try_read() {
                Err(NetError::WouldBlock) => notified.await,
                other => return other,
            }
        }
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether EOF has been signalled (buffered messages may remain).
    pub fn is_eof(&self) -> bool {
        self.shared.state.lock().unwrap().eof
    }

    /// Poisons the pipe: every subsequent operation on either end fails
    /// with `error`.
    pub fn set_error(&self, error: NetError) {
        self.shared.state.lock().unwrap().error = Some(error);
        self.shared.wake_all();
    }

    /// Tears the pipe down; every subsequent operation fails with `Closed`.
    pub fn close(&self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.wake_all();
    }

    /// Readiness handle: ready when a message or EOF is observable.
    pub fn handle(&self) -> PipeHandle<T> {
        PipeHandle { shared: self.shared.clone(), side: Side::Read }
    }
}

/// Error of [`PipeWriter::try_write`]: carries the failure and hands the
/// rejected message back to the caller.
#[derive(Debug)]
pub struct TryWriteError<T> {
    pub error: NetError,
    pub rejected: Option<T>,
}

impl<T> PipeWriter<T> {
    /// Non-blocking write. `Some(msg)` enqueues a message, `None` signals
    /// EOF. Fails with `WouldBlock` when the buffer is full (the message is
    /// returned in the error), `BrokenPipe` when EOF was already signalled.
    pub fn try_write(&self, msg: Option<T>) -> Result<(), TryWriteError<T>> {
        let mut st = self.shared.state.lock().unwrap();
        if st.closed {
            return Err(TryWriteError { error: NetError::Closed, rejected: msg });
        }
        if let Some(e) = &st.error {
            return Err(TryWriteError { error: e.clone(), rejected: msg });
        }
        if st.eof {
            return Err(TryWriteError { error: NetError::BrokenPipe, rejected: msg });
        }
        match msg {
            Some(v) => {
                if st.buf.len() >= st.capacity {
                    return Err(TryWriteError {
                        error: NetError::WouldBlock,
                        rejected: Some(v),
                    });
                }
                st.buf.push_back(v);
                drop(st);
                self.shared.read_ready.notify_one();
                Ok(())
            }
            None => {
                st.eof = true;
                drop(st);
                self.shared.read_ready.notify_waiters();
                Ok(())
            }
        }
    }

    /// Writes a message, waiting for buffer space.
    pub async fn write(&self, msg: Option<T>) -> Result<(), NetError> {
        let mut pending = msg;
        loop {
            let notified = self.shared.write_ready.notified();
            match self.try_write(pending) {
                Ok(()) => return Ok(()),
                Err(TryWriteError { error: NetError::WouldBlock, rejected }) => {
                    pending = rejected;
                    notified.await;
                }
                Err(TryWriteError { error, .. }) => return Err(error),
            }
        }
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See [`PipeReader::set_error`].
    pub fn set_error(&self, error: NetError) {
        self.shared.state.lock().unwrap().error = Some(error);
        self.shared.wake_all();
    }

    /// See [`PipeReader::close`].
    pub fn close(&self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.wake_all();
    }

    /// Readiness handle: ready when buffer space is available.
    pub fn handle(&self) -> PipeHandle<T> {
        PipeHandle { shared: self.shared.clone(), side: Side::Write }
    }
}

impl<T> PipeHandle<T> {
    /// Whether the side this handle observes would not block right now.
    pub fn is_ready(&self) -> bool {
        let st = self.shared.state.lock().unwrap();
        if st.closed || st.error.is_some() || st.eof {
            return true;
        }
        match self.side {
            Side::Read => !st.buf.is_empty(),
            Side::Write => st.buf.len() < st.capacity,
        }
    }

    /// Waits until the side is ready. Terminal states (EOF, error, close)
    /// count as ready so pollers observe them.
    pub async fn ready(&self) {
        loop {
            let notified = match self.side {
                Side::Read => self.shared.read_ready.notified(),
                Side::Write => self.shared.write_ready.notified(),
            };
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }
}

impl<T> Clone for PipeHandle<T> {
    fn clone(&self) -> Self {
        PipeHandle { shared: self.shared.clone(), side: self.side }
    }
}

impl<T> Clone for PipeWriter<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().unwrap().writers += 1;
        PipeWriter { shared: self.shared.clone() }
    }
}

impl<T> Drop for PipeWriter<T> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        st.writers -= 1;
        if st.writers == 0 && !st.eof {
            st.eof = true;
            drop(st);
            self.shared.read_ready.notify_waiters();
        }
    }
}

impl<T> Drop for PipeReader<T> {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.wake_all();
    }
}

impl<T> fmt::Debug for PipeReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("PipeReader")
            .field("buffered", &st.buf.len())
            .field("eof", &st.eof)
            .finish()
    }
}

impl<T> fmt::Debug for PipeWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("PipeWriter")
            .field("buffered", &st.buf.len())
            .field("eof", &st.eof)
            .finish()
    }
}
