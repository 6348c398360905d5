//! Request bodies and response body storage.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;

use crate::base::NetError;

/// Body of an outgoing request.
///
/// `Bytes` bodies are replayable and survive reconnects and redirects;
/// `Stream` bodies are consumed on first transmission and cannot be resent.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        /// Announced length; `None` switches the transfer to chunked coding.
        length: Option<u64>,
    },
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Bytes(b) => b.is_empty(),
            RequestBody::Stream { .. } => false,
        }
    }

    /// Announced length, `None` when unknown.
    pub fn length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Stream { length, .. } => *length,
        }
    }

    /// Whether this body can be transmitted more than once.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream { .. })
    }

    /// A second transmission of the same payload, when the body permits it.
    pub(crate) fn try_clone_payload(&self) -> Option<RequestBody> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Bytes(b) => Some(RequestBody::Bytes(b.clone())),
            RequestBody::Stream { .. } => None,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Empty
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("RequestBody::Empty"),
            RequestBody::Bytes(b) => write!(f, "RequestBody::Bytes({} bytes)", b.len()),
            RequestBody::Stream { length, .. } => {
                write!(f, "RequestBody::Stream(length {:?})", length)
            }
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Bytes(b)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Bytes(Bytes::from(s.to_owned()))
    }
}

type PathFn = Box<dyn FnMut() -> PathBuf + Send>;
type SinkFn = Box<dyn FnOnce() -> Box<dyn Write + Send> + Send>;

/// Destination for a response body, chosen per call before `add`.
pub enum ResponseStore {
    Memory(BytesMut),
    File {
        path_fn: PathFn,
        open: Option<(PathBuf, std::fs::File)>,
    },
    Sink {
        open_fn: Option<SinkFn>,
        sink: Option<Box<dyn Write + Send>>,
    },
}

impl ResponseStore {
    /// Buffers the body in memory.
    pub fn memory() -> Self {
        ResponseStore::Memory(BytesMut::new())
    }

    /// Streams the body into a file; `path_fn` is invoked once when the
    /// final response starts.
    pub fn file(path_fn: impl FnMut() -> PathBuf + Send + 'static) -> Self {
        ResponseStore::File { path_fn: Box::new(path_fn), open: None }
    }

    /// Streams the body into a caller-supplied writer, acquired once.
    pub fn sink(open_fn: impl FnOnce() -> Box<dyn Write + Send> + Send + 'static) -> Self {
        ResponseStore::Sink { open_fn: Some(Box::new(open_fn)), sink: None }
    }

    /// Opens the backing target. Called once, when the response this store
    /// will keep starts arriving.
    pub(crate) fn begin(&mut self) -> Result<(), NetError> {
        match self {
            ResponseStore::Memory(buf) => {
                buf.clear();
                Ok(())
            }
            ResponseStore::File { path_fn, open } => {
                if open.is_none() {
                    let path = path_fn();
                    let file = std::fs::File::create(&path).map_err(NetError::from)?;
                    *open = Some((path, file));
                }
                Ok(())
            }
            ResponseStore::Sink { open_fn, sink } => {
                if sink.is_none() {
                    let f = open_fn.take().ok_or(NetError::Closed)?;
                    *sink = Some(f());
                }
                Ok(())
            }
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), NetError> {
        match self {
            ResponseStore::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            ResponseStore::File { open, .. } => match open {
                Some((_, file)) => file.write_all(data).map_err(NetError::from),
                None => Err(NetError::Closed),
            },
            ResponseStore::Sink { sink, .. } => match sink {
                Some(w) => w.write_all(data).map_err(NetError::from),
                None => Err(NetError::Closed),
            },
        }
    }

    pub(crate) fn finish(&mut self) -> Result<(), NetError> {
        match self {
            ResponseStore::Memory(_) => Ok(()),
            ResponseStore::File { open, .. } => match open {
                Some((_, file)) => file.flush().map_err(NetError::from),
                None => Ok(()),
            },
            ResponseStore::Sink { sink, .. } => match sink {
                Some(w) => w.flush().map_err(NetError::from),
                None => Ok(()),
            },
        }
    }

    /// Discards partially written data before a retransmission. Sink
    /// stores cannot take data back; their writer simply receives the
    /// retried response after the partial one.
    pub(crate) fn reset_for_retry(&mut self) {
        match self {
            ResponseStore::Memory(buf) => buf.clear(),
            ResponseStore::File { open, .. } => *open = None,
            ResponseStore::Sink { .. } => {}
        }
    }

    /// Buffered body bytes, for memory stores.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ResponseStore::Memory(buf) => Some(buf),
            _ => None,
        }
    }

    /// Path of the file store, once opened.
    pub fn file_path(&self) -> Option<&PathBuf> {
        match self {
            ResponseStore::File { open: Some((path, _)), .. } => Some(path),
            _ => None,
        }
    }
}

impl Default for ResponseStore {
    fn default() -> Self {
        ResponseStore::memory()
    }
}

impl fmt::Debug for ResponseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStore::Memory(buf) => write!(f, "ResponseStore::Memory({} bytes)", buf.len()),
            ResponseStore::File { open, .. } => {
                write!(f, "ResponseStore::File({:?})", open.as_ref().map(|(p, _)| p))
            }
            ResponseStore::Sink { sink, .. } => {
                write!(f, "ResponseStore::Sink(open: {})", sink.is_some())
            }
        }
    }
}
