//! Connection factory for `ipc`, `tcp` and `vmci` endpoints.
//!
//! [`TransportContext`] is owned by whoever creates connections and
//! listeners. Nothing here is process-global: close sessions first, then
//! call [`TransportContext::close`], which makes every listener created
//! from the context stop accepting.

use crate::endpoint::{Endpoint, WILDCARD};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Default upper bound on one transport frame: one Noise record plus its
/// prefix byte.
pub const DEFAULT_MAX_FRAME: usize = 1 + 65_535;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-level failures. Fatal to the session that hit them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed.
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
    /// Connect did not complete within the configured timeout.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    /// The scheme is recognised but not compiled into this build.
    #[error("{0} transport is not supported in this build")]
    Unsupported(&'static str),
    /// The owning context has been closed.
    #[error("transport context closed")]
    ContextClosed,
    /// The address cannot be used for this direction (e.g. connecting to `*`).
    #[error("cannot connect to wildcard address {0}")]
    WildcardConnect(String),
}

/// Byte stream a connection runs over.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Explicitly owned factory for connections and listeners.
#[derive(Debug)]
pub struct TransportContext {
    connect_timeout: Duration,
    max_frame: usize,
    closed: watch::Sender<bool>,
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportContext {
    /// A context with default timeouts and frame limit.
    #[must_use]
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame: DEFAULT_MAX_FRAME,
            closed,
        }
    }

    /// Overrides the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the maximum frame size.
    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Stops every listener created from this context. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn framed(&self, stream: Box<dyn RawStream>) -> Framed<Box<dyn RawStream>, LengthDelimitedCodec> {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(self.max_frame)
            .new_codec();
        Framed::new(stream, codec)
    }

    /// Opens a connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the context is closed, the endpoint is
    /// a wildcard, or the connect fails or times out.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ContextClosed);
        }
        let label = endpoint.to_string();
        let stream = tokio::time::timeout(self.connect_timeout, open_stream(endpoint))
            .await
            .map_err(|_| TransportError::ConnectTimeout(label.clone()))??;
        debug!(endpoint = %label, "connected");
        Ok(Connection {
            framed: self.framed(stream),
            peer: label,
        })
    }

    /// Binds a listener on `endpoint`.
    ///
    /// For `ipc`, a stale socket file at the path is removed first and the
    /// file is removed again when the listener is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the context is closed or binding fails.
    pub async fn bind(&self, endpoint: &Endpoint) -> Result<Listener, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ContextClosed);
        }
        let inner = match endpoint {
            Endpoint::Tcp { host, port } => {
                let host = if host == WILDCARD { "0.0.0.0" } else { host.as_str() };
                ListenerInner::Tcp(TcpListener::bind((host, *port)).await?)
            }
            Endpoint::Ipc { path } => {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "removed stale ipc socket"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                ListenerInner::Ipc(UnixListener::bind(path)?, path.clone())
            }
            Endpoint::Vmci { cid, port } => bind_vmci(*cid, *port)?,
        };
        let listener = Listener {
            inner,
            closed: self.closed.subscribe(),
            max_frame: self.max_frame,
        };
        debug!(endpoint = %listener.local_endpoint(), "listening");
        Ok(listener)
    }
}

async fn open_stream(endpoint: &Endpoint) -> Result<Box<dyn RawStream>, TransportError> {
    match endpoint {
        Endpoint::Tcp { host, .. } if host == WILDCARD => {
            Err(TransportError::WildcardConnect(endpoint.to_string()))
        }
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Endpoint::Ipc { path } => Ok(Box::new(UnixStream::connect(path).await?)),
        Endpoint::Vmci { cid: None, .. } => Err(TransportError::WildcardConnect(endpoint.to_string())),
        Endpoint::Vmci { cid: Some(cid), port } => connect_vmci(*cid, *port).await,
    }
}

#[cfg(feature = "vmci")]
async fn connect_vmci(cid: u32, port: u32) -> Result<Box<dyn RawStream>, TransportError> {
    let stream = tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(cid, port)).await?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "vmci"))]
async fn connect_vmci(_cid: u32, _port: u32) -> Result<Box<dyn RawStream>, TransportError> {
    Err(TransportError::Unsupported("vmci"))
}

#[cfg(feature = "vmci")]
fn bind_vmci(cid: Option<u32>, port: u32) -> Result<ListenerInner, TransportError> {
    let cid = cid.unwrap_or(tokio_vsock::VMADDR_CID_ANY);
    let listener = tokio_vsock::VsockListener::bind(tokio_vsock::VsockAddr::new(cid, port))?;
    Ok(ListenerInner::Vmci(listener, cid, port))
}

#[cfg(not(feature = "vmci"))]
fn bind_vmci(_cid: Option<u32>, _port: u32) -> Result<ListenerInner, TransportError> {
    Err(TransportError::Unsupported("vmci"))
}

enum ListenerInner {
    Tcp(TcpListener),
    Ipc(UnixListener, PathBuf),
    #[cfg(feature = "vmci")]
    Vmci(tokio_vsock::VsockListener, u32, u32),
}

/// A bound server socket.
pub struct Listener {
    inner: ListenerInner,
    closed: watch::Receiver<bool>,
    max_frame: usize,
}

impl Listener {
    /// The endpoint actually bound, with ephemeral ports resolved.
    #[must_use]
    pub fn local_endpoint(&self) -> Endpoint {
        match &self.inner {
            ListenerInner::Tcp(l) => match l.local_addr() {
                Ok(addr) => Endpoint::tcp(addr),
                Err(_) => Endpoint::Tcp {
                    host: WILDCARD.to_string(),
                    port: 0,
                },
            },
            ListenerInner::Ipc(_, path) => Endpoint::ipc(path.clone()),
            #[cfg(feature = "vmci")]
            ListenerInner::Vmci(_, cid, port) => Endpoint::Vmci {
                cid: Some(*cid),
                port: *port,
            },
        }
    }

    /// Waits for the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ContextClosed`] once the owning context is
    /// closed, or [`TransportError::Io`] if accept fails.
    pub async fn accept(&mut self) -> Result<Connection, TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::ContextClosed);
        }
        let mut closed = self.closed.clone();
        let (stream, peer): (Box<dyn RawStream>, String) = tokio::select! {
            accepted = accept_inner(&self.inner) => accepted?,
            () = wait_closed(&mut closed) => return Err(TransportError::ContextClosed),
        };
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(self.max_frame)
            .new_codec();
        Ok(Connection {
            framed: Framed::new(stream, codec),
            peer,
        })
    }
}

/// Resolves once the context is closed. A dropped context never closes
/// its listeners.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    if closed.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn accept_inner(inner: &ListenerInner) -> Result<(Box<dyn RawStream>, String), TransportError> {
    match inner {
        ListenerInner::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream), addr.to_string()))
        }
        ListenerInner::Ipc(l, path) => {
            let (stream, _) = l.accept().await?;
            Ok((Box::new(stream), format!("ipc:{}", path.display())))
        }
        #[cfg(feature = "vmci")]
        ListenerInner::Vmci(l, _, _) => {
            let (stream, addr) = l.accept().await?;
            Ok((Box::new(stream), format!("vmci:{}:{}", addr.cid(), addr.port())))
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenerInner::Ipc(_, path) = &self.inner {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove ipc socket");
                }
            }
        }
    }
}

/// A framed, unauthenticated byte connection.
///
/// Each frame is a 4-byte big-endian length followed by the body.
pub struct Connection {
    framed: Framed<Box<dyn RawStream>, LengthDelimitedCodec>,
    peer: String,
}

impl Connection {
    /// Wraps an already-open stream, e.g. one half of `tokio::io::duplex`.
    pub fn from_stream(stream: impl RawStream + 'static, peer: impl Into<String>) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(DEFAULT_MAX_FRAME)
            .new_codec();
        Self {
            framed: Framed::new(Box::new(stream), codec),
            peer: peer.into(),
        }
    }

    /// Human-readable peer address, for logs.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] on write failure or if the frame
    /// exceeds the configured maximum.
    pub async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.framed.send(Bytes::from(frame)).await?;
        Ok(())
    }

    /// Receives one frame; `Ok(None)` on clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] on read failure or an oversized
    /// length prefix.
    pub async fn recv_frame(&mut self) -> Result<Option<BytesMut>, TransportError> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// Flushes and shuts down the write half.
    pub async fn shutdown(&mut self) {
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            debug!(peer = %self.peer, error = %e, "error closing connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
