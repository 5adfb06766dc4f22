use rhizo_common::endpoint::AddressError;
use rhizo_common::keys::KeyError;
use rhizo_common::session::SessionError;
use rhizo_common::transport::TransportError;
use rhizo_common::wire::CodecError;
use thiserror::Error;

/// Errors that can end a connection or stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening endpoint could not be parsed.
    #[error("invalid endpoint: {0}")]
    Address(#[from] AddressError),
    /// Listener or connection I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Handshake, authorization or record-layer failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    /// A message without a usable header; the session is closed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Key or allowlist file could not be loaded.
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    /// The served directory is unusable.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The handshake did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// No request arrived within the idle timeout.
    #[error("session idle timeout")]
    IdleTimeout,
}
