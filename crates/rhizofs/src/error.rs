use rhizo_common::endpoint::AddressError;
use rhizo_common::keys::KeyError;
use rhizo_common::session::SessionError;
use rhizo_common::types::{Errno, OperationError};
use rhizo_common::wire::{CodecError, Operation};
use thiserror::Error;

/// Errors returned by [`Client`](crate::Client) calls.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connect, handshake or record-layer failure. Authorization refusal
    /// is reported here as `HandshakeError::AuthorizationDenied`.
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    /// The server's reply could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The server answered with an errno.
    #[error("{op}: {source}")]
    Operation {
        /// The operation that failed.
        op: Operation,
        /// Errno and message.
        #[source]
        source: OperationError,
    },
    /// A response carried another request's sequence number.
    #[error("response sequence {actual} does not match request {expected}")]
    SequenceMismatch {
        /// Sequence number sent.
        expected: u64,
        /// Sequence number received.
        actual: u64,
    },
    /// The server closed the session or answered with the wrong shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    /// Local I/O during upload or download.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Client configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// The errno of a failed operation, if that is what this is.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Operation { source, .. } => Some(source.errno),
            _ => None,
        }
    }

    /// True when the server refused this client's key.
    #[must_use]
    pub const fn is_authorization_denied(&self) -> bool {
        match self {
            Self::Session(e) => e.is_authorization_denied(),
            _ => false,
        }
    }
}

impl From<AddressError> for ClientError {
    fn from(e: AddressError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<KeyError> for ClientError {
    fn from(e: KeyError) -> Self {
        Self::Config(e.to_string())
    }
}
