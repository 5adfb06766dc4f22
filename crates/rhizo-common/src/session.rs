//! Secure session over a framed connection.
//!
//! A session moves through
//! `Disconnected → Connecting → Handshaking → Established → Closed`.
//! The client opens with one of three frames:
//!
//! - `HELLO_PLAINTEXT`: no encryption; the server answers `ACCEPTED`
//! - `HANDSHAKE_INIT_IK`: Noise IK, the client proves its static key and
//!   carries its Ed25519 identity in the encrypted payload
//! - `HANDSHAKE_INIT_NK`: Noise NK, the client stays anonymous
//!
//! The server either answers with `HANDSHAKE_RESP` (or `ACCEPTED`) or with
//! `REJECTED` plus a reason byte, then closes. No application message is
//! exchanged before the session is established.
//!
//! Application messages are split into records of at most
//! [`MAX_RECORD_PAYLOAD`] bytes. Each record starts with a continuation
//! flag, which is encrypted along with the data in encrypted sessions.

use crate::auth::{AuthorizationPolicy, Decision};
use crate::endpoint::Endpoint;
use crate::keys::{KeyError, KeyPair, PublicKey};
use crate::transport::{Connection, TransportContext, TransportError};
use crate::types::MAX_MESSAGE_SIZE;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const NOISE_IK: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";
const NOISE_NK: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// Default time allowed for a complete handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum Noise message size (snow limitation).
const MAX_NOISE_MSG: usize = 65535;

/// AEAD tag overhead per encrypted message.
const TAG_LEN: usize = 16;

/// Application bytes carried by one record.
pub const MAX_RECORD_PAYLOAD: usize = MAX_NOISE_MSG - TAG_LEN - 1;

/// First byte of every frame on the wire.
pub mod prefix {
    /// Client → server: open an unencrypted session.
    pub const HELLO_PLAINTEXT: u8 = 0x10;
    /// Client → server: Noise IK message 1.
    pub const HANDSHAKE_INIT_IK: u8 = 0x11;
    /// Client → server: Noise NK message 1.
    pub const HANDSHAKE_INIT_NK: u8 = 0x12;
    /// Server → client: Noise message 2.
    pub const HANDSHAKE_RESP: u8 = 0x13;
    /// Server → client: plaintext session accepted.
    pub const ACCEPTED: u8 = 0x14;
    /// Server → client: handshake refused; one reason byte follows.
    pub const REJECTED: u8 = 0x15;
    /// Established plaintext record.
    pub const PLAINTEXT: u8 = 0x20;
    /// Established encrypted record.
    pub const ENCRYPTED: u8 = 0x21;
}

/// Reason codes carried in `REJECTED` frames.
pub mod rejection_reason {
    /// The client's key is not on the allowlist, or it presented none.
    pub const NOT_AUTHORIZED: u8 = 0x01;
    /// The server only accepts encrypted sessions.
    pub const ENCRYPTION_REQUIRED: u8 = 0x02;
    /// The server has no key pair and cannot encrypt.
    pub const ENCRYPTION_UNAVAILABLE: u8 = 0x03;
    /// The opening frame could not be processed.
    pub const MALFORMED: u8 = 0x04;
}

const RECORD_FINAL: u8 = 0x00;
const RECORD_MORE: u8 = 0x01;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing opened yet.
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Transport is up; handshake frames are being exchanged.
    Handshaking,
    /// Requests and responses may flow.
    Established,
    /// Terminal. The caller must open a new session.
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Handshaking)
                | (Self::Handshaking, Self::Established)
                | (Self::Disconnected | Self::Connecting | Self::Handshaking | Self::Established, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Failures before a session is established. Always fatal to the session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The server refused the client's key (or lack of one).
    #[error("authorization denied")]
    AuthorizationDenied,
    /// Plaintext hello sent to a server that requires encryption.
    #[error("server requires an encrypted session")]
    EncryptionRequired,
    /// Encrypted handshake sent to a server without a key pair.
    #[error("server does not offer encryption")]
    EncryptionUnavailable,
    /// The server rejected the handshake for another reason.
    #[error("handshake rejected (reason {0:#04x})")]
    Rejected(u8),
    /// Noise protocol failure: wrong server key, corrupt message, ...
    #[error("noise: {0}")]
    Noise(#[from] snow::Error),
    /// The identity in the IK payload does not own the presented static key.
    #[error("peer identity does not match its static key")]
    IdentityMismatch,
    /// Frame with an unexpected prefix during the handshake.
    #[error("unexpected handshake frame {0:#04x}")]
    UnexpectedFrame(u8),
    /// The peer closed the connection mid-handshake.
    #[error("connection closed during handshake")]
    ConnectionClosed,
    /// Handshake did not finish in time.
    #[error("handshake timed out")]
    Timeout,
    /// Encryption is enabled but no server key pair was configured.
    #[error("encryption requires a server key pair")]
    MissingKeyPair,
    /// A configured key is not usable.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Any failure of a session: at handshake time or afterwards.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection-level I/O.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Handshake or authorization failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// A record failed authentication; the session is unusable.
    #[error("record failed authentication")]
    Decrypt,
    /// A record was structurally invalid.
    #[error("malformed record: {0}")]
    Malformed(&'static str),
    /// Reassembled message exceeds the limit.
    #[error("message too large: max {max}, got {actual}")]
    MessageTooLarge {
        /// Limit in bytes.
        max: usize,
        /// Bytes received so far.
        actual: usize,
    },
    /// The session was already closed.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// True for the distinct allowlist rejection outcome.
    #[must_use]
    pub const fn is_authorization_denied(&self) -> bool {
        matches!(self, Self::Handshake(HandshakeError::AuthorizationDenied))
    }
}

/// Client-side security settings.
#[derive(Debug, Clone, Default)]
pub struct ClientSecurity {
    /// Expected server key. `Some` enables encryption.
    pub server_key: Option<PublicKey>,
    /// Own key pair for mutual authentication; `None` stays anonymous.
    pub keypair: Option<KeyPair>,
    /// Deadline for connect plus handshake.
    pub handshake_timeout: Option<Duration>,
}

/// Server-side security settings.
#[derive(Debug, Clone)]
pub struct ServerSecurity {
    encrypt: bool,
    keypair: Option<KeyPair>,
    policy: Arc<dyn AuthorizationPolicy>,
}

impl ServerSecurity {
    /// Plaintext sessions only; no identity checks.
    #[must_use]
    pub fn plaintext() -> Self {
        Self {
            encrypt: false,
            keypair: None,
            policy: Arc::new(crate::auth::AllowAll),
        }
    }

    /// Encrypted sessions only, authorized by `policy`.
    #[must_use]
    pub fn encrypted(keypair: KeyPair, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Self {
            encrypt: true,
            keypair: Some(keypair),
            policy,
        }
    }

    /// Whether sessions are encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// The server's public key, when encrypting.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.keypair.as_ref().map(KeyPair::public)
    }
}

/// An established session.
pub struct Session {
    conn: Connection,
    cipher: Option<TransportState>,
    state: SessionState,
    peer_key: Option<PublicKey>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.conn.peer())
            .field("state", &self.state)
            .field("encrypted", &self.cipher.is_some())
            .field("peer_key", &self.peer_key)
            .finish()
    }
}

fn frame(prefix: u8, body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(1 + body.len());
    framed.push(prefix);
    framed.extend_from_slice(body);
    framed
}

fn advance(state: &mut SessionState, next: SessionState, peer: &str) {
    debug_assert!(state.can_transition(next), "{state} -> {next}");
    debug!(peer, from = %state, to = %next, "session state");
    *state = next;
}

impl Session {
    /// Connects to `endpoint` and runs the client side of the handshake.
    ///
    /// # Errors
    ///
    /// [`SessionError::Transport`] if the connection fails, otherwise
    /// [`SessionError::Handshake`]; authorization refusal is
    /// [`HandshakeError::AuthorizationDenied`].
    pub async fn connect(
        ctx: &TransportContext,
        endpoint: &Endpoint,
        security: &ClientSecurity,
    ) -> Result<Self, SessionError> {
        let deadline = security.handshake_timeout.unwrap_or(HANDSHAKE_TIMEOUT);
        tokio::time::timeout(deadline, async {
            let mut state = SessionState::Disconnected;
            advance(&mut state, SessionState::Connecting, &endpoint.to_string());
            let conn = ctx.connect(endpoint).await?;
            Self::initiate(conn, security).await
        })
        .await
        .map_err(|_| SessionError::Handshake(HandshakeError::Timeout))?
    }

    /// Runs the client side of the handshake over an open connection.
    ///
    /// # Errors
    ///
    /// As for [`connect`](Self::connect), without the connect step.
    pub async fn initiate(mut conn: Connection, security: &ClientSecurity) -> Result<Self, SessionError> {
        let mut state = SessionState::Connecting;
        advance(&mut state, SessionState::Handshaking, conn.peer());

        let Some(server_key) = security.server_key else {
            conn.send_frame(vec![prefix::HELLO_PLAINTEXT]).await?;
            let reply = recv_handshake_frame(&mut conn).await?;
            return match reply.split_first() {
                Some((&prefix::ACCEPTED, _)) => Ok(Self::established(conn, None, None, state)),
                Some((&prefix::REJECTED, reason)) => Err(rejection(reason).into()),
                Some((&other, _)) => Err(HandshakeError::UnexpectedFrame(other).into()),
                None => Err(SessionError::Malformed("empty frame")),
            };
        };

        let remote_static = server_key.to_x25519().map_err(HandshakeError::from)?;
        let (mut hs, init_prefix, payload) = match &security.keypair {
            Some(pair) => {
                let local = pair.noise_keypair();
                let hs = Builder::new(noise_params(NOISE_IK)?)
                    .local_private_key(&local.private)
                    .remote_public_key(&remote_static)
                    .build_initiator()
                    .map_err(HandshakeError::from)?;
                (hs, prefix::HANDSHAKE_INIT_IK, pair.public().as_bytes().to_vec())
            }
            None => {
                let hs = Builder::new(noise_params(NOISE_NK)?)
                    .remote_public_key(&remote_static)
                    .build_initiator()
                    .map_err(HandshakeError::from)?;
                (hs, prefix::HANDSHAKE_INIT_NK, Vec::new())
            }
        };

        // IK msg1: → e, es, s, ss   NK msg1: → e, es
        let mut buf = vec![0u8; MAX_NOISE_MSG];
        let len = hs.write_message(&payload, &mut buf).map_err(HandshakeError::from)?;
        conn.send_frame(frame(init_prefix, &buf[..len])).await?;

        let reply = recv_handshake_frame(&mut conn).await?;
        match reply.split_first() {
            Some((&prefix::HANDSHAKE_RESP, body)) => {
                // msg2: ← e, ee, (se)
                let mut scratch = vec![0u8; body.len()];
                hs.read_message(body, &mut scratch).map_err(HandshakeError::from)?;
                let transport = hs.into_transport_mode().map_err(HandshakeError::from)?;
                Ok(Self::established(conn, Some(transport), Some(server_key), state))
            }
            Some((&prefix::REJECTED, reason)) => Err(rejection(reason).into()),
            Some((&other, _)) => Err(HandshakeError::UnexpectedFrame(other).into()),
            None => Err(SessionError::Malformed("empty frame")),
        }
    }

    /// Runs the server side of the handshake over an accepted connection.
    ///
    /// On refusal a `REJECTED` frame is sent and the connection is closed.
    /// The caller is expected to bound this with a timeout.
    ///
    /// # Errors
    ///
    /// [`SessionError::Handshake`] for any refusal or protocol failure.
    pub async fn accept(mut conn: Connection, security: &ServerSecurity) -> Result<Self, SessionError> {
        let mut state = SessionState::Connecting;
        advance(&mut state, SessionState::Handshaking, conn.peer());

        let opening = recv_handshake_frame(&mut conn).await?;
        let Some((&kind, body)) = opening.split_first() else {
            return Err(reject(conn, rejection_reason::MALFORMED, SessionError::Malformed("empty frame")).await);
        };

        match kind {
            prefix::HELLO_PLAINTEXT if security.encrypt => {
                Err(reject(conn, rejection_reason::ENCRYPTION_REQUIRED, HandshakeError::EncryptionRequired.into()).await)
            }
            prefix::HELLO_PLAINTEXT => {
                conn.send_frame(vec![prefix::ACCEPTED]).await?;
                Ok(Self::established(conn, None, None, state))
            }
            prefix::HANDSHAKE_INIT_IK | prefix::HANDSHAKE_INIT_NK if !security.encrypt => {
                Err(reject(conn, rejection_reason::ENCRYPTION_UNAVAILABLE, HandshakeError::EncryptionUnavailable.into()).await)
            }
            prefix::HANDSHAKE_INIT_IK | prefix::HANDSHAKE_INIT_NK => {
                let Some(pair) = &security.keypair else {
                    return Err(reject(conn, rejection_reason::ENCRYPTION_UNAVAILABLE, HandshakeError::MissingKeyPair.into()).await);
                };
                let mut hs = match responder(pair, kind == prefix::HANDSHAKE_INIT_IK) {
                    Ok(hs) => hs,
                    Err(e) => return Err(reject(conn, rejection_reason::MALFORMED, e.into()).await),
                };
                let peer_key = match read_init(&mut hs, body, kind == prefix::HANDSHAKE_INIT_IK) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(peer = conn.peer(), error = %e, "handshake failed");
                        return Err(reject(conn, rejection_reason::MALFORMED, e.into()).await);
                    }
                };

                if security.policy.authorize(peer_key.as_ref()) == Decision::Reject {
                    info!(
                        peer = conn.peer(),
                        key = %peer_key.map_or_else(|| "<anonymous>".to_string(), |k| k.to_string()),
                        "peer not authorized"
                    );
                    return Err(reject(conn, rejection_reason::NOT_AUTHORIZED, HandshakeError::AuthorizationDenied.into()).await);
                }

                let mut buf = vec![0u8; MAX_NOISE_MSG];
                let len = hs.write_message(&[], &mut buf).map_err(HandshakeError::from)?;
                conn.send_frame(frame(prefix::HANDSHAKE_RESP, &buf[..len])).await?;
                let transport = hs.into_transport_mode().map_err(HandshakeError::from)?;
                Ok(Self::established(conn, Some(transport), peer_key, state))
            }
            other => Err(reject(conn, rejection_reason::MALFORMED, HandshakeError::UnexpectedFrame(other).into()).await),
        }
    }

    fn established(
        conn: Connection,
        cipher: Option<TransportState>,
        peer_key: Option<PublicKey>,
        mut state: SessionState,
    ) -> Self {
        advance(&mut state, SessionState::Established, conn.peer());
        Self {
            conn,
            cipher,
            state,
            peer_key,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether records are encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// The authenticated key of the other side: the client's key on the
    /// server, the server's key on the client. `None` if anonymous or
    /// plaintext.
    #[must_use]
    pub const fn peer_key(&self) -> Option<&PublicKey> {
        self.peer_key.as_ref()
    }

    /// Transport-level peer address, for logs.
    #[must_use]
    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        if self.state != SessionState::Closed {
            let peer = self.conn.peer().to_string();
            advance(&mut self.state, SessionState::Closed, &peer);
        }
        err
    }

    /// Sends one application message.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on transport or encryption failure, after
    /// which the session is closed.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), SessionError> {
        if self.state != SessionState::Established {
            return Err(SessionError::Closed);
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(SessionError::MessageTooLarge {
                max: MAX_MESSAGE_SIZE,
                actual: message.len(),
            });
        }

        let mut chunks: Vec<&[u8]> = message.chunks(MAX_RECORD_PAYLOAD).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let flag = if i < last { RECORD_MORE } else { RECORD_FINAL };
            let mut record = Vec::with_capacity(1 + chunk.len());
            record.push(flag);
            record.extend_from_slice(chunk);

            let framed = match &mut self.cipher {
                Some(transport) => {
                    let mut buf = vec![0u8; record.len() + TAG_LEN];
                    match transport.write_message(&record, &mut buf) {
                        Ok(len) => frame(prefix::ENCRYPTED, &buf[..len]),
                        Err(e) => {
                            warn!(error = %e, "failed to encrypt record");
                            return Err(self.fail(SessionError::Decrypt));
                        }
                    }
                }
                None => frame(prefix::PLAINTEXT, &record),
            };
            if let Err(e) = self.conn.send_frame(framed).await {
                return Err(self.fail(e.into()));
            }
        }
        Ok(())
    }

    /// Receives one application message; `Ok(None)` on clean close between
    /// messages.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on transport failure, tampering, malformed
    /// records or an oversized message, after which the session is closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        if self.state != SessionState::Established {
            return Err(SessionError::Closed);
        }
        let mut message = Vec::new();
        loop {
            let frame = match self.conn.recv_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) if message.is_empty() => {
                    let _ = self.fail(SessionError::Closed);
                    return Ok(None);
                }
                Ok(None) => return Err(self.fail(SessionError::Malformed("eof inside message"))),
                Err(e) => return Err(self.fail(e.into())),
            };

            let record = match (frame.split_first(), &mut self.cipher) {
                (Some((&prefix::ENCRYPTED, body)), Some(transport)) => {
                    let mut buf = vec![0u8; body.len()];
                    match transport.read_message(body, &mut buf) {
                        Ok(len) => {
                            buf.truncate(len);
                            buf
                        }
                        Err(_) => return Err(self.fail(SessionError::Decrypt)),
                    }
                }
                (Some((&prefix::PLAINTEXT, body)), None) => body.to_vec(),
                _ => return Err(self.fail(SessionError::Malformed("unexpected record type"))),
            };

            let Some((&flag, data)) = record.split_first() else {
                return Err(self.fail(SessionError::Malformed("empty record")));
            };
            if message.len() + data.len() > MAX_MESSAGE_SIZE {
                return Err(self.fail(SessionError::MessageTooLarge {
                    max: MAX_MESSAGE_SIZE,
                    actual: message.len() + data.len(),
                }));
            }
            message.extend_from_slice(data);
            match flag {
                RECORD_FINAL => return Ok(Some(message)),
                RECORD_MORE => {}
                _ => return Err(self.fail(SessionError::Malformed("bad record flag"))),
            }
        }
    }

    /// Closes the session and the underlying connection.
    pub async fn close(&mut self) {
        if self.state != SessionState::Closed {
            let peer = self.conn.peer().to_string();
            advance(&mut self.state, SessionState::Closed, &peer);
        }
        self.conn.shutdown().await;
    }
}

fn noise_params(pattern: &str) -> Result<NoiseParams, HandshakeError> {
    Ok(pattern.parse()?)
}

fn responder(pair: &KeyPair, ik: bool) -> Result<HandshakeState, HandshakeError> {
    let local = pair.noise_keypair();
    let params = noise_params(if ik { NOISE_IK } else { NOISE_NK })?;
    Ok(Builder::new(params)
        .local_private_key(&local.private)
        .build_responder()?)
}

/// Reads message 1 and returns the proven client identity for IK.
fn read_init(
    hs: &mut HandshakeState,
    body: &[u8],
    ik: bool,
) -> Result<Option<PublicKey>, HandshakeError> {
    let mut payload = vec![0u8; body.len()];
    let len = hs.read_message(body, &mut payload)?;
    if !ik {
        return Ok(None);
    }
    let claimed: [u8; 32] = payload[..len]
        .try_into()
        .map_err(|_| HandshakeError::IdentityMismatch)?;
    let claimed = PublicKey::from_bytes(&claimed)?;
    let presented = hs.get_remote_static().ok_or(HandshakeError::IdentityMismatch)?;
    if claimed.to_x25519()?[..] != *presented {
        return Err(HandshakeError::IdentityMismatch);
    }
    Ok(Some(claimed))
}

async fn recv_handshake_frame(conn: &mut Connection) -> Result<Vec<u8>, SessionError> {
    match conn.recv_frame().await? {
        Some(frame) => Ok(frame.to_vec()),
        None => Err(HandshakeError::ConnectionClosed.into()),
    }
}

async fn reject(mut conn: Connection, reason: u8, err: SessionError) -> SessionError {
    if let Err(e) = conn.send_frame(vec![prefix::REJECTED, reason]).await {
        debug!(peer = conn.peer(), error = %e, "could not deliver rejection");
    }
    conn.shutdown().await;
    err
}

fn rejection(reason: &[u8]) -> HandshakeError {
    match reason.first().copied() {
        Some(rejection_reason::NOT_AUTHORIZED) => HandshakeError::AuthorizationDenied,
        Some(rejection_reason::ENCRYPTION_REQUIRED) => HandshakeError::EncryptionRequired,
        Some(rejection_reason::ENCRYPTION_UNAVAILABLE) => HandshakeError::EncryptionUnavailable,
        Some(other) => HandshakeError::Rejected(other),
        None => HandshakeError::Rejected(0),
    }
}
