//! Common types and utilities shared by the rhizofs client and server.
//!
//! This crate provides:
//! - Endpoint addressing for `ipc`, `tcp` and `vmci` ([`endpoint`])
//! - The binary request/response codec ([`wire`])
//! - Protocol type definitions, error classes and constants ([`types`])
//! - Key files and allowlists ([`keys`], [`base58`])
//! - Framed connections and listeners ([`transport`])
//! - Noise secure sessions with pluggable authorization ([`session`], [`auth`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod base58;
pub mod endpoint;
pub mod keys;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

pub use auth::{AuthorizationPolicy, Decision};
pub use endpoint::Endpoint;
pub use keys::{AuthorizedKeySet, KeyPair, PublicKey};
pub use session::{ClientSecurity, ServerSecurity, Session, SessionError};
pub use transport::TransportContext;
pub use types::{Errno, OperationError};
pub use wire::{Operation, Request, Response};
