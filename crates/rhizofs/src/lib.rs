//! rhizofs client: typed filesystem operations against a rhizosrv server.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Typed request methods over one session.
pub mod client;
/// CLI parsing and layered client configuration.
pub mod config;
/// Client error type.
pub mod error;

pub use client::{Client, SetTime};
pub use config::{load_config, ClientConfig};
pub use error::ClientError;
