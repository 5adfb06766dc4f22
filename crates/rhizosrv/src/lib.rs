//! rhizofs server: exports a local directory tree over secure sessions.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Request decoding, locking and routing to the tree.
pub mod dispatch;
/// Error types for server operations.
pub mod error;
/// The backing tree over a host directory.
pub mod local;
/// Path-scoped reader/writer locks.
pub mod locks;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Accept loop and shared server state.
pub mod server;
/// Staged bulk uploads.
pub mod transfer;
/// The backing-tree abstraction and tree-relative paths.
pub mod tree;

pub use local::LocalDir;
pub use server::{run, run_with_shutdown, ServerState};
pub use tree::{BackingTree, TreePath};
