//! Pluggable peer authorization.
//!
//! The session asks an [`AuthorizationPolicy`] once per handshake, after the
//! key exchange has proven which key (if any) the peer holds.

use crate::keys::{AuthorizedKeySet, PublicKey};
use std::fmt;
use std::sync::Arc;

/// Verdict of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Let the session proceed.
    Accept,
    /// Close the session before any request is read.
    Reject,
}

/// Decides whether a peer may complete a handshake.
pub trait AuthorizationPolicy: Send + Sync + fmt::Debug {
    /// `peer` is `None` when the client connected without a key pair.
    fn authorize(&self, peer: Option<&PublicKey>) -> Decision;
}

/// Accepts every peer, keyed or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
    fn authorize(&self, _peer: Option<&PublicKey>) -> Decision {
        Decision::Accept
    }
}

/// Accepts only peers whose key is in the set.
///
/// An empty set accepts everyone; a deny-all set accepts no one.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    keys: AuthorizedKeySet,
}

impl Allowlist {
    /// Wraps a key set.
    #[must_use]
    pub const fn new(keys: AuthorizedKeySet) -> Self {
        Self { keys }
    }

    /// The underlying keys.
    #[must_use]
    pub const fn keys(&self) -> &AuthorizedKeySet {
        &self.keys
    }
}

impl AuthorizationPolicy for Allowlist {
    fn authorize(&self, peer: Option<&PublicKey>) -> Decision {
        if self.keys.is_empty() {
            return Decision::Accept;
        }
        match peer {
            Some(key) if self.keys.contains(key) => Decision::Accept,
            _ => Decision::Reject,
        }
    }
}

/// Picks the policy for an optional allowlist: none or empty means
/// [`AllowAll`].
#[must_use]
pub fn policy_for(keys: Option<AuthorizedKeySet>) -> Arc<dyn AuthorizationPolicy> {
    match keys {
        Some(keys) if !keys.is_empty() => Arc::new(Allowlist::new(keys)),
        _ => Arc::new(AllowAll),
    }
}
