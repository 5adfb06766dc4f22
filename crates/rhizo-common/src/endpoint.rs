//! Transport URI parsing.
//!
//! An endpoint names exactly one server process. Three schemes are
//! understood:
//!
//! - `ipc://<absolute-path>`: a Unix domain socket
//! - `tcp://<host>:<port>`: a TCP socket; `host` may be a name, an IPv4
//!   address, a bracketed IPv6 address, or `*` for every interface
//! - `vmci://<cid>:<port>`: a hypervisor socket; `cid` may be `*`
//!
//! Parsing never performs I/O. Name resolution happens when connecting.

use std::fmt;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Wildcard token accepted in the host and cid positions.
pub const WILDCARD: &str = "*";

/// Errors produced while parsing an endpoint URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The URI does not contain `://`.
    #[error("missing scheme in {0:?}")]
    MissingScheme(String),
    /// The scheme is not one of `ipc`, `tcp`, `vmci`.
    #[error("unknown scheme {0:?}")]
    UnknownScheme(String),
    /// The body after `://` is empty.
    #[error("empty address")]
    EmptyAddress,
    /// `ipc://` paths must be absolute.
    #[error("ipc path must be absolute: {0:?}")]
    RelativePath(String),
    /// `host:port` or `cid:port` is missing the port separator.
    #[error("missing port in {0:?}")]
    MissingPort(String),
    /// The port is not a number in range.
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    /// The host part is malformed.
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    /// The vmci context id is not a number.
    #[error("invalid context id {0:?}")]
    InvalidContextId(String),
}

/// Transport selected by an endpoint URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Unix domain socket.
    Ipc,
    /// TCP/IP.
    Tcp,
    /// VMware VMCI / virtio vsock.
    Vmci,
}

impl Scheme {
    /// URI prefix without the `://` separator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Tcp => "tcp",
            Self::Vmci => "vmci",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix domain socket path.
    Ipc {
        /// Absolute socket path.
        path: PathBuf,
    },
    /// TCP host and port.
    Tcp {
        /// Hostname, IP literal (IPv6 without brackets) or `*`.
        host: String,
        /// Port; 0 asks the OS for an ephemeral port when binding.
        port: u16,
    },
    /// vsock context id and port. `None` is the `*` wildcard.
    Vmci {
        /// Context id, `None` for any.
        cid: Option<u32>,
        /// vsock port.
        port: u32,
    },
}

impl Endpoint {
    /// Parses an endpoint URI.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] when the scheme is unknown or the body does
    /// not follow that scheme's grammar.
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        let (scheme, body) = uri
            .split_once("://")
            .ok_or_else(|| AddressError::MissingScheme(uri.to_string()))?;

        if body.is_empty() {
            return Err(AddressError::EmptyAddress);
        }

        match scheme {
            "ipc" => parse_ipc(body),
            "tcp" => parse_tcp(body),
            "vmci" => parse_vmci(body),
            other => Err(AddressError::UnknownScheme(other.to_string())),
        }
    }

    /// The scheme this endpoint uses.
    #[must_use]
    pub const fn scheme(&self) -> Scheme {
        match self {
            Self::Ipc { .. } => Scheme::Ipc,
            Self::Tcp { .. } => Scheme::Tcp,
            Self::Vmci { .. } => Scheme::Vmci,
        }
    }

    /// Port for `tcp` and `vmci` endpoints; `None` for `ipc`.
    #[must_use]
    pub fn port(&self) -> Option<u32> {
        match self {
            Self::Ipc { .. } => None,
            Self::Tcp { port, .. } => Some(u32::from(*port)),
            Self::Vmci { port, .. } => Some(*port),
        }
    }

    /// Creates a TCP endpoint for an already-bound socket address.
    #[must_use]
    pub fn tcp(addr: std::net::SocketAddr) -> Self {
        Self::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Creates an IPC endpoint.
    #[must_use]
    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc { path: path.into() }
    }
}

fn parse_ipc(body: &str) -> Result<Endpoint, AddressError> {
    if !body.starts_with('/') {
        return Err(AddressError::RelativePath(body.to_string()));
    }
    Ok(Endpoint::Ipc {
        path: PathBuf::from(body),
    })
}

fn parse_tcp(body: &str) -> Result<Endpoint, AddressError> {
    let (host, port) = if let Some(rest) = body.strip_prefix('[') {
        let (v6, tail) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::InvalidHost(body.to_string()))?;
        v6.parse::<Ipv6Addr>()
            .map_err(|_| AddressError::InvalidHost(v6.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| AddressError::MissingPort(body.to_string()))?;
        (v6, port)
    } else {
        let (host, port) = body
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(body.to_string()))?;
        if host.contains(':') {
            // bare IPv6 literal; the port separator would be ambiguous
            return Err(AddressError::InvalidHost(host.to_string()));
        }
        if host != WILDCARD && !valid_hostname(host) {
            return Err(AddressError::InvalidHost(host.to_string()));
        }
        (host, port)
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))?;

    Ok(Endpoint::Tcp {
        host: host.to_string(),
        port,
    })
}

fn parse_vmci(body: &str) -> Result<Endpoint, AddressError> {
    let (cid, port) = body
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingPort(body.to_string()))?;
    let cid = if cid == WILDCARD {
        None
    } else {
        Some(
            cid.parse::<u32>()
                .map_err(|_| AddressError::InvalidContextId(cid.to_string()))?,
        )
    };
    let port = port
        .parse::<u32>()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
    Ok(Endpoint::Vmci { cid, port })
}

/// RFC 1123 hostname or dotted IPv4 literal.
fn valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipc { path } => write!(f, "ipc://{}", path.display()),
            Self::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Vmci { cid: Some(cid), port } => write!(f, "vmci://{cid}:{port}"),
            Self::Vmci { cid: None, port } => write!(f, "vmci://{WILDCARD}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_hostname() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9]([a-z0-9-]{0,10}[a-z0-9])?", 1..4)
            .prop_map(|labels| labels.join("."))
    }

    fn arb_endpoint() -> impl Strategy<Value = Endpoint> {
        prop_oneof![
            "/[a-z0-9_/]{1,40}".prop_map(|p| Endpoint::ipc(p)),
            (arb_hostname(), any::<u16>()).prop_map(|(host, port)| Endpoint::Tcp { host, port }),
            (any::<[u16; 8]>(), any::<u16>()).prop_map(|(seg, port)| Endpoint::Tcp {
                host: Ipv6Addr::from(seg).to_string(),
                port
            }),
            (proptest::option::of(any::<u32>()), any::<u32>())
                .prop_map(|(cid, port)| Endpoint::Vmci { cid, port }),
        ]
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(ep in arb_endpoint()) {
            let text = ep.to_string();
            let parsed = Endpoint::parse(&text).unwrap();
            prop_assert_eq!(&parsed, &ep);
            prop_assert_eq!(parsed.to_string(), text);
        }

        #[test]
        fn parse_never_panics(s in ".{0,64}") {
            let _ = Endpoint::parse(&s);
        }
    }
}
