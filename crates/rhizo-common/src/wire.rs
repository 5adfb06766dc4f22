//! Request/Response binary codec.
//!
//! Every message starts with a fixed 16-byte header followed by a list of
//! tag-length-value fields:
//!
//! ```text
//! +------+------+----+-------+-------+----------+----------------------+
//! | "RZ" | kind | op | major | minor | sequence | field* (tag,len,val) |
//! |  2   |  1   | 1  |  2    |  2    |    8     |   1 + 4 + len each   |
//! +------+------+----+-------+-------+----------+----------------------+
//! ```
//!
//! Integers are big-endian. Unknown tags are skipped so a newer minor
//! version can add optional fields without breaking older peers. Fields are
//! always emitted in ascending tag order, which keeps the encoding canonical.
//!
//! From minor version [`COMPRESSION_MINOR`] a payload may travel as an LZ4
//! block under [`tag::PAYLOAD_LZ4`] instead of [`tag::PAYLOAD`]. A sender only
//! does so toward a peer that announced that minor; see [`Compression`].

use crate::types::{
    DirectoryEntry, EntryKind, Errno, FileAttributes, FsStats, Timestamp, MAX_MESSAGE_SIZE,
    PROTOCOL_MAJOR, PROTOCOL_MINOR,
};
use std::fmt;
use thiserror::Error;

/// Leading bytes of every message.
pub const MAGIC: [u8; 2] = *b"RZ";

/// Size of the fixed header.
pub const HEADER_LEN: usize = 16;

/// Header `kind` byte for requests.
pub const KIND_REQUEST: u8 = 0x01;
/// Header `kind` byte for responses.
pub const KIND_RESPONSE: u8 = 0x02;

/// Field tags. Requests and responses share one tag space.
pub mod tag {
    /// UTF-8 path relative to the served root.
    pub const PATH: u8 = 0x01;
    /// Second path: rename/link destination, symlink or readlink target.
    pub const TARGET: u8 = 0x02;
    /// Permission bits, access mask or open flags (u32).
    pub const MODE: u8 = 0x03;
    /// Size: truncate length, read length, bytes written (u64).
    pub const SIZE: u8 = 0x04;
    /// Byte offset (u64).
    pub const OFFSET: u8 = 0x05;
    /// Access time (i64 secs + u32 nanos).
    pub const ATIME: u8 = 0x06;
    /// Modification time (i64 secs + u32 nanos).
    pub const MTIME: u8 = 0x07;
    /// Bulk transfer id (u64).
    pub const TRANSFER: u8 = 0x08;
    /// Opaque file content.
    pub const PAYLOAD: u8 = 0x09;
    /// File content as an LZ4 block with a u32 little-endian length prefix.
    pub const PAYLOAD_LZ4: u8 = 0x0A;
    /// Response error class (u8).
    pub const ERRNO: u8 = 0x10;
    /// One directory entry (kind u8 + UTF-8 name); repeats.
    pub const ENTRY: u8 = 0x11;
    /// File attributes block.
    pub const ATTRIBUTES: u8 = 0x12;
    /// Filesystem statistics block.
    pub const STATS: u8 = 0x13;
}

/// First minor version that understands [`tag::PAYLOAD_LZ4`].
pub const COMPRESSION_MINOR: u16 = 4;

/// Payloads of this many bytes or fewer are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Encoded size of one field header (tag + length).
pub const FIELD_OVERHEAD: usize = 5;

const TIMESTAMP_LEN: usize = 12;
const ATTRIBUTES_LEN: usize = 8 + 4 + 4 + 4 + 3 * TIMESTAMP_LEN + 8 + 8;
const STATS_LEN: usize = 8 * 8;

/// Errors raised while encoding or decoding a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before a complete header or field.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// The message does not start with [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Header `kind` is neither request nor response, or not the one asked for.
    #[error("unexpected message kind {0:#04x}")]
    UnexpectedKind(u8),
    /// The message or one of its fields exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message too large: max {max}, got {actual}")]
    OversizedMessage {
        /// Limit in bytes.
        max: usize,
        /// Declared or actual size.
        actual: usize,
    },
    /// Peer speaks a different major protocol version.
    #[error("incompatible protocol version: local {local}, peer {peer}")]
    IncompatibleVersion {
        /// Our version.
        local: Version,
        /// The peer's version.
        peer: Version,
    },
    /// `op` is not a known operation.
    #[error("unknown operation {0}")]
    UnknownOperation(u8),
    /// A non-repeating field appeared twice.
    #[error("duplicate field {0:#04x}")]
    DuplicateField(u8),
    /// A known field has an invalid value.
    #[error("invalid field {tag:#04x}: {reason}")]
    InvalidField {
        /// Field tag.
        tag: u8,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Protocol version carried in every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Incompatible changes bump this.
    pub major: u16,
    /// Compatible additions bump this.
    pub minor: u16,
}

/// Outcome of comparing two compatible versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    /// Same major and minor.
    Exact,
    /// Peer has a lower minor; it will ignore our newer fields.
    PeerOlder,
    /// Peer has a higher minor; we ignore its newer fields.
    PeerNewer,
}

impl Version {
    /// The version this build speaks.
    pub const CURRENT: Self = Self {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
    };

    /// Compares `self` (local) against a peer version.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::IncompatibleVersion`] when majors differ.
    pub fn negotiate(self, peer: Self) -> Result<Negotiated, CodecError> {
        if self.major != peer.major {
            return Err(CodecError::IncompatibleVersion { local: self, peer });
        }
        Ok(match peer.minor.cmp(&self.minor) {
            std::cmp::Ordering::Equal => Negotiated::Exact,
            std::cmp::Ordering::Less => Negotiated::PeerOlder,
            std::cmp::Ordering::Greater => Negotiated::PeerNewer,
        })
    }
}

/// How payload fields are written toward a particular peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    /// Always plain [`tag::PAYLOAD`].
    #[default]
    None,
    /// LZ4 when the payload is large enough and actually shrinks.
    Lz4,
}

impl Compression {
    /// The richest encoding `peer` is known to decode.
    #[must_use]
    pub const fn for_peer(peer: Version) -> Self {
        if peer.major == PROTOCOL_MAJOR
            && peer.minor >= COMPRESSION_MINOR
            && PROTOCOL_MINOR >= COMPRESSION_MINOR
        {
            Self::Lz4
        } else {
            Self::None
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The closed set of operations.
///
/// Discriminants are the wire `op` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Only used in responses to requests whose `op` could not be decoded.
    Invalid = 0,
    /// Liveness check.
    Ping = 1,
    /// Attributes of `path`.
    Stat = 2,
    /// Entries of directory `path` (root when absent).
    ReadDir = 3,
    /// Create directory `path` with `mode`.
    MkDir = 4,
    /// Remove empty directory `path`.
    RmDir = 5,
    /// Remove non-directory `path`.
    Unlink = 6,
    /// Hard link `target` to existing `path`.
    Link = 7,
    /// Symlink at `path` pointing to `target`.
    Symlink = 8,
    /// Rename `path` to `target`.
    Rename = 9,
    /// Resize `path` to `size`.
    Truncate = 10,
    /// Set permission bits of `path` to `mode`.
    Chmod = 11,
    /// Set `atime` / `mtime` of `path`; absent fields are left unchanged.
    Utimens = 12,
    /// Filesystem statistics.
    StatFs = 13,
    /// Check `mode` access mask against `path`.
    Access = 14,
    /// Check that `path` can be opened with flags `mode`.
    Open = 15,
    /// Create regular file `path` with `mode`; fails if it exists.
    Create = 16,
    /// Target of symlink `path`.
    ReadLink = 17,
    /// Create a node at `path`; regular files only.
    MkNod = 18,
    /// Read `size` bytes of `path` at `offset`.
    Read = 19,
    /// Write `payload` to `path` at `offset`.
    Write = 20,
    /// Open a staged upload to `path`; response carries the transfer id.
    TransferBegin = 21,
    /// Append `payload` at `offset` to staged upload `transfer`.
    TransferChunk = 22,
    /// Atomically replace the target with staged upload `transfer`.
    TransferCommit = 23,
    /// Discard staged upload `transfer`.
    TransferAbort = 24,
}

impl Operation {
    /// Every operation, in wire order.
    pub const ALL: [Self; 25] = [
        Self::Invalid,
        Self::Ping,
        Self::Stat,
        Self::ReadDir,
        Self::MkDir,
        Self::RmDir,
        Self::Unlink,
        Self::Link,
        Self::Symlink,
        Self::Rename,
        Self::Truncate,
        Self::Chmod,
        Self::Utimens,
        Self::StatFs,
        Self::Access,
        Self::Open,
        Self::Create,
        Self::ReadLink,
        Self::MkNod,
        Self::Read,
        Self::Write,
        Self::TransferBegin,
        Self::TransferChunk,
        Self::TransferCommit,
        Self::TransferAbort,
    ];

    /// Upper-case name for logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Ping => "PING",
            Self::Stat => "STAT",
            Self::ReadDir => "READDIR",
            Self::MkDir => "MKDIR",
            Self::RmDir => "RMDIR",
            Self::Unlink => "UNLINK",
            Self::Link => "LINK",
            Self::Symlink => "SYMLINK",
            Self::Rename => "RENAME",
            Self::Truncate => "TRUNCATE",
            Self::Chmod => "CHMOD",
            Self::Utimens => "UTIMENS",
            Self::StatFs => "STATFS",
            Self::Access => "ACCESS",
            Self::Open => "OPEN",
            Self::Create => "CREATE",
            Self::ReadLink => "READLINK",
            Self::MkNod => "MKNOD",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::TransferBegin => "TRANSFER_BEGIN",
            Self::TransferChunk => "TRANSFER_CHUNK",
            Self::TransferCommit => "TRANSFER_COMMIT",
            Self::TransferAbort => "TRANSFER_ABORT",
        }
    }
}

impl TryFrom<u8> for Operation {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(CodecError::UnknownOperation(value))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed header fields, readable even when the body is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// [`KIND_REQUEST`] or [`KIND_RESPONSE`].
    pub kind: u8,
    /// Raw operation byte.
    pub op: u8,
    /// Sender's protocol version.
    pub version: Version,
    /// Exchange sequence number.
    pub sequence: u64,
}

impl Header {
    /// Reads the header without validating `op`, version or body.
    ///
    /// Lets a server answer a request it cannot otherwise decode.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the input is too short or lacks the magic.
    pub fn peek(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        if data[..2] != MAGIC {
            return Err(CodecError::BadMagic);
        }
        Ok(Self {
            kind: data[2],
            op: data[3],
            version: Version {
                major: u16::from_be_bytes([data[4], data[5]]),
                minor: u16::from_be_bytes([data[6], data[7]]),
            },
            sequence: u64::from_be_bytes(try_into_array(&data[8..16])?),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&MAGIC);
        buf.push(self.kind);
        buf.push(self.op);
        buf.extend_from_slice(&self.version.major.to_be_bytes());
        buf.extend_from_slice(&self.version.minor.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
    }
}

/// A client-to-server message carrying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation to perform.
    pub op: Operation,
    /// Sender's protocol version.
    pub version: Version,
    /// Exchange sequence number, echoed by the response.
    pub sequence: u64,
    /// Primary path.
    pub path: Option<String>,
    /// Secondary path or symlink target.
    pub target: Option<String>,
    /// Permission bits, access mask or open flags.
    pub mode: Option<u32>,
    /// Length argument.
    pub size: Option<u64>,
    /// Byte offset.
    pub offset: Option<u64>,
    /// New access time.
    pub atime: Option<Timestamp>,
    /// New modification time.
    pub mtime: Option<Timestamp>,
    /// Bulk transfer id.
    pub transfer: Option<u64>,
    /// File content.
    pub payload: Option<Vec<u8>>,
}

/// A server-to-client message answering exactly one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Echo of the request's operation.
    pub op: Operation,
    /// Sender's protocol version.
    pub version: Version,
    /// Echo of the request's sequence number.
    pub sequence: u64,
    /// Outcome; [`Errno::None`] on success.
    pub errno: Errno,
    /// READDIR results, in enumeration order.
    pub entries: Vec<DirectoryEntry>,
    /// STAT and mutation results.
    pub attributes: Option<FileAttributes>,
    /// STATFS result.
    pub stats: Option<FsStats>,
    /// READLINK result.
    pub target: Option<String>,
    /// Bytes written by WRITE or TRANSFER_CHUNK.
    pub size: Option<u64>,
    /// Start index of the next READDIR page; absent on the last page.
    pub offset: Option<u64>,
    /// Transfer id allocated by TRANSFER_BEGIN.
    pub transfer: Option<u64>,
    /// READ result.
    pub payload: Option<Vec<u8>>,
}

/// Either kind of message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client-to-server.
    Request(Request),
    /// Server-to-client.
    Response(Response),
}

impl Message {
    /// Decodes a request or response, dispatching on the header kind.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for malformed, oversized or incompatible input.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match Header::peek(data)?.kind {
            KIND_REQUEST => Request::decode(data).map(Self::Request),
            KIND_RESPONSE => Response::decode(data).map(Self::Response),
            other => Err(CodecError::UnexpectedKind(other)),
        }
    }

    /// Encodes the wrapped message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedMessage`] past [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Request(r) => r.encode(),
            Self::Response(r) => r.encode(),
        }
    }
}

impl Request {
    /// Creates an empty request for `op` at the current version.
    #[must_use]
    pub const fn new(op: Operation) -> Self {
        Self {
            op,
            version: Version::CURRENT,
            sequence: 0,
            path: None,
            target: None,
            mode: None,
            size: None,
            offset: None,
            atime: None,
            mtime: None,
            transfer: None,
            payload: None,
        }
    }

    /// Sets the primary path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the secondary path.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Sets the mode / mask / flags field.
    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the size field.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the offset field.
    #[must_use]
    pub const fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets access and modification times; `None` leaves a time unchanged.
    #[must_use]
    pub const fn with_times(mut self, atime: Option<Timestamp>, mtime: Option<Timestamp>) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self
    }

    /// Sets the transfer id.
    #[must_use]
    pub const fn with_transfer(mut self, transfer: u64) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serializes the request with a plain payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedMessage`] past [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_with(Compression::None)
    }

    /// Serializes the request, compressing the payload if `compression`
    /// allows it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedMessage`] past [`MAX_MESSAGE_SIZE`].
    pub fn encode_with(&self, compression: Compression) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN + 64 + self.payload.as_ref().map_or(0, Vec::len),
        );
        Header {
            kind: KIND_REQUEST,
            op: self.op as u8,
            version: self.version,
            sequence: self.sequence,
        }
        .write(&mut buf);

        if let Some(path) = &self.path {
            put_field(&mut buf, tag::PATH, path.as_bytes());
        }
        if let Some(target) = &self.target {
            put_field(&mut buf, tag::TARGET, target.as_bytes());
        }
        if let Some(mode) = self.mode {
            put_field(&mut buf, tag::MODE, &mode.to_be_bytes());
        }
        if let Some(size) = self.size {
            put_field(&mut buf, tag::SIZE, &size.to_be_bytes());
        }
        if let Some(offset) = self.offset {
            put_field(&mut buf, tag::OFFSET, &offset.to_be_bytes());
        }
        if let Some(atime) = self.atime {
            put_field(&mut buf, tag::ATIME, &timestamp_bytes(atime));
        }
        if let Some(mtime) = self.mtime {
            put_field(&mut buf, tag::MTIME, &timestamp_bytes(mtime));
        }
        if let Some(transfer) = self.transfer {
            put_field(&mut buf, tag::TRANSFER, &transfer.to_be_bytes());
        }
        if let Some(payload) = &self.payload {
            put_payload(&mut buf, payload, compression);
        }

        check_size(buf.len())?;
        Ok(buf)
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::IncompatibleVersion`] when the major version
    /// differs, [`CodecError::UnknownOperation`] for an unrecognised `op`,
    /// and other variants for structurally invalid input.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        check_size(data.len())?;
        let header = Header::peek(data)?;
        if header.kind != KIND_REQUEST {
            return Err(CodecError::UnexpectedKind(header.kind));
        }
        Version::CURRENT.negotiate(header.version)?;
        let op = Operation::try_from(header.op)?;

        let mut req = Self::new(op);
        req.version = header.version;
        req.sequence = header.sequence;

        let mut seen = SeenTags::default();
        for field in Fields::new(&data[HEADER_LEN..]) {
            let (tag, value) = field?;
            match tag {
                tag::PATH => req.path = Some(seen.once(tag, || utf8(tag, value))?),
                tag::TARGET => req.target = Some(seen.once(tag, || utf8(tag, value))?),
                tag::MODE => {
                    req.mode = Some(seen.once(tag, || Ok(u32::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::SIZE => {
                    req.size = Some(seen.once(tag, || Ok(u64::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::OFFSET => {
                    req.offset =
                        Some(seen.once(tag, || Ok(u64::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::ATIME => req.atime = Some(seen.once(tag, || read_timestamp(tag, value))?),
                tag::MTIME => req.mtime = Some(seen.once(tag, || read_timestamp(tag, value))?),
                tag::TRANSFER => {
                    req.transfer =
                        Some(seen.once(tag, || Ok(u64::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::PAYLOAD => req.payload = Some(seen.once(tag, || Ok(value.to_vec()))?),
                tag::PAYLOAD_LZ4 => {
                    req.payload = Some(seen.once(tag::PAYLOAD, || unpack_payload(tag, value))?);
                }
                _ => {}
            }
        }
        Ok(req)
    }
}

impl Response {
    /// Creates a successful response echoing `req`'s operation and sequence.
    #[must_use]
    pub fn to(req: &Request) -> Self {
        Self::for_header(req.op, req.sequence)
    }

    /// Creates a successful response for a raw operation and sequence.
    #[must_use]
    pub const fn for_header(op: Operation, sequence: u64) -> Self {
        Self {
            op,
            version: Version::CURRENT,
            sequence,
            errno: Errno::None,
            entries: Vec::new(),
            attributes: None,
            stats: None,
            target: None,
            size: None,
            offset: None,
            transfer: None,
            payload: None,
        }
    }

    /// Sets the error class.
    #[must_use]
    pub const fn with_errno(mut self, errno: Errno) -> Self {
        self.errno = errno;
        self
    }

    /// True when `errno` is [`Errno::None`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errno == Errno::None
    }

    /// Serializes the response with a plain payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedMessage`] past [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_with(Compression::None)
    }

    /// Serializes the response, compressing the payload if `compression`
    /// allows it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedMessage`] past [`MAX_MESSAGE_SIZE`].
    pub fn encode_with(&self, compression: Compression) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN + 64 + self.payload.as_ref().map_or(0, Vec::len) + self.entries.len() * 24,
        );
        Header {
            kind: KIND_RESPONSE,
            op: self.op as u8,
            version: self.version,
            sequence: self.sequence,
        }
        .write(&mut buf);

        if let Some(target) = &self.target {
            put_field(&mut buf, tag::TARGET, target.as_bytes());
        }
        if let Some(size) = self.size {
            put_field(&mut buf, tag::SIZE, &size.to_be_bytes());
        }
        if let Some(offset) = self.offset {
            put_field(&mut buf, tag::OFFSET, &offset.to_be_bytes());
        }
        if let Some(transfer) = self.transfer {
            put_field(&mut buf, tag::TRANSFER, &transfer.to_be_bytes());
        }
        if let Some(payload) = &self.payload {
            put_payload(&mut buf, payload, compression);
        }
        put_field(&mut buf, tag::ERRNO, &[self.errno as u8]);
        for entry in &self.entries {
            let mut value = Vec::with_capacity(1 + entry.name.len());
            value.push(entry.kind as u8);
            value.extend_from_slice(entry.name.as_bytes());
            put_field(&mut buf, tag::ENTRY, &value);
            if buf.len() > MAX_MESSAGE_SIZE {
                break;
            }
        }
        if let Some(attrs) = &self.attributes {
            put_field(&mut buf, tag::ATTRIBUTES, &attributes_bytes(attrs));
        }
        if let Some(stats) = &self.stats {
            put_field(&mut buf, tag::STATS, &stats_bytes(stats));
        }

        check_size(buf.len())?;
        Ok(buf)
    }

    /// Parses a response.
    ///
    /// # Errors
    ///
    /// As for [`Request::decode`].
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        check_size(data.len())?;
        let header = Header::peek(data)?;
        if header.kind != KIND_RESPONSE {
            return Err(CodecError::UnexpectedKind(header.kind));
        }
        Version::CURRENT.negotiate(header.version)?;
        let op = Operation::try_from(header.op)?;

        let mut resp = Self::for_header(op, header.sequence);
        resp.version = header.version;

        let mut seen = SeenTags::default();
        for field in Fields::new(&data[HEADER_LEN..]) {
            let (tag, value) = field?;
            match tag {
                tag::TARGET => resp.target = Some(seen.once(tag, || utf8(tag, value))?),
                tag::SIZE => {
                    resp.size =
                        Some(seen.once(tag, || Ok(u64::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::OFFSET => {
                    resp.offset =
                        Some(seen.once(tag, || Ok(u64::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::TRANSFER => {
                    resp.transfer =
                        Some(seen.once(tag, || Ok(u64::from_be_bytes(fixed(tag, value)?)))?);
                }
                tag::PAYLOAD => resp.payload = Some(seen.once(tag, || Ok(value.to_vec()))?),
                tag::PAYLOAD_LZ4 => {
                    resp.payload = Some(seen.once(tag::PAYLOAD, || unpack_payload(tag, value))?);
                }
                tag::ERRNO => {
                    resp.errno =
                        seen.once(tag, || Ok(Errno::from_wire(fixed::<1>(tag, value)?[0])))?;
                }
                tag::ENTRY => {
                    let (&kind, name) = value.split_first().ok_or(CodecError::InvalidField {
                        tag,
                        reason: "empty entry",
                    })?;
                    resp.entries.push(DirectoryEntry {
                        name: utf8(tag, name)?,
                        kind: EntryKind::from_wire(kind),
                    });
                }
                tag::ATTRIBUTES => {
                    resp.attributes = Some(seen.once(tag, || read_attributes(tag, value))?);
                }
                tag::STATS => resp.stats = Some(seen.once(tag, || read_stats(tag, value))?),
                _ => {}
            }
        }
        Ok(resp)
    }
}

/// Bytes one directory entry adds to an encoded response.
#[must_use]
pub fn entry_wire_len(entry: &DirectoryEntry) -> usize {
    FIELD_OVERHEAD + 1 + entry.name.len()
}

fn check_size(len: usize) -> Result<(), CodecError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::OversizedMessage {
            max: MAX_MESSAGE_SIZE,
            actual: len,
        });
    }
    Ok(())
}

fn put_field(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    // Lengths past u32 cannot pass check_size anyway.
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
}

fn put_payload(buf: &mut Vec<u8>, payload: &[u8], compression: Compression) {
    if compression == Compression::Lz4 && payload.len() > COMPRESSION_THRESHOLD {
        let packed = lz4_flex::compress_prepend_size(payload);
        if packed.len() < payload.len() {
            put_field(buf, tag::PAYLOAD_LZ4, &packed);
            return;
        }
    }
    put_field(buf, tag::PAYLOAD, payload);
}

/// Inflates a [`tag::PAYLOAD_LZ4`] value. The declared size is checked
/// before anything is allocated.
fn unpack_payload(tag: u8, value: &[u8]) -> Result<Vec<u8>, CodecError> {
    let prefix: [u8; 4] = value
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(CodecError::InvalidField {
            tag,
            reason: "compressed payload too short",
        })?;
    check_size(u32::from_le_bytes(prefix) as usize)?;
    lz4_flex::decompress_size_prepended(value).map_err(|_| CodecError::InvalidField {
        tag,
        reason: "corrupt compressed payload",
    })
}

/// Safely convert a byte slice to a fixed-size array.
fn try_into_array<const N: usize>(data: &[u8]) -> Result<[u8; N], CodecError> {
    data.try_into().map_err(|_| CodecError::Truncated {
        expected: N,
        actual: data.len(),
    })
}

fn fixed<const N: usize>(tag: u8, value: &[u8]) -> Result<[u8; N], CodecError> {
    value.try_into().map_err(|_| CodecError::InvalidField {
        tag,
        reason: "wrong length",
    })
}

fn utf8(tag: u8, value: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(value.to_vec()).map_err(|_| CodecError::InvalidField {
        tag,
        reason: "not utf-8",
    })
}

fn timestamp_bytes(ts: Timestamp) -> [u8; TIMESTAMP_LEN] {
    let mut out = [0u8; TIMESTAMP_LEN];
    out[..8].copy_from_slice(&ts.secs.to_be_bytes());
    out[8..].copy_from_slice(&ts.nanos.to_be_bytes());
    out
}

fn parse_timestamp(tag: u8, b: &[u8]) -> Result<Timestamp, CodecError> {
    let secs = i64::from_be_bytes(try_into_array(&b[..8])?);
    let nanos = u32::from_be_bytes(try_into_array(&b[8..TIMESTAMP_LEN])?);
    if nanos >= 1_000_000_000 {
        return Err(CodecError::InvalidField {
            tag,
            reason: "nanoseconds out of range",
        });
    }
    Ok(Timestamp { secs, nanos })
}

fn read_timestamp(tag: u8, value: &[u8]) -> Result<Timestamp, CodecError> {
    parse_timestamp(tag, &fixed::<TIMESTAMP_LEN>(tag, value)?)
}

fn attributes_bytes(a: &FileAttributes) -> Vec<u8> {
    let mut out = Vec::with_capacity(ATTRIBUTES_LEN);
    out.extend_from_slice(&a.size.to_be_bytes());
    out.extend_from_slice(&a.mode.to_be_bytes());
    out.extend_from_slice(&a.uid.to_be_bytes());
    out.extend_from_slice(&a.gid.to_be_bytes());
    out.extend_from_slice(&timestamp_bytes(a.atime));
    out.extend_from_slice(&timestamp_bytes(a.mtime));
    out.extend_from_slice(&timestamp_bytes(a.ctime));
    out.extend_from_slice(&a.nlink.to_be_bytes());
    out.extend_from_slice(&a.inode.to_be_bytes());
    out
}

/// Reads the known prefix of an attributes block; trailing bytes added by
/// newer minors are ignored.
fn read_attributes(tag: u8, value: &[u8]) -> Result<FileAttributes, CodecError> {
    if value.len() < ATTRIBUTES_LEN {
        return Err(CodecError::InvalidField {
            tag,
            reason: "attributes too short",
        });
    }
    let mut r = Cursor::new(value);
    Ok(FileAttributes {
        size: u64::from_be_bytes(r.take()?),
        mode: u32::from_be_bytes(r.take()?),
        uid: u32::from_be_bytes(r.take()?),
        gid: u32::from_be_bytes(r.take()?),
        atime: parse_timestamp(tag, &r.take::<TIMESTAMP_LEN>()?)?,
        mtime: parse_timestamp(tag, &r.take::<TIMESTAMP_LEN>()?)?,
        ctime: parse_timestamp(tag, &r.take::<TIMESTAMP_LEN>()?)?,
        nlink: u64::from_be_bytes(r.take()?),
        inode: u64::from_be_bytes(r.take()?),
    })
}

fn stats_bytes(s: &FsStats) -> Vec<u8> {
    [
        s.block_size,
        s.fragment_size,
        s.blocks,
        s.blocks_free,
        s.blocks_available,
        s.files,
        s.files_free,
        s.name_max,
    ]
    .iter()
    .flat_map(|v| v.to_be_bytes())
    .collect()
}

fn read_stats(tag: u8, value: &[u8]) -> Result<FsStats, CodecError> {
    if value.len() < STATS_LEN {
        return Err(CodecError::InvalidField {
            tag,
            reason: "stats too short",
        });
    }
    let mut r = Cursor::new(value);
    Ok(FsStats {
        block_size: u64::from_be_bytes(r.take()?),
        fragment_size: u64::from_be_bytes(r.take()?),
        blocks: u64::from_be_bytes(r.take()?),
        blocks_free: u64::from_be_bytes(r.take()?),
        blocks_available: u64::from_be_bytes(r.take()?),
        files: u64::from_be_bytes(r.take()?),
        files_free: u64::from_be_bytes(r.take()?),
        name_max: u64::from_be_bytes(r.take()?),
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.pos + N;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::Truncated {
            expected: end,
            actual: self.data.len(),
        })?;
        self.pos = end;
        try_into_array(slice)
    }
}

/// Iterator over `(tag, value)` pairs of a field list.
struct Fields<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> Fields<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            failed: false,
        }
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<(u8, &'a [u8]), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        if self.data.len() < 5 {
            self.failed = true;
            return Some(Err(CodecError::Truncated {
                expected: 5,
                actual: self.data.len(),
            }));
        }
        let tag = self.data[0];
        let len = u32::from_be_bytes([self.data[1], self.data[2], self.data[3], self.data[4]]) as usize;
        let rest = &self.data[5..];
        // The declared length is bounded by what was actually received,
        // never trusted for allocation.
        if len > rest.len() {
            self.failed = true;
            return Some(Err(CodecError::Truncated {
                expected: len,
                actual: rest.len(),
            }));
        }
        let (value, tail) = rest.split_at(len);
        self.data = tail;
        Some(Ok((tag, value)))
    }
}

/// Tracks which single-occurrence tags have been decoded.
#[derive(Default)]
struct SeenTags(u32);

impl SeenTags {
    fn once<T>(
        &mut self,
        tag: u8,
        parse: impl FnOnce() -> Result<T, CodecError>,
    ) -> Result<T, CodecError> {
        let bit = 1u32 << (tag & 0x1f);
        if self.0 & bit != 0 {
            return Err(CodecError::DuplicateField(tag));
        }
        self.0 |= bit;
        parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attrs() -> FileAttributes {
        FileAttributes {
            size: 4096,
            mode: 0o100_644,
            uid: 1000,
            gid: 100,
            atime: Timestamp::new(1_234_567_890, 123_456_789),
            mtime: Timestamp::new(1_234_567_891, 987_654_321),
            ctime: Timestamp::new(1_234_567_892, 1),
            nlink: 2,
            inode: 77,
        }
    }

    #[test]
    fn request_roundtrip_all_fields() {
        let mut req = Request::new(Operation::Utimens)
            .with_path("dir/file.txt")
            .with_target("other")
            .with_mode(0o644)
            .with_size(10)
            .with_offset(20)
            .with_times(
                Some(Timestamp::new(1, 2)),
                Some(Timestamp::new(-3, 999_999_999)),
            )
            .with_transfer(9)
            .with_payload(vec![1, 2, 3]);
        req.sequence = 42;
        let bytes = req.encode().unwrap();
        assert_eq!(&bytes[..2], b"RZ");
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn response_roundtrip_with_entries_and_attrs() {
        let req = Request::new(Operation::ReadDir);
        let mut resp = Response::to(&req);
        resp.entries = vec![
            DirectoryEntry {
                name: "a".into(),
                kind: EntryKind::File,
            },
            DirectoryEntry {
                name: "sub".into(),
                kind: EntryKind::Directory,
            },
        ];
        resp.attributes = Some(sample_attrs());
        resp.stats = Some(FsStats {
            block_size: 4096,
            name_max: 255,
            ..FsStats::default()
        });
        let bytes = resp.encode().unwrap();
        let decoded = Response::decode(&bytes).unwrap();
        assert_eq!(decoded, resp);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let req = Request::new(Operation::Stat).with_path("x");
        let mut bytes = req.encode().unwrap();
        put_field(&mut bytes, 0x7f, b"from the future");
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn longer_attribute_block_is_accepted() {
        let mut resp = Response::for_header(Operation::Stat, 3);
        resp.attributes = Some(sample_attrs());
        let bytes = resp.encode().unwrap();
        // Rebuild with four extra trailing bytes in the attributes field.
        let mut extended = bytes[..HEADER_LEN].to_vec();
        put_field(&mut extended, tag::ERRNO, &[0]);
        let mut block = attributes_bytes(&sample_attrs());
        block.extend_from_slice(&[9, 9, 9, 9]);
        put_field(&mut extended, tag::ATTRIBUTES, &block);
        assert_eq!(Response::decode(&extended).unwrap(), resp);
    }

    #[test]
    fn unknown_operation_is_reported_with_header() {
        let mut bytes = Request::new(Operation::Ping).encode().unwrap();
        bytes[3] = 0xEE;
        assert_eq!(
            Request::decode(&bytes),
            Err(CodecError::UnknownOperation(0xEE))
        );
        let header = Header::peek(&bytes).unwrap();
        assert_eq!(header.op, 0xEE);
        assert_eq!(header.kind, KIND_REQUEST);
    }

    #[test]
    fn major_mismatch_is_incompatible_minor_is_not() {
        let mut req = Request::new(Operation::Ping);
        req.version = Version {
            major: PROTOCOL_MAJOR + 1,
            minor: 0,
        };
        let bytes = req.encode().unwrap();
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::IncompatibleVersion { .. })
        ));

        req.version = Version {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR + 5,
        };
        let bytes = req.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap().version, req.version);
    }

    #[test]
    fn negotiate_reports_direction() {
        let local = Version { major: 1, minor: 4 };
        assert_eq!(local.negotiate(local), Ok(Negotiated::Exact));
        assert_eq!(
            local.negotiate(Version { major: 1, minor: 2 }),
            Ok(Negotiated::PeerOlder)
        );
        assert_eq!(
            local.negotiate(Version { major: 1, minor: 9 }),
            Ok(Negotiated::PeerNewer)
        );
        assert!(local.negotiate(Version { major: 2, minor: 4 }).is_err());
    }

    #[test]
    fn rejects_duplicate_field() {
        let mut bytes = Request::new(Operation::Stat).with_path("a").encode().unwrap();
        put_field(&mut bytes, tag::PATH, b"b");
        assert_eq!(
            Request::decode(&bytes),
            Err(CodecError::DuplicateField(tag::PATH))
        );
    }

    #[test]
    fn rejects_length_prefix_beyond_input() {
        let mut bytes = Request::new(Operation::Ping).encode().unwrap();
        bytes.push(tag::PAYLOAD);
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_oversized_message() {
        let req = Request::new(Operation::Write).with_payload(vec![0; MAX_MESSAGE_SIZE]);
        assert!(matches!(
            req.encode(),
            Err(CodecError::OversizedMessage { .. })
        ));
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Request::decode(&big),
            Err(CodecError::OversizedMessage { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic_and_kind() {
        let mut bytes = Request::new(Operation::Ping).encode().unwrap();
        assert!(matches!(
            Response::decode(&bytes),
            Err(CodecError::UnexpectedKind(KIND_REQUEST))
        ));
        bytes[0] = b'X';
        assert_eq!(Request::decode(&bytes), Err(CodecError::BadMagic));
        assert!(matches!(
            Request::decode(&bytes[..4]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_nanos() {
        let mut bytes = Request::new(Operation::Utimens).encode().unwrap();
        let mut ts = timestamp_bytes(Timestamp::new(1, 0));
        ts[8..].copy_from_slice(&2_000_000_000u32.to_be_bytes());
        put_field(&mut bytes, tag::ATIME, &ts);
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::InvalidField { tag: tag::ATIME, .. })
        ));
    }

    #[test]
    fn message_dispatches_on_kind() {
        let req = Request::new(Operation::Ping);
        let resp = Response::to(&req).with_errno(Errno::NoEnt);
        assert_eq!(
            Message::decode(&req.encode().unwrap()).unwrap(),
            Message::Request(req)
        );
        assert_eq!(
            Message::decode(&resp.encode().unwrap()).unwrap(),
            Message::Response(resp)
        );
    }

    #[test]
    fn readdir_continuation_offset_roundtrips() {
        let mut resp = Response::for_header(Operation::ReadDir, 5);
        resp.entries = vec![DirectoryEntry {
            name: "a".into(),
            kind: EntryKind::File,
        }];
        resp.offset = Some(1);
        let bytes = resp.encode().unwrap();
        assert_eq!(Response::decode(&bytes).unwrap().offset, Some(1));
        assert_eq!(
            bytes.len(),
            HEADER_LEN + (FIELD_OVERHEAD + 8) + (FIELD_OVERHEAD + 1) + entry_wire_len(&resp.entries[0])
        );
    }

    #[test]
    fn compressible_payload_shrinks_and_inflates() {
        let req = Request::new(Operation::Write)
            .with_path("f")
            .with_payload(b"rhizome ".repeat(4096));
        let plain = req.encode().unwrap();
        let packed = req.encode_with(Compression::Lz4).unwrap();
        assert!(packed.len() < plain.len() / 4);
        assert_eq!(packed[HEADER_LEN + FIELD_OVERHEAD + 1], tag::PAYLOAD_LZ4);
        assert_eq!(Request::decode(&packed).unwrap(), req);

        let mut resp = Response::to(&req);
        resp.payload = req.payload.clone();
        let packed = resp.encode_with(Compression::Lz4).unwrap();
        assert_eq!(Response::decode(&packed).unwrap(), resp);
    }

    #[test]
    fn small_or_incompressible_payload_stays_plain() {
        let small = Request::new(Operation::Write).with_payload(vec![0; COMPRESSION_THRESHOLD]);
        assert_eq!(
            small.encode_with(Compression::Lz4).unwrap(),
            small.encode().unwrap()
        );

        // xorshift noise does not compress.
        let mut x = 0x9e37_79b9_7f4a_7c15u64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();
        let noisy = Request::new(Operation::Write).with_payload(noise);
        assert_eq!(
            noisy.encode_with(Compression::Lz4).unwrap(),
            noisy.encode().unwrap()
        );
    }

    #[test]
    fn compression_follows_peer_minor() {
        assert_eq!(Compression::for_peer(Version::CURRENT), Compression::Lz4);
        let old = Version {
            major: PROTOCOL_MAJOR,
            minor: COMPRESSION_MINOR - 1,
        };
        assert_eq!(Compression::for_peer(old), Compression::None);
        let other = Version {
            major: PROTOCOL_MAJOR + 1,
            minor: COMPRESSION_MINOR,
        };
        assert_eq!(Compression::for_peer(other), Compression::None);
    }

    #[test]
    fn rejects_compressed_payload_claiming_huge_size() {
        let mut bytes = Request::new(Operation::Write).encode().unwrap();
        let mut value = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes().to_vec();
        value.extend_from_slice(&[0x1f, 0, 0, 0, 0]);
        put_field(&mut bytes, tag::PAYLOAD_LZ4, &value);
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::OversizedMessage { .. })
        ));
    }

    #[test]
    fn rejects_corrupt_or_doubled_compressed_payload() {
        let mut bytes = Request::new(Operation::Write).encode().unwrap();
        let mut value = 64u32.to_le_bytes().to_vec();
        value.extend_from_slice(&[0xff; 6]);
        put_field(&mut bytes, tag::PAYLOAD_LZ4, &value);
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::InvalidField {
                tag: tag::PAYLOAD_LZ4,
                ..
            })
        ));

        let mut bytes = Request::new(Operation::Write)
            .with_payload(vec![1, 2, 3])
            .encode()
            .unwrap();
        put_field(
            &mut bytes,
            tag::PAYLOAD_LZ4,
            &lz4_flex::compress_prepend_size(&[7; 300]),
        );
        assert_eq!(
            Request::decode(&bytes),
            Err(CodecError::DuplicateField(tag::PAYLOAD))
        );
    }

    #[test]
    fn operation_try_from_covers_all() {
        for op in Operation::ALL {
            assert_eq!(Operation::try_from(op as u8), Ok(op));
        }
        assert_eq!(
            Operation::try_from(Operation::ALL.len() as u8),
            Err(CodecError::UnknownOperation(Operation::ALL.len() as u8))
        );
    }
}
