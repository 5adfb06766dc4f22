//! Core type definitions and protocol constants for rhizofs.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Protocol major version. Peers with different majors cannot talk.
pub const PROTOCOL_MAJOR: u16 = 0;
/// Protocol minor version. Newer minors only add optional fields.
pub const PROTOCOL_MINOR: u16 = 4;

/// Maximum encoded size of one Request or Response (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum payload of one READ, WRITE or transfer chunk (256 KiB).
pub const CHUNK_SIZE: usize = 256 * 1024;

/// POSIX-like error classes carried in a Response.
///
/// Discriminants are the wire values and never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Errno {
    /// Success.
    None = 0,
    /// Operation not permitted.
    Perm = 1,
    /// No such file or directory.
    NoEnt = 2,
    /// Out of memory.
    NoMem = 3,
    /// Permission denied.
    Acces = 4,
    /// Resource busy.
    Busy = 5,
    /// File exists.
    Exist = 6,
    /// Not a directory.
    NotDir = 7,
    /// Is a directory.
    IsDir = 8,
    /// Invalid argument or malformed request.
    Inval = 9,
    /// File too large.
    FBig = 10,
    /// No space left on device.
    NoSpc = 11,
    /// Read-only filesystem.
    RoFs = 12,
    /// Illegal seek.
    SPipe = 13,
    /// Directory not empty.
    NotEmpty = 14,
    /// Cross-device link.
    XDev = 15,
    /// File name too long.
    NameTooLong = 16,
    /// Too many levels of symbolic links.
    Loop = 17,
    /// Generic I/O error, also used for internal faults.
    Io = 18,
    /// Protocol major version mismatch.
    Version = 19,
    /// Bulk transfer out of order, unknown, or already closed.
    Transfer = 20,
}

impl Errno {
    /// Every variant, in wire order.
    pub const ALL: [Self; 21] = [
        Self::None,
        Self::Perm,
        Self::NoEnt,
        Self::NoMem,
        Self::Acces,
        Self::Busy,
        Self::Exist,
        Self::NotDir,
        Self::IsDir,
        Self::Inval,
        Self::FBig,
        Self::NoSpc,
        Self::RoFs,
        Self::SPipe,
        Self::NotEmpty,
        Self::XDev,
        Self::NameTooLong,
        Self::Loop,
        Self::Io,
        Self::Version,
        Self::Transfer,
    ];

    /// Decodes a wire value. Unknown values collapse to [`Errno::Io`] so a
    /// newer peer's error class still reads as a failure.
    #[must_use]
    pub fn from_wire(value: u8) -> Self {
        Self::ALL.get(usize::from(value)).copied().unwrap_or(Self::Io)
    }

    /// Maps an OS error number onto an error class.
    #[must_use]
    pub fn from_os(code: i32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Perm,
            2 => Self::NoEnt,
            12 => Self::NoMem,
            13 => Self::Acces,
            16 => Self::Busy,
            17 => Self::Exist,
            18 => Self::XDev,
            20 => Self::NotDir,
            21 => Self::IsDir,
            22 => Self::Inval,
            27 => Self::FBig,
            28 => Self::NoSpc,
            29 => Self::SPipe,
            30 => Self::RoFs,
            36 => Self::NameTooLong,
            39 => Self::NotEmpty,
            40 => Self::Loop,
            _ => Self::Io,
        }
    }

    /// The closest OS error number, for surfacing to local callers.
    #[must_use]
    pub const fn to_os(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Perm => 1,
            Self::NoEnt => 2,
            Self::NoMem => 12,
            Self::Acces => 13,
            Self::Busy => 16,
            Self::Exist => 17,
            Self::XDev => 18,
            Self::NotDir => 20,
            Self::IsDir => 21,
            Self::Inval | Self::Version | Self::Transfer => 22,
            Self::FBig => 27,
            Self::NoSpc => 28,
            Self::SPipe => 29,
            Self::RoFs => 30,
            Self::NameTooLong => 36,
            Self::NotEmpty => 39,
            Self::Loop => 40,
            Self::Io => 5,
        }
    }

    /// Short upper-case name, as used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Perm => "PERM",
            Self::NoEnt => "NOENT",
            Self::NoMem => "NOMEM",
            Self::Acces => "ACCES",
            Self::Busy => "BUSY",
            Self::Exist => "EXIST",
            Self::NotDir => "NOTDIR",
            Self::IsDir => "ISDIR",
            Self::Inval => "INVAL",
            Self::FBig => "FBIG",
            Self::NoSpc => "NOSPC",
            Self::RoFs => "ROFS",
            Self::SPipe => "SPIPE",
            Self::NotEmpty => "NOTEMPTY",
            Self::XDev => "XDEV",
            Self::NameTooLong => "NAMETOOLONG",
            Self::Loop => "LOOP",
            Self::Io => "IO",
            Self::Version => "VERSION",
            Self::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Self::from_os(code);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::NoEnt,
            io::ErrorKind::PermissionDenied => Self::Acces,
            io::ErrorKind::AlreadyExists => Self::Exist,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::Inval,
            io::ErrorKind::OutOfMemory => Self::NoMem,
            _ => Self::Io,
        }
    }
}

/// A failed filesystem operation, as reported in a Response.
///
/// Never closes the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{errno}: {message}")]
pub struct OperationError {
    /// Error class.
    pub errno: Errno,
    /// Human-readable context, not sent on the wire.
    pub message: String,
}

impl OperationError {
    /// Creates an error with context.
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

impl From<Errno> for OperationError {
    fn from(errno: Errno) -> Self {
        Self {
            errno,
            message: errno.as_str().to_ascii_lowercase(),
        }
    }
}

impl From<io::Error> for OperationError {
    fn from(err: io::Error) -> Self {
        Self::new(Errno::from(&err), err.to_string())
    }
}

/// Seconds plus nanoseconds since the Unix epoch.
///
/// Carries full nanosecond precision so UTIMENS round-trips exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Whole seconds; negative before 1970.
    pub secs: i64,
    /// Nanoseconds, always `< 1_000_000_000`.
    pub nanos: u32,
}

impl Timestamp {
    /// Creates a timestamp, normalising excess nanoseconds into seconds.
    #[must_use]
    pub const fn new(secs: i64, nanos: u32) -> Self {
        Self {
            secs: secs + (nanos / 1_000_000_000) as i64,
            nanos: nanos % 1_000_000_000,
        }
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Self::new(-(d.as_secs() as i64), 0)
                } else {
                    Self::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(t: Timestamp) -> Self {
        if t.secs >= 0 {
            UNIX_EPOCH + Duration::new(t.secs as u64, t.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(t.secs.unsigned_abs()) + Duration::from_nanos(u64::from(t.nanos))
        }
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// Regular file.
    File = 0,
    /// Directory.
    Directory = 1,
    /// Symbolic link.
    Symlink = 2,
    /// Anything else (fifo, socket, device).
    Other = 3,
}

impl EntryKind {
    /// Decodes a wire value; unknown kinds read as `Other`.
    #[must_use]
    pub const fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::File,
            1 => Self::Directory,
            2 => Self::Symlink,
            _ => Self::Other,
        }
    }

    /// Classifies a `st_mode` value.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        match mode & 0o170_000 {
            0o100_000 => Self::File,
            0o040_000 => Self::Directory,
            0o120_000 => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// One name returned by READDIR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// File name, no path separators.
    pub name: String,
    /// What the name refers to.
    pub kind: EntryKind,
}

/// POSIX stat fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    /// Size in bytes.
    pub size: u64,
    /// Full `st_mode` (type and permission bits).
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Last access.
    pub atime: Timestamp,
    /// Last modification.
    pub mtime: Timestamp,
    /// Last status change.
    pub ctime: Timestamp,
    /// Hard link count.
    pub nlink: u64,
    /// Inode number on the backing store.
    pub inode: u64,
}

impl FileAttributes {
    /// Permission bits only (`mode & 0o7777`).
    #[must_use]
    pub const fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Entry kind derived from the type bits.
    #[must_use]
    pub const fn kind(&self) -> EntryKind {
        EntryKind::from_mode(self.mode)
    }
}

/// Aggregate filesystem statistics, as from `statvfs(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStats {
    /// Filesystem block size.
    pub block_size: u64,
    /// Fragment size.
    pub fragment_size: u64,
    /// Total blocks, in fragment units.
    pub blocks: u64,
    /// Free blocks.
    pub blocks_free: u64,
    /// Free blocks available to unprivileged users.
    pub blocks_available: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub files_free: u64,
    /// Maximum file name length.
    pub name_max: u64,
}

/// Access mask bits for ACCESS, matching `access(2)`.
pub mod access_mask {
    /// Existence only.
    pub const EXISTS: u32 = 0;
    /// Execute / search.
    pub const EXECUTE: u32 = 1;
    /// Write.
    pub const WRITE: u32 = 2;
    /// Read.
    pub const READ: u32 = 4;
}

/// Open flag bits for OPEN, matching the low bits of `open(2)` on Linux.
pub mod open_flags {
    /// Access mode mask.
    pub const ACCMODE: u32 = 0o3;
    /// Read only.
    pub const RDONLY: u32 = 0o0;
    /// Write only.
    pub const WRONLY: u32 = 0o1;
    /// Read and write.
    pub const RDWR: u32 = 0o2;
    /// Truncate on open.
    pub const TRUNC: u32 = 0o1000;
}
