//! The backing directory tree the RPC handlers translate onto.
//!
//! Handlers never see host paths. They work with [`TreePath`], a
//! normalized path relative to the served root that cannot name anything
//! above it, and talk to storage only through [`BackingTree`].

use async_trait::async_trait;
use rhizo_common::types::{
    DirectoryEntry, Errno, FileAttributes, FsStats, OperationError, Timestamp,
};
use std::fmt;
use std::path::{Path, PathBuf};

/// Result type for every backing tree operation.
pub type TreeResult<T> = Result<T, OperationError>;

/// Name prefix of staging files used by bulk uploads. Hidden from listings
/// at every depth and unreachable through client paths.
pub const STAGING_PREFIX: &str = ".rhizo-transfer-";

const NAME_MAX: usize = 255;

/// A normalized path inside the served tree. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TreePath(PathBuf);

impl TreePath {
    /// The served root.
    #[must_use]
    pub fn root() -> Self {
        Self(PathBuf::new())
    }

    /// Normalizes a client-supplied path.
    ///
    /// Leading slashes and `.` components are dropped and `..` is resolved
    /// lexically. Climbing above the root is refused with ACCES, as is any
    /// component naming a staging file.
    ///
    /// # Errors
    ///
    /// Returns INVAL for embedded NUL bytes, NAMETOOLONG for oversized
    /// components, and ACCES for paths escaping the root.
    pub fn parse(wire: &str) -> TreeResult<Self> {
        if wire.contains('\0') {
            return Err(OperationError::new(Errno::Inval, "path contains NUL"));
        }
        let mut parts: Vec<&str> = Vec::new();
        for part in wire.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(OperationError::new(
                            Errno::Acces,
                            format!("{wire} escapes the served root"),
                        ));
                    }
                }
                name if name.len() > NAME_MAX => {
                    return Err(OperationError::new(Errno::NameTooLong, name.to_string()));
                }
                name if name.starts_with(STAGING_PREFIX) => {
                    return Err(OperationError::new(Errno::Acces, "reserved name"));
                }
                name => parts.push(name),
            }
        }
        Ok(Self(parts.iter().collect()))
    }

    /// Whether this is the served root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// The containing directory; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self(self.0.parent().map(Path::to_path_buf).unwrap_or_default()))
    }

    /// Last component, if any.
    #[must_use]
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.0.file_name()
    }

    /// The relative path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.display())
    }
}

/// A staging file receiving the chunks of one bulk upload.
#[async_trait]
pub trait StagedWrite: Send + fmt::Debug {
    /// Appends bytes at the current end.
    async fn append(&mut self, data: &[u8]) -> TreeResult<()>;

    /// Flushes to stable storage and atomically replaces `target`.
    async fn commit(self: Box<Self>, target: &TreePath, mode: u32) -> TreeResult<FileAttributes>;

    /// Removes the staging file. The target is untouched.
    async fn discard(self: Box<Self>) -> TreeResult<()>;
}

/// Storage the server exposes. Paths are already normalized.
///
/// Mutations follow POSIX semantics of the underlying store; callers are
/// responsible for serializing conflicting operations on the same path.
#[async_trait]
pub trait BackingTree: Send + Sync + fmt::Debug {
    /// Whether every mutation is refused with ROFS.
    fn read_only(&self) -> bool;

    /// Attributes of `path` without following a final symlink.
    async fn stat(&self, path: &TreePath) -> TreeResult<FileAttributes>;

    /// Entries of a directory, staging files excluded.
    async fn list(&self, path: &TreePath) -> TreeResult<Vec<DirectoryEntry>>;

    /// Creates a directory with the given permission bits.
    async fn create_dir(&self, path: &TreePath, mode: u32) -> TreeResult<FileAttributes>;

    /// Removes an empty directory.
    async fn remove_dir(&self, path: &TreePath) -> TreeResult<()>;

    /// Creates a new regular file; EXIST if anything is there.
    async fn create_file(&self, path: &TreePath, mode: u32) -> TreeResult<FileAttributes>;

    /// Removes a non-directory entry.
    async fn remove_file(&self, path: &TreePath) -> TreeResult<()>;

    /// Atomically renames `from` to `to`.
    async fn rename(&self, from: &TreePath, to: &TreePath) -> TreeResult<()>;

    /// Creates a hard link `new` to `existing`.
    async fn link(&self, existing: &TreePath, new: &TreePath) -> TreeResult<FileAttributes>;

    /// Creates a symlink at `path` whose content is `target`.
    async fn symlink(&self, target: &str, path: &TreePath) -> TreeResult<FileAttributes>;

    /// Content of a symlink.
    async fn read_link(&self, path: &TreePath) -> TreeResult<String>;

    /// Up to `len` bytes at `offset`; shorter at end of file.
    async fn read(&self, path: &TreePath, offset: u64, len: usize) -> TreeResult<Vec<u8>>;

    /// Writes `data` at `offset`, returning bytes written.
    async fn write(&self, path: &TreePath, offset: u64, data: &[u8]) -> TreeResult<u64>;

    /// Resizes a file, zero-padding when growing.
    async fn truncate(&self, path: &TreePath, size: u64) -> TreeResult<FileAttributes>;

    /// Sets access and modification times; `None` leaves a time unchanged.
    async fn set_times(
        &self,
        path: &TreePath,
        atime: Option<Timestamp>,
        mtime: Option<Timestamp>,
    ) -> TreeResult<FileAttributes>;

    /// Sets permission bits only.
    async fn set_mode(&self, path: &TreePath, mode: u32) -> TreeResult<FileAttributes>;

    /// Aggregate statistics of the store.
    async fn fs_stats(&self) -> TreeResult<FsStats>;

    /// Checks an access mask (see `access_mask`) for the server process.
    async fn access(&self, path: &TreePath, mask: u32) -> TreeResult<()>;

    /// Checks that `path` can be opened with `flags` (see `open_flags`).
    async fn open(&self, path: &TreePath, flags: u32) -> TreeResult<()>;

    /// Creates a staging file for upload `id`, on the same filesystem as
    /// `target` so that commit can rename it into place.
    async fn stage(&self, id: u64, target: &TreePath) -> TreeResult<Box<dyn StagedWrite>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_slashes_and_dots() {
        let p = TreePath::parse("//a/./b/").unwrap();
        assert_eq!(p.as_path(), Path::new("a/b"));
        assert_eq!(p.to_string(), "/a/b");
        assert!(TreePath::parse("/").unwrap().is_root());
        assert!(TreePath::parse("").unwrap().is_root());
    }

    #[test]
    fn parse_resolves_parent_components() {
        let p = TreePath::parse("/a/b/../c").unwrap();
        assert_eq!(p.as_path(), Path::new("a/c"));
        assert!(TreePath::parse("a/..").unwrap().is_root());
    }

    #[test]
    fn parse_refuses_escape() {
        let err = TreePath::parse("/../etc/passwd").unwrap_err();
        assert_eq!(err.errno, Errno::Acces);
        let err = TreePath::parse("a/../../b").unwrap_err();
        assert_eq!(err.errno, Errno::Acces);
    }

    #[test]
    fn parse_refuses_staging_names_and_nul() {
        assert_eq!(
            TreePath::parse(&format!("/{STAGING_PREFIX}0001")).unwrap_err().errno,
            Errno::Acces
        );
        assert_eq!(TreePath::parse("a\0b").unwrap_err().errno, Errno::Inval);
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(TreePath::parse(&long).unwrap_err().errno, Errno::NameTooLong);
    }

    #[test]
    fn parent_chain_ends_at_root() {
        let p = TreePath::parse("a/b").unwrap();
        let parent = p.parent().unwrap();
        assert_eq!(parent.as_path(), Path::new("a"));
        let root = parent.parent().unwrap();
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_wire_path() -> impl Strategy<Value = String> {
        let component = prop_oneof![
            Just("..".to_string()),
            Just(".".to_string()),
            Just(String::new()),
            "[a-z.]{1,6}",
        ];
        prop::collection::vec(component, 0..10).prop_map(|parts| parts.join("/"))
    }

    /// Depth of a wire path walked component by component; negative once
    /// it has climbed above the root.
    fn lowest_depth(wire: &str) -> i32 {
        let mut depth = 0;
        let mut lowest = 0;
        for part in wire.split('/') {
            match part {
                "" | "." => {}
                ".." => depth -= 1,
                _ => depth += 1,
            }
            lowest = lowest.min(depth);
        }
        lowest
    }

    proptest! {
        #[test]
        fn parsed_paths_never_leave_the_root(wire in arb_wire_path()) {
            match TreePath::parse(&wire) {
                Ok(path) => {
                    prop_assert!(lowest_depth(&wire) >= 0);
                    prop_assert!(path.as_path().is_relative());
                    prop_assert!(path
                        .as_path()
                        .components()
                        .all(|c| matches!(c, std::path::Component::Normal(_))));
                }
                Err(err) => {
                    prop_assert!(lowest_depth(&wire) < 0);
                    prop_assert_eq!(err.errno, Errno::Acces);
                }
            }
        }

        #[test]
        fn display_form_parses_to_itself(wire in arb_wire_path()) {
            if let Ok(path) = TreePath::parse(&wire) {
                let again = TreePath::parse(&path.to_string()).unwrap();
                prop_assert_eq!(again, path);
            }
        }
    }
}
