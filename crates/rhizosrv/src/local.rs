//! Local directory backing tree.
//!
//! Serves a real directory. Every operation resolves its path against the
//! canonical root and refuses anything that lands outside it, including
//! through symlinks in intermediate components.

use crate::tree::{BackingTree, StagedWrite, TreePath, TreeResult, STAGING_PREFIX};
use async_trait::async_trait;
use rhizo_common::types::{
    access_mask, open_flags, DirectoryEntry, EntryKind, Errno, FileAttributes, FsStats,
    OperationError, Timestamp,
};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// How the final path component is treated during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Follow {
    /// Operate on the entry itself (lstat, unlink, rename, readlink).
    Entry,
    /// Operate on what the entry points at (read, write, chmod, utimens).
    Target,
}

/// Backing tree over a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDir {
    root: PathBuf,
    read_only: bool,
}

impl LocalDir {
    /// Serves `root`, which must be an existing directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `root` cannot be canonicalized or is not a
    /// directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        if !std::fs::metadata(&root)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self {
            root,
            read_only: false,
        })
    }

    /// Refuses every mutation with ROFS.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The canonical served directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_writable(&self) -> TreeResult<()> {
        if self.read_only {
            return Err(OperationError::new(Errno::RoFs, "served tree is read-only"));
        }
        Ok(())
    }

    fn check_inside(&self, host: &Path, path: &TreePath) -> TreeResult<()> {
        if host.starts_with(&self.root) {
            Ok(())
        } else {
            Err(OperationError::new(
                Errno::Acces,
                format!("{path} resolves outside the served root"),
            ))
        }
    }

    /// Maps a tree path to a host path inside the root.
    ///
    /// The parent directory is canonicalized so symlinked directories cannot
    /// lead outside. With [`Follow::Target`] an existing final symlink is
    /// resolved as well.
    async fn resolve(&self, path: &TreePath, follow: Follow) -> TreeResult<PathBuf> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(self.root.clone());
        };
        let parent_host = fs::canonicalize(self.root.join(parent.as_path())).await?;
        self.check_inside(&parent_host, path)?;
        let host = parent_host.join(name);

        if follow == Follow::Target {
            match fs::canonicalize(&host).await {
                Ok(target) => {
                    self.check_inside(&target, path)?;
                    return Ok(target);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(host)
    }

    /// Staging file for upload `id`, in the directory that will hold
    /// `target` so the final rename never crosses a mount point.
    async fn staging_path(&self, id: u64, target: &TreePath) -> TreeResult<PathBuf> {
        if target.is_root() {
            return Err(OperationError::new(Errno::IsDir, "cannot upload over the served root"));
        }
        let host = self.resolve(target, Follow::Entry).await?;
        let dir = host.parent().unwrap_or(&self.root);
        Ok(dir.join(format!("{STAGING_PREFIX}{id:016x}")))
    }

    async fn lstat_host(host: &Path) -> TreeResult<FileAttributes> {
        let meta = fs::symlink_metadata(host).await?;
        Ok(metadata_to_attributes(&meta))
    }
}

fn metadata_to_attributes(meta: &std::fs::Metadata) -> FileAttributes {
    FileAttributes {
        size: meta.size(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        nlink: meta.nlink(),
        inode: meta.ino(),
    }
}

fn timestamp(secs: i64, nanos: i64) -> Timestamp {
    Timestamp::new(secs, u32::try_from(nanos).unwrap_or(0))
}

fn to_timespec(t: Timestamp) -> rustix::fs::Timespec {
    rustix::fs::Timespec {
        tv_sec: t.secs,
        tv_nsec: i64::from(t.nanos) as _,
    }
}

/// Runs a blocking syscall off the async workers.
async fn blocking<T, F>(f: F) -> TreeResult<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OperationError::new(Errno::Io, format!("blocking task failed: {e}")))?
        .map_err(OperationError::from)
}

fn path_to_string(path: PathBuf) -> TreeResult<String> {
    path.into_os_string()
        .into_string()
        .map_err(|_| OperationError::new(Errno::Inval, "link target is not valid UTF-8"))
}

#[async_trait]
impl BackingTree for LocalDir {
    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn stat(&self, path: &TreePath) -> TreeResult<FileAttributes> {
        let host = self.resolve(path, Follow::Entry).await?;
        Self::lstat_host(&host).await
    }

    async fn list(&self, path: &TreePath) -> TreeResult<Vec<DirectoryEntry>> {
        let host = self.resolve(path, Follow::Target).await?;
        let mut dir = fs::read_dir(&host).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            entries.push(DirectoryEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir(&self, path: &TreePath, mode: u32) -> TreeResult<FileAttributes> {
        use std::os::unix::fs::DirBuilderExt;

        self.check_writable()?;
        let host = self.resolve(path, Follow::Entry).await?;
        let target = host.clone();
        blocking(move || std::fs::DirBuilder::new().mode(mode & 0o7777).create(target)).await?;
        fs::set_permissions(&host, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        Self::lstat_host(&host).await
    }

    async fn remove_dir(&self, path: &TreePath) -> TreeResult<()> {
        self.check_writable()?;
        if path.is_root() {
            return Err(OperationError::new(Errno::Busy, "cannot remove the served root"));
        }
        let host = self.resolve(path, Follow::Entry).await?;
        fs::remove_dir(&host).await?;
        Ok(())
    }

    async fn create_file(&self, path: &TreePath, mode: u32) -> TreeResult<FileAttributes> {
        self.check_writable()?;
        let host = self.resolve(path, Follow::Entry).await?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&host)
            .await?;
        // The umask may have cleared bits the client asked for.
        file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))
            .await?;
        Ok(metadata_to_attributes(&file.metadata().await?))
    }

    async fn remove_file(&self, path: &TreePath) -> TreeResult<()> {
        self.check_writable()?;
        let host = self.resolve(path, Follow::Entry).await?;
        fs::remove_file(&host).await?;
        Ok(())
    }

    async fn rename(&self, from: &TreePath, to: &TreePath) -> TreeResult<()> {
        self.check_writable()?;
        if from.is_root() || to.is_root() {
            return Err(OperationError::new(Errno::Busy, "cannot rename the served root"));
        }
        let from_host = self.resolve(from, Follow::Entry).await?;
        let to_host = self.resolve(to, Follow::Entry).await?;
        fs::rename(&from_host, &to_host).await?;
        Ok(())
    }

    async fn link(&self, existing: &TreePath, new: &TreePath) -> TreeResult<FileAttributes> {
        self.check_writable()?;
        let existing_host = self.resolve(existing, Follow::Entry).await?;
        let new_host = self.resolve(new, Follow::Entry).await?;
        fs::hard_link(&existing_host, &new_host).await?;
        Self::lstat_host(&new_host).await
    }

    async fn symlink(&self, target: &str, path: &TreePath) -> TreeResult<FileAttributes> {
        self.check_writable()?;
        if target.is_empty() || target.contains('\0') {
            return Err(OperationError::new(Errno::Inval, "invalid symlink target"));
        }
        let host = self.resolve(path, Follow::Entry).await?;
        fs::symlink(target, &host).await?;
        Self::lstat_host(&host).await
    }

    async fn read_link(&self, path: &TreePath) -> TreeResult<String> {
        let host = self.resolve(path, Follow::Entry).await?;
        path_to_string(fs::read_link(&host).await?)
    }

    async fn read(&self, path: &TreePath, offset: u64, len: usize) -> TreeResult<Vec<u8>> {
        let host = self.resolve(path, Follow::Target).await?;
        let mut file = fs::File::open(&host).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &TreePath, offset: u64, data: &[u8]) -> TreeResult<u64> {
        self.check_writable()?;
        let host = self.resolve(path, Follow::Target).await?;
        let mut file = fs::OpenOptions::new().write(true).open(&host).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn truncate(&self, path: &TreePath, size: u64) -> TreeResult<FileAttributes> {
        self.check_writable()?;
        let host = self.resolve(path, Follow::Target).await?;
        let file = fs::OpenOptions::new().write(true).open(&host).await?;
        file.set_len(size).await?;
        Ok(metadata_to_attributes(&file.metadata().await?))
    }

    async fn set_times(
        &self,
        path: &TreePath,
        atime: Option<Timestamp>,
        mtime: Option<Timestamp>,
    ) -> TreeResult<FileAttributes> {
        self.check_writable()?;
        let host = self.resolve(path, Follow::Target).await?;
        let current = Self::lstat_host(&host).await?;
        let times = rustix::fs::Timestamps {
            last_access: to_timespec(atime.unwrap_or(current.atime)),
            last_modification: to_timespec(mtime.unwrap_or(current.mtime)),
        };
        let target = host.clone();
        blocking(move || {
            rustix::fs::utimensat(rustix::fs::CWD, &target, &times, rustix::fs::AtFlags::empty())
                .map_err(io::Error::from)
        })
        .await?;
        Self::lstat_host(&host).await
    }

    async fn set_mode(&self, path: &TreePath, mode: u32) -> TreeResult<FileAttributes> {
        self.check_writable()?;
        let host = self.resolve(path, Follow::Target).await?;
        fs::set_permissions(&host, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        Self::lstat_host(&host).await
    }

    async fn fs_stats(&self) -> TreeResult<FsStats> {
        let root = self.root.clone();
        let stat = blocking(move || rustix::fs::statvfs(&root).map_err(io::Error::from)).await?;
        Ok(FsStats {
            block_size: stat.f_bsize,
            fragment_size: stat.f_frsize,
            blocks: stat.f_blocks,
            blocks_free: stat.f_bfree,
            blocks_available: stat.f_bavail,
            files: stat.f_files,
            files_free: stat.f_ffree,
            name_max: stat.f_namemax,
        })
    }

    async fn access(&self, path: &TreePath, mask: u32) -> TreeResult<()> {
        use rustix::fs::Access;

        if mask & access_mask::WRITE != 0 {
            self.check_writable()?;
        }
        let host = self.resolve(path, Follow::Target).await?;
        let mut access = Access::EXISTS;
        if mask & access_mask::READ != 0 {
            access |= Access::READ_OK;
        }
        if mask & access_mask::WRITE != 0 {
            access |= Access::WRITE_OK;
        }
        if mask & access_mask::EXECUTE != 0 {
            access |= Access::EXEC_OK;
        }
        blocking(move || {
            rustix::fs::accessat(rustix::fs::CWD, &host, access, rustix::fs::AtFlags::empty())
                .map_err(io::Error::from)
        })
        .await
    }

    async fn open(&self, path: &TreePath, flags: u32) -> TreeResult<()> {
        let (read, write) = match flags & open_flags::ACCMODE {
            open_flags::RDONLY => (true, false),
            open_flags::WRONLY => (false, true),
            open_flags::RDWR => (true, true),
            other => {
                return Err(OperationError::new(
                    Errno::Inval,
                    format!("invalid access mode {other:#o}"),
                ))
            }
        };
        let truncate = flags & open_flags::TRUNC != 0;
        if write || truncate {
            self.check_writable()?;
        }
        let host = self.resolve(path, Follow::Target).await?;
        if fs::metadata(&host).await?.is_dir() && write {
            return Err(Errno::IsDir.into());
        }
        let file = fs::OpenOptions::new()
            .read(read)
            .write(write || truncate)
            .open(&host)
            .await?;
        if truncate {
            file.set_len(0).await?;
        }
        Ok(())
    }

    async fn stage(&self, id: u64, target: &TreePath) -> TreeResult<Box<dyn StagedWrite>> {
        self.check_writable()?;
        let path = self.staging_path(id, target).await?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "staging file created");
        Ok(Box::new(LocalStaged {
            tree: self.clone(),
            path,
            file,
        }))
    }
}

/// Staging file beside its target.
#[derive(Debug)]
struct LocalStaged {
    tree: LocalDir,
    path: PathBuf,
    file: fs::File,
}

#[async_trait]
impl StagedWrite for LocalStaged {
    async fn append(&mut self, data: &[u8]) -> TreeResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>, target: &TreePath, mode: u32) -> TreeResult<FileAttributes> {
        let Self { tree, path, mut file } = *self;
        let result = async {
            if target.is_root() {
                return Err(OperationError::new(Errno::IsDir, "cannot replace the served root"));
            }
            file.flush().await?;
            file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))
                .await?;
            file.sync_all().await?;
            let host = tree.resolve(target, Follow::Entry).await?;
            fs::rename(&path, &host).await?;
            LocalDir::lstat_host(&host).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove staging file");
                }
            }
        }
        result
    }

    async fn discard(self: Box<Self>) -> TreeResult<()> {
        let Self { path, file, .. } = *self;
        drop(file);
        fs::remove_file(&path).await?;
        debug!(path = %path.display(), "staging file removed");
        Ok(())
    }
}
