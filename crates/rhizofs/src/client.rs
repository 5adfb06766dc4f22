//! Typed client for the rhizofs protocol.
//!
//! One [`Client`] owns one session and issues one request at a time; each
//! call waits for the matching response before returning. Payloads are sent
//! compressed once a response shows the server can inflate them.

use crate::config::ClientConfig;
use crate::error::ClientError;
use rhizo_common::session::{Session, SessionState};
use rhizo_common::transport::TransportContext;
use rhizo_common::types::{
    DirectoryEntry, Errno, FileAttributes, FsStats, OperationError, Timestamp, CHUNK_SIZE,
};
use rhizo_common::wire::{Compression, Operation, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// A time argument for [`Client::utimens`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetTime {
    /// Leave the time unchanged.
    #[default]
    Omit,
    /// The client's current time.
    Now,
    /// An explicit time.
    At(Timestamp),
}

impl SetTime {
    fn resolve(self, now: Timestamp) -> Option<Timestamp> {
        match self {
            Self::Omit => None,
            Self::Now => Some(now),
            Self::At(t) => Some(t),
        }
    }
}

/// An established session with typed request methods.
#[derive(Debug)]
pub struct Client {
    session: Session,
    sequence: u64,
    compression: Compression,
}

fn missing(what: &'static str) -> ClientError {
    ClientError::UnexpectedResponse(what)
}

impl Client {
    /// Connects and completes the handshake described by `config`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] for unusable settings, otherwise
    /// [`ClientError::Session`]; see
    /// [`ClientError::is_authorization_denied`].
    pub async fn connect(ctx: &TransportContext, config: &ClientConfig) -> Result<Self, ClientError> {
        let endpoint = config.endpoint()?;
        let security = config.security()?;
        let session = Session::connect(ctx, &endpoint, &security).await?;
        debug!(endpoint = %endpoint, encrypted = session.is_encrypted(), "connected");
        Ok(Self::from_session(session))
    }

    /// Wraps an already established session.
    #[must_use]
    pub fn from_session(session: Session) -> Self {
        Self {
            session,
            sequence: 0,
            compression: Compression::None,
        }
    }

    /// Whether the session is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.state() == SessionState::Established
    }

    /// Whether the session is encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.session.is_encrypted()
    }

    /// Payload encoding used for outgoing requests, learned from the
    /// server's last response.
    #[must_use]
    pub const fn compression(&self) -> Compression {
        self.compression
    }

    /// Sends one request and returns its successful response.
    ///
    /// # Errors
    ///
    /// [`ClientError::Operation`] when the server answers with an errno;
    /// session, codec and sequence failures otherwise. After a sequence
    /// mismatch the session is closed.
    pub async fn call(&mut self, mut req: Request) -> Result<Response, ClientError> {
        self.sequence += 1;
        req.sequence = self.sequence;
        self.session.send(&req.encode_with(self.compression)?).await?;

        let bytes = self
            .session
            .recv()
            .await?
            .ok_or(ClientError::UnexpectedResponse("session closed by server"))?;
        let resp = Response::decode(&bytes)?;
        self.compression = Compression::for_peer(resp.version);

        if resp.sequence != req.sequence {
            warn!(expected = req.sequence, actual = resp.sequence, "response out of sequence");
            self.session.close().await;
            return Err(ClientError::SequenceMismatch {
                expected: req.sequence,
                actual: resp.sequence,
            });
        }
        if resp.op != req.op {
            return Err(missing("response for another operation"));
        }
        if resp.errno != Errno::None {
            let message = req.path.as_deref().unwrap_or_default().to_string();
            return Err(ClientError::Operation {
                op: req.op,
                source: OperationError::new(resp.errno, message),
            });
        }
        Ok(resp)
    }

    async fn attributes(&mut self, req: Request) -> Result<FileAttributes, ClientError> {
        self.call(req).await?.attributes.ok_or_else(|| missing("no attributes"))
    }

    /// Round-trip with no effect.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.call(Request::new(Operation::Ping)).await.map(drop)
    }

    /// Attributes of `path`, without following a final symlink.
    pub async fn stat(&mut self, path: &str) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::Stat).with_path(path)).await
    }

    /// Entries of the directory `path`, sorted by name.
    ///
    /// Directories too large for one response are fetched page by page.
    pub async fn read_dir(&mut self, path: &str) -> Result<Vec<DirectoryEntry>, ClientError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        loop {
            let mut req = Request::new(Operation::ReadDir).with_path(path);
            if offset > 0 {
                req = req.with_offset(offset);
            }
            let resp = self.call(req).await?;
            entries.extend(resp.entries);
            match resp.offset {
                Some(next) if next > offset => offset = next,
                Some(_) => return Err(missing("directory listing did not advance")),
                None => return Ok(entries),
            }
        }
    }

    /// Creates a directory with exactly `mode`.
    pub async fn mkdir(&mut self, path: &str, mode: u32) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::MkDir).with_path(path).with_mode(mode))
            .await
    }

    /// Removes an empty directory.
    pub async fn rmdir(&mut self, path: &str) -> Result<(), ClientError> {
        self.call(Request::new(Operation::RmDir).with_path(path)).await.map(drop)
    }

    /// Removes a file or symlink.
    pub async fn unlink(&mut self, path: &str) -> Result<(), ClientError> {
        self.call(Request::new(Operation::Unlink).with_path(path)).await.map(drop)
    }

    /// Hard-links `new` to the existing file `existing`.
    pub async fn link(&mut self, existing: &str, new: &str) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::Link).with_path(new).with_target(existing))
            .await
    }

    /// Creates a symlink at `path` whose content is `target`.
    pub async fn symlink(&mut self, target: &str, path: &str) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::Symlink).with_path(path).with_target(target))
            .await
    }

    /// Content of the symlink `path`.
    pub async fn read_link(&mut self, path: &str) -> Result<String, ClientError> {
        self.call(Request::new(Operation::ReadLink).with_path(path))
            .await?
            .target
            .ok_or_else(|| missing("no link target"))
    }

    /// Moves `from` to `to`, replacing a compatible `to`.
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), ClientError> {
        self.call(Request::new(Operation::Rename).with_path(from).with_target(to))
            .await
            .map(drop)
    }

    /// Sets the length of a file, zero-filling when it grows.
    pub async fn truncate(&mut self, path: &str, size: u64) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::Truncate).with_path(path).with_size(size))
            .await
    }

    /// Sets permission bits.
    pub async fn chmod(&mut self, path: &str, mode: u32) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::Chmod).with_path(path).with_mode(mode))
            .await
    }

    /// Sets access and modification times at nanosecond precision.
    ///
    /// [`SetTime::Now`] is resolved on this side.
    pub async fn utimens(
        &mut self,
        path: &str,
        atime: SetTime,
        mtime: SetTime,
    ) -> Result<FileAttributes, ClientError> {
        let now = Timestamp::now();
        self.attributes(
            Request::new(Operation::Utimens)
                .with_path(path)
                .with_times(atime.resolve(now), mtime.resolve(now)),
        )
        .await
    }

    /// Statistics of the filesystem holding the served tree.
    pub async fn statfs(&mut self) -> Result<FsStats, ClientError> {
        self.call(Request::new(Operation::StatFs))
            .await?
            .stats
            .ok_or_else(|| missing("no statistics"))
    }

    /// Checks `mask` (see `access_mask`) against `path`.
    pub async fn access(&mut self, path: &str, mask: u32) -> Result<(), ClientError> {
        self.call(Request::new(Operation::Access).with_path(path).with_mode(mask))
            .await
            .map(drop)
    }

    /// Checks that `path` can be opened with `flags` (see `open_flags`).
    pub async fn open(&mut self, path: &str, flags: u32) -> Result<(), ClientError> {
        self.call(Request::new(Operation::Open).with_path(path).with_mode(flags))
            .await
            .map(drop)
    }

    /// Creates an empty file with exactly `mode`; EXIST if present.
    pub async fn create(&mut self, path: &str, mode: u32) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::Create).with_path(path).with_mode(mode))
            .await
    }

    /// Creates a node; only regular files are supported.
    pub async fn mknod(&mut self, path: &str, mode: u32) -> Result<FileAttributes, ClientError> {
        self.attributes(Request::new(Operation::MkNod).with_path(path).with_mode(mode))
            .await
    }

    /// Reads up to `size` bytes (at most [`CHUNK_SIZE`]) at `offset`.
    pub async fn read(&mut self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, ClientError> {
        Ok(self
            .call(
                Request::new(Operation::Read)
                    .with_path(path)
                    .with_offset(offset)
                    .with_size(size),
            )
            .await?
            .payload
            .unwrap_or_default())
    }

    /// Writes `data` (at most [`CHUNK_SIZE`]) at `offset`; returns bytes written.
    pub async fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<u64, ClientError> {
        self.call(
            Request::new(Operation::Write)
                .with_path(path)
                .with_offset(offset)
                .with_payload(data.to_vec()),
        )
        .await?
        .size
        .ok_or_else(|| missing("no write size"))
    }

    /// Opens a staged upload to `path`; returns its transfer id.
    pub async fn transfer_begin(&mut self, path: &str, mode: u32) -> Result<u64, ClientError> {
        self.call(Request::new(Operation::TransferBegin).with_path(path).with_mode(mode))
            .await?
            .transfer
            .ok_or_else(|| missing("no transfer id"))
    }

    /// Sends the chunk that starts at `offset`.
    pub async fn transfer_chunk(&mut self, id: u64, offset: u64, data: &[u8]) -> Result<(), ClientError> {
        self.call(
            Request::new(Operation::TransferChunk)
                .with_transfer(id)
                .with_offset(offset)
                .with_payload(data.to_vec()),
        )
        .await
        .map(drop)
    }

    /// Publishes the upload; `size`, when given, must match the bytes sent.
    pub async fn transfer_commit(&mut self, id: u64, size: Option<u64>) -> Result<FileAttributes, ClientError> {
        let mut req = Request::new(Operation::TransferCommit).with_transfer(id);
        if let Some(size) = size {
            req = req.with_size(size);
        }
        self.attributes(req).await
    }

    /// Abandons the upload; the target is left as it was.
    pub async fn transfer_abort(&mut self, id: u64) -> Result<(), ClientError> {
        self.call(Request::new(Operation::TransferAbort).with_transfer(id))
            .await
            .map(drop)
    }

    /// Copies the whole file at `path` into `out`; returns bytes copied.
    ///
    /// # Errors
    ///
    /// Any request failure, or [`ClientError::Io`] if writing `out` fails.
    pub async fn download<W>(&mut self, path: &str, out: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut offset = 0u64;
        loop {
            let chunk = self.read(path, offset, CHUNK_SIZE as u64).await?;
            out.write_all(&chunk).await?;
            offset += chunk.len() as u64;
            if chunk.len() < CHUNK_SIZE {
                break;
            }
        }
        out.flush().await?;
        debug!(path, bytes = offset, "download finished");
        Ok(offset)
    }

    /// Streams `input` to `path` as a staged upload with permission `mode`.
    ///
    /// The target is replaced only once everything has arrived. A local
    /// read error aborts the upload.
    ///
    /// # Errors
    ///
    /// Any request failure, or [`ClientError::Io`] if reading `input` fails.
    pub async fn upload<R>(&mut self, path: &str, input: &mut R, mode: u32) -> Result<FileAttributes, ClientError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let id = self.transfer_begin(path, mode).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let filled = match fill(input, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(path, transfer = id, error = %e, "local read failed, aborting upload");
                    if let Err(abort) = self.transfer_abort(id).await {
                        debug!(transfer = id, error = %abort, "abort after read error failed");
                    }
                    return Err(e.into());
                }
            };
            if filled == 0 {
                break;
            }
            self.transfer_chunk(id, offset, &buf[..filled]).await?;
            offset += filled as u64;
            if filled < buf.len() {
                break;
            }
        }
        let attributes = self.transfer_commit(id, Some(offset)).await?;
        debug!(path, bytes = offset, transfer = id, "upload committed");
        Ok(attributes)
    }

    /// Closes the session.
    pub async fn close(mut self) {
        self.session.close().await;
    }
}

/// Reads until `buf` is full or `input` ends.
async fn fill<R>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_time_resolution() {
        let now = Timestamp::new(100, 5);
        let at = Timestamp::new(7, 8);
        assert_eq!(SetTime::Omit.resolve(now), None);
        assert_eq!(SetTime::Now.resolve(now), Some(now));
        assert_eq!(SetTime::At(at).resolve(now), Some(at));
    }

    #[tokio::test]
    async fn fill_reads_across_short_reads() {
        let data = vec![7u8; 10];
        let (mut tx, mut rx) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            tx.write_all(&data).await.unwrap();
        });
        let mut buf = [0u8; 8];
        assert_eq!(fill(&mut rx, &mut buf).await.unwrap(), 8);
        writer.await.unwrap();
        assert_eq!(fill(&mut rx, &mut buf).await.unwrap(), 2);
        assert_eq!(fill(&mut rx, &mut buf).await.unwrap(), 0);
    }
}
