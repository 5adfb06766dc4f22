//! Staged bulk uploads.
//!
//! TRANSFER_BEGIN opens a staging file, TRANSFER_CHUNK appends to it at
//! strictly increasing offsets, TRANSFER_COMMIT moves it over the target.
//! Until commit the target keeps its previous content, so an abandoned
//! upload (abort, timeout or disconnect) never leaves a torn file behind.

use crate::tree::{BackingTree, StagedWrite, TreePath};
use rand::rngs::OsRng;
use rand::RngCore;
use rhizo_common::types::{Errno, OperationError, CHUNK_SIZE};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One upload in progress.
#[derive(Debug)]
pub struct Transfer {
    /// Final destination.
    pub target: TreePath,
    /// Permission bits applied on commit.
    pub mode: u32,
    /// Staging file.
    pub staged: Box<dyn StagedWrite>,
    /// Bytes accepted so far; the only offset the next chunk may carry.
    pub next_offset: u64,
    last_activity: Instant,
}

/// Open uploads of one session.
#[derive(Debug)]
pub struct TransferTable {
    entries: HashMap<u64, Transfer>,
    timeout: Duration,
    max_open: usize,
}

fn unknown(id: u64) -> OperationError {
    OperationError::new(Errno::Transfer, format!("unknown transfer {id:#x}"))
}

impl TransferTable {
    /// Creates an empty table holding at most `max_open` uploads; uploads
    /// idle longer than `timeout` expire.
    #[must_use]
    pub fn new(timeout: Duration, max_open: usize) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            max_open,
        }
    }

    /// Number of open uploads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no upload is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens an upload to `target` and returns its id.
    ///
    /// # Errors
    ///
    /// BUSY when the session already has `max_open` uploads, otherwise
    /// whatever the backing tree reports when creating the staging file.
    pub async fn begin(
        &mut self,
        tree: &dyn BackingTree,
        target: TreePath,
        mode: u32,
    ) -> Result<u64, OperationError> {
        if self.entries.len() >= self.max_open {
            return Err(OperationError::new(
                Errno::Busy,
                format!("{} uploads already open", self.entries.len()),
            ));
        }
        let id = loop {
            let candidate = OsRng.next_u64();
            if candidate != 0 && !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let staged = tree.stage(id, &target).await?;
        debug!(transfer = id, target = %target, "transfer started");
        self.entries.insert(
            id,
            Transfer {
                target,
                mode,
                staged,
                next_offset: 0,
                last_activity: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Appends one chunk and returns the new total length.
    ///
    /// # Errors
    ///
    /// TRANSFER for an unknown id or a chunk not at the expected offset
    /// (the upload stays open), INVAL for an oversized chunk, otherwise the
    /// staging write error, which also aborts the upload.
    pub async fn chunk(&mut self, id: u64, offset: u64, data: &[u8]) -> Result<u64, OperationError> {
        if data.len() > CHUNK_SIZE {
            return Err(OperationError::new(
                Errno::Inval,
                format!("chunk of {} bytes exceeds {CHUNK_SIZE}", data.len()),
            ));
        }
        let transfer = self.entries.get_mut(&id).ok_or_else(|| unknown(id))?;
        if offset != transfer.next_offset {
            return Err(OperationError::new(
                Errno::Transfer,
                format!(
                    "transfer {id:#x}: chunk at offset {offset}, expected {}",
                    transfer.next_offset
                ),
            ));
        }
        if let Err(e) = transfer.staged.append(data).await {
            warn!(transfer = id, error = %e, "staging write failed, aborting transfer");
            self.discard(id).await;
            return Err(e);
        }
        transfer_bytes(data.len());
        let transfer = self.entries.get_mut(&id).ok_or_else(|| unknown(id))?;
        transfer.next_offset += data.len() as u64;
        transfer.last_activity = Instant::now();
        Ok(transfer.next_offset)
    }

    /// Removes an upload for committing.
    ///
    /// When `expected_size` is given it must equal the bytes received;
    /// otherwise the upload stays open and TRANSFER is returned.
    ///
    /// # Errors
    ///
    /// TRANSFER for an unknown id or a size mismatch.
    pub fn take(&mut self, id: u64, expected_size: Option<u64>) -> Result<Transfer, OperationError> {
        let transfer = self.entries.get(&id).ok_or_else(|| unknown(id))?;
        if let Some(expected) = expected_size {
            if expected != transfer.next_offset {
                return Err(OperationError::new(
                    Errno::Transfer,
                    format!(
                        "transfer {id:#x}: received {} bytes, commit expects {expected}",
                        transfer.next_offset
                    ),
                ));
            }
        }
        self.entries.remove(&id).ok_or_else(|| unknown(id))
    }

    /// Abandons an upload and deletes its staging file.
    ///
    /// # Errors
    ///
    /// TRANSFER for an unknown id.
    pub async fn abort(&mut self, id: u64) -> Result<(), OperationError> {
        if !self.entries.contains_key(&id) {
            return Err(unknown(id));
        }
        self.discard(id).await;
        Ok(())
    }

    /// Aborts uploads idle longer than the timeout; returns how many.
    pub async fn expire(&mut self) -> usize {
        let now = Instant::now();
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, t)| now.duration_since(t.last_activity) >= self.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            info!(transfer = id, "transfer timed out");
            self.discard(*id).await;
        }
        stale.len()
    }

    /// Aborts every open upload. Called when the session ends.
    pub async fn abort_all(&mut self) {
        let ids: Vec<u64> = self.entries.keys().copied().collect();
        for id in ids {
            debug!(transfer = id, "aborting transfer at session end");
            self.discard(id).await;
        }
    }

    async fn discard(&mut self, id: u64) {
        if let Some(transfer) = self.entries.remove(&id) {
            if let Err(e) = transfer.staged.discard().await {
                warn!(transfer = id, error = %e, "failed to remove staging file");
            }
        }
    }
}

fn transfer_bytes(len: usize) {
    crate::metrics::counters::bulk_bytes_total("upload", len as u64);
}
