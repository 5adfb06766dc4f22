//! Request dispatcher.
//!
//! Every decoded request gets exactly one response. Handler failures, and
//! panics, become an errno in that response; only a message without a
//! usable header is reported back to the caller as fatal. A response too
//! large to encode is replaced by a bare FBIG answer.

use crate::locks::{change_entry, modify_path, read_path, LockMode};
use crate::metrics::{counters, histograms};
use crate::server::ServerState;
use crate::transfer::TransferTable;
use crate::tree::{TreePath, TreeResult};
use futures_util::FutureExt;
use rhizo_common::types::{
    access_mask, open_flags, DirectoryEntry, Errno, OperationError, CHUNK_SIZE, MAX_MESSAGE_SIZE,
};
use rhizo_common::wire::{
    entry_wire_len, CodecError, Compression, Header, Operation, Request, Response, KIND_REQUEST,
};
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{debug, error, warn};

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;

/// Room left for directory entries in one READDIR response, after the
/// header, errno and continuation offset.
const READDIR_PAGE_BUDGET: usize = MAX_MESSAGE_SIZE - 1024;

/// Decodes and runs one message, returning the encoded reply.
///
/// Payloads are compressed when the request's version shows the client
/// can inflate them.
///
/// # Errors
///
/// As for [`handle_message`].
pub async fn respond(
    state: &ServerState,
    transfers: &mut TransferTable,
    bytes: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let compression =
        Header::peek(bytes).map_or(Compression::None, |h| Compression::for_peer(h.version));
    let response = handle_message(state, transfers, bytes).await?;
    encode_reply(&response, compression)
}

/// Encodes a response, answering FBIG instead when it cannot fit in one
/// message so the session stays usable.
///
/// # Errors
///
/// Only if even the bare FBIG answer fails to encode.
pub fn encode_reply(response: &Response, compression: Compression) -> Result<Vec<u8>, CodecError> {
    match response.encode_with(compression) {
        Err(CodecError::OversizedMessage { actual, .. }) => {
            warn!(
                op = %response.op,
                sequence = response.sequence,
                size = actual,
                "response too large, answering FBIG"
            );
            counters::requests_total(response.op.as_str(), Errno::FBig.as_str());
            Response::for_header(response.op, response.sequence)
                .with_errno(Errno::FBig)
                .encode()
        }
        other => other,
    }
}

/// Cuts `entries` to the page starting at index `start`. Returns the page
/// and the index the next page starts at, if any remain.
fn readdir_page(entries: Vec<DirectoryEntry>, start: u64) -> (Vec<DirectoryEntry>, Option<u64>) {
    let start = usize::try_from(start).unwrap_or(usize::MAX).min(entries.len());
    let mut budget = READDIR_PAGE_BUDGET;
    let mut end = start;
    for entry in &entries[start..] {
        let cost = entry_wire_len(entry);
        // A page always makes progress.
        if cost > budget && end > start {
            break;
        }
        budget = budget.saturating_sub(cost);
        end += 1;
    }
    let next = (end < entries.len()).then_some(end as u64);
    let page = entries.into_iter().skip(start).take(end - start).collect();
    (page, next)
}

/// Decodes one message, runs it and returns the response to send.
///
/// # Errors
///
/// Returns [`CodecError`] only when the message has no readable request
/// header; the session should then be closed. Every other failure is
/// answered with an errno.
pub async fn handle_message(
    state: &ServerState,
    transfers: &mut TransferTable,
    bytes: &[u8],
) -> Result<Response, CodecError> {
    let req = match Request::decode(bytes) {
        Ok(req) => req,
        Err(err) => return reject_undecodable(bytes, err),
    };

    let _permit = state.workers.acquire().await.ok();
    let started = Instant::now();
    let op = req.op.as_str();

    let response = match AssertUnwindSafe(dispatch(state, transfers, &req))
        .catch_unwind()
        .await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            debug!(op, path = ?req.path, errno = %e.errno, error = %e.message, "request failed");
            Response::to(&req).with_errno(e.errno)
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(op, path = ?req.path, reason, "handler panicked");
            Response::to(&req).with_errno(Errno::Io)
        }
    };

    counters::requests_total(op, response.errno.as_str());
    histograms::request_latency_seconds(op, started.elapsed().as_secs_f64());
    Ok(response)
}

/// Answers a request that failed to decode, if its header allows it.
fn reject_undecodable(bytes: &[u8], err: CodecError) -> Result<Response, CodecError> {
    let header = Header::peek(bytes).map_err(|_| err.clone())?;
    if header.kind != KIND_REQUEST {
        return Err(err);
    }
    let op = Operation::try_from(header.op).unwrap_or(Operation::Invalid);
    let errno = if matches!(err, CodecError::IncompatibleVersion { .. }) {
        Errno::Version
    } else {
        Errno::Inval
    };
    warn!(op = header.op, sequence = header.sequence, error = %err, "undecodable request");
    counters::requests_total(op.as_str(), errno.as_str());
    Ok(Response::for_header(op, header.sequence).with_errno(errno))
}

fn required<T>(value: Option<T>, what: &str) -> TreeResult<T> {
    value.ok_or_else(|| OperationError::new(Errno::Inval, format!("missing {what}")))
}

fn path_of(req: &Request) -> TreeResult<TreePath> {
    TreePath::parse(required(req.path.as_deref(), "path")?)
}

fn target_of(req: &Request) -> TreeResult<TreePath> {
    TreePath::parse(required(req.target.as_deref(), "target")?)
}

fn payload_of(req: &Request) -> TreeResult<&[u8]> {
    let payload = required(req.payload.as_deref(), "payload")?;
    if payload.len() > CHUNK_SIZE {
        return Err(OperationError::new(
            Errno::Inval,
            format!("payload of {} bytes exceeds {CHUNK_SIZE}", payload.len()),
        ));
    }
    Ok(payload)
}

/// Routes one request to its handler.
async fn dispatch(
    state: &ServerState,
    transfers: &mut TransferTable,
    req: &Request,
) -> TreeResult<Response> {
    let tree = state.tree.as_ref();
    let locks = &state.locks;
    let mut resp = Response::to(req);

    match req.op {
        Operation::Invalid => return Err(OperationError::new(Errno::Inval, "invalid operation")),
        Operation::Ping => {}
        Operation::Stat => {
            let path = path_of(req)?;
            let _held = locks.acquire(read_path(&path)).await;
            resp.attributes = Some(tree.stat(&path).await?);
        }
        Operation::ReadDir => {
            let path = match req.path.as_deref() {
                Some(p) => TreePath::parse(p)?,
                None => TreePath::root(),
            };
            let _held = locks.acquire(read_path(&path)).await;
            let (page, next) = readdir_page(tree.list(&path).await?, req.offset.unwrap_or(0));
            resp.entries = page;
            resp.offset = next;
        }
        Operation::MkDir => {
            let path = path_of(req)?;
            let _held = locks.acquire(change_entry(&path)).await;
            resp.attributes = Some(tree.create_dir(&path, req.mode.unwrap_or(0o755)).await?);
        }
        Operation::RmDir => {
            let path = path_of(req)?;
            let _held = locks.acquire(change_entry(&path)).await;
            tree.remove_dir(&path).await?;
        }
        Operation::Unlink => {
            let path = path_of(req)?;
            let _held = locks.acquire(change_entry(&path)).await;
            tree.remove_file(&path).await?;
        }
        Operation::Link => {
            let new = path_of(req)?;
            let existing = target_of(req)?;
            let mut wanted = change_entry(&new);
            wanted.push((existing.clone(), LockMode::Exclusive));
            let _held = locks.acquire(wanted).await;
            resp.attributes = Some(tree.link(&existing, &new).await?);
        }
        Operation::Symlink => {
            let path = path_of(req)?;
            let target = required(req.target.as_deref(), "target")?;
            let _held = locks.acquire(change_entry(&path)).await;
            resp.attributes = Some(tree.symlink(target, &path).await?);
        }
        Operation::Rename => {
            let from = path_of(req)?;
            let to = target_of(req)?;
            let mut wanted = change_entry(&from);
            wanted.extend(change_entry(&to));
            let _held = locks.acquire(wanted).await;
            tree.rename(&from, &to).await?;
        }
        Operation::Truncate => {
            let path = path_of(req)?;
            let size = required(req.size, "size")?;
            let _held = locks.acquire(modify_path(&path)).await;
            resp.attributes = Some(tree.truncate(&path, size).await?);
        }
        Operation::Chmod => {
            let path = path_of(req)?;
            let mode = required(req.mode, "mode")?;
            let _held = locks.acquire(modify_path(&path)).await;
            resp.attributes = Some(tree.set_mode(&path, mode & 0o7777).await?);
        }
        Operation::Utimens => {
            let path = path_of(req)?;
            let _held = locks.acquire(modify_path(&path)).await;
            resp.attributes = Some(tree.set_times(&path, req.atime, req.mtime).await?);
        }
        Operation::StatFs => {
            resp.stats = Some(tree.fs_stats().await?);
        }
        Operation::Access => {
            let path = path_of(req)?;
            let _held = locks.acquire(read_path(&path)).await;
            tree.access(&path, req.mode.unwrap_or(access_mask::EXISTS)).await?;
        }
        Operation::Open => {
            let path = path_of(req)?;
            let flags = req.mode.unwrap_or(open_flags::RDONLY);
            let read_only = flags & open_flags::ACCMODE == open_flags::RDONLY
                && flags & open_flags::TRUNC == 0;
            let wanted = if read_only { read_path(&path) } else { modify_path(&path) };
            let _held = locks.acquire(wanted).await;
            tree.open(&path, flags).await?;
        }
        Operation::Create => {
            let path = path_of(req)?;
            let _held = locks.acquire(change_entry(&path)).await;
            resp.attributes = Some(tree.create_file(&path, req.mode.unwrap_or(0o644)).await?);
        }
        Operation::ReadLink => {
            let path = path_of(req)?;
            let _held = locks.acquire(read_path(&path)).await;
            resp.target = Some(tree.read_link(&path).await?);
        }
        Operation::MkNod => {
            let path = path_of(req)?;
            let mode = req.mode.unwrap_or(S_IFREG | 0o644);
            let kind = mode & S_IFMT;
            if kind != 0 && kind != S_IFREG {
                return Err(OperationError::new(
                    Errno::Perm,
                    format!("mknod of file type {kind:#o} is not supported"),
                ));
            }
            let _held = locks.acquire(change_entry(&path)).await;
            resp.attributes = Some(tree.create_file(&path, mode & 0o7777).await?);
        }
        Operation::Read => {
            let path = path_of(req)?;
            let size = required(req.size, "size")?;
            let len = usize::try_from(size)
                .ok()
                .filter(|len| *len <= CHUNK_SIZE)
                .ok_or_else(|| {
                    OperationError::new(Errno::Inval, format!("read of {size} bytes exceeds {CHUNK_SIZE}"))
                })?;
            let _held = locks.acquire(read_path(&path)).await;
            let data = tree.read(&path, req.offset.unwrap_or(0), len).await?;
            counters::bulk_bytes_total("download", data.len() as u64);
            resp.payload = Some(data);
        }
        Operation::Write => {
            let path = path_of(req)?;
            let data = payload_of(req)?;
            let _held = locks.acquire(modify_path(&path)).await;
            resp.size = Some(tree.write(&path, req.offset.unwrap_or(0), data).await?);
            counters::bulk_bytes_total("upload", data.len() as u64);
        }
        Operation::TransferBegin => {
            let target = path_of(req)?;
            if target.is_root() {
                return Err(OperationError::new(Errno::IsDir, "cannot upload over the root"));
            }
            resp.transfer = Some(transfers.begin(tree, target, req.mode.unwrap_or(0o644)).await?);
        }
        Operation::TransferChunk => {
            let id = required(req.transfer, "transfer id")?;
            let offset = required(req.offset, "offset")?;
            let data = payload_of(req)?;
            transfers.chunk(id, offset, data).await?;
            resp.transfer = Some(id);
            resp.size = Some(data.len() as u64);
        }
        Operation::TransferCommit => {
            let id = required(req.transfer, "transfer id")?;
            let transfer = transfers.take(id, req.size)?;
            let _held = locks.acquire(change_entry(&transfer.target)).await;
            let target = transfer.target.clone();
            resp.attributes = Some(transfer.staged.commit(&target, transfer.mode).await?);
            resp.transfer = Some(id);
            debug!(transfer = id, target = %target, "transfer committed");
        }
        Operation::TransferAbort => {
            let id = required(req.transfer, "transfer id")?;
            transfers.abort(id).await?;
            resp.transfer = Some(id);
        }
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::local::LocalDir;
    use crate::tree::{BackingTree, StagedWrite};
    use async_trait::async_trait;
    use rhizo_common::endpoint::Endpoint;
    use rhizo_common::session::ServerSecurity;
    use rhizo_common::types::{EntryKind, FileAttributes, FsStats, Timestamp};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn state_for(tree: Arc<dyn BackingTree>, dir: &TempDir) -> ServerState {
        let config = ServerConfig::new(Endpoint::ipc(dir.path().join("sock")), dir.path());
        ServerState::new(tree, ServerSecurity::plaintext(), config)
    }

    fn setup() -> (TempDir, ServerState, TransferTable) {
        let dir = TempDir::new().unwrap();
        let tree = LocalDir::new(dir.path()).unwrap();
        let state = state_for(Arc::new(tree), &dir);
        (dir, state, TransferTable::new(Duration::from_secs(60), 16))
    }

    async fn call(state: &ServerState, transfers: &mut TransferTable, req: Request) -> Response {
        let bytes = req.encode().unwrap();
        handle_message(state, transfers, &bytes).await.unwrap()
    }

    #[tokio::test]
    async fn response_echoes_sequence_and_op() {
        let (_dir, state, mut transfers) = setup();
        let mut req = Request::new(Operation::Ping);
        req.sequence = 77;
        let resp = call(&state, &mut transfers, req).await;
        assert!(resp.is_ok());
        assert_eq!(resp.op, Operation::Ping);
        assert_eq!(resp.sequence, 77);
    }

    #[tokio::test]
    async fn unknown_operation_is_inval() {
        let (_dir, state, mut transfers) = setup();
        let mut req = Request::new(Operation::Ping);
        req.sequence = 5;
        let mut bytes = req.encode().unwrap();
        bytes[3] = 0xEE;
        let resp = handle_message(&state, &mut transfers, &bytes).await.unwrap();
        assert_eq!(resp.errno, Errno::Inval);
        assert_eq!(resp.sequence, 5);
    }

    #[tokio::test]
    async fn major_version_mismatch_is_version() {
        let (_dir, state, mut transfers) = setup();
        let mut bytes = Request::new(Operation::Stat).with_path("/").encode().unwrap();
        bytes[4..6].copy_from_slice(&99u16.to_be_bytes());
        let resp = handle_message(&state, &mut transfers, &bytes).await.unwrap();
        assert_eq!(resp.errno, Errno::Version);
        assert_eq!(resp.op, Operation::Stat);
    }

    #[tokio::test]
    async fn garbage_without_header_is_fatal() {
        let (_dir, state, mut transfers) = setup();
        assert!(handle_message(&state, &mut transfers, b"nope").await.is_err());
    }

    #[tokio::test]
    async fn invalid_operation_is_inval() {
        let (_dir, state, mut transfers) = setup();
        let resp = call(&state, &mut transfers, Request::new(Operation::Invalid)).await;
        assert_eq!(resp.errno, Errno::Inval);
    }

    #[tokio::test]
    async fn missing_path_is_inval() {
        let (_dir, state, mut transfers) = setup();
        let resp = call(&state, &mut transfers, Request::new(Operation::Stat)).await;
        assert_eq!(resp.errno, Errno::Inval);
    }

    #[tokio::test]
    async fn create_write_read_stat() {
        let (_dir, state, mut transfers) = setup();
        let created = call(
            &state,
            &mut transfers,
            Request::new(Operation::Create).with_path("/f").with_mode(0o600),
        )
        .await;
        assert!(created.is_ok());
        assert_eq!(created.attributes.unwrap().permissions(), 0o600);

        let written = call(
            &state,
            &mut transfers,
            Request::new(Operation::Write)
                .with_path("/f")
                .with_offset(0)
                .with_payload(b"hello world".to_vec()),
        )
        .await;
        assert_eq!(written.size, Some(11));

        let read = call(
            &state,
            &mut transfers,
            Request::new(Operation::Read).with_path("/f").with_offset(6).with_size(100),
        )
        .await;
        assert_eq!(read.payload.as_deref(), Some(&b"world"[..]));

        let stat = call(&state, &mut transfers, Request::new(Operation::Stat).with_path("/f")).await;
        assert_eq!(stat.attributes.unwrap().size, 11);
    }

    #[tokio::test]
    async fn oversized_read_is_inval() {
        let (dir, state, mut transfers) = setup();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let resp = call(
            &state,
            &mut transfers,
            Request::new(Operation::Read)
                .with_path("/f")
                .with_size(CHUNK_SIZE as u64 + 1),
        )
        .await;
        assert_eq!(resp.errno, Errno::Inval);
    }

    #[tokio::test]
    async fn readdir_defaults_to_root() {
        let (dir, state, mut transfers) = setup();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        let resp = call(&state, &mut transfers, Request::new(Operation::ReadDir)).await;
        let names: Vec<_> = resp.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    fn long_names(count: usize) -> Vec<DirectoryEntry> {
        (0..count)
            .map(|i| DirectoryEntry {
                name: format!("{i:05}{}", "n".repeat(230)),
                kind: EntryKind::File,
            })
            .collect()
    }

    #[test]
    fn readdir_pages_fit_and_cover_everything() {
        let all = long_names(4600);
        let mut seen = Vec::new();
        let mut start = 0;
        loop {
            let (page, next) = readdir_page(all.clone(), start);
            let mut resp = Response::for_header(Operation::ReadDir, 1);
            resp.entries = page.clone();
            resp.offset = next;
            assert!(resp.encode().is_ok());
            seen.extend(page);
            match next {
                Some(n) => {
                    assert!(n > start);
                    start = n;
                }
                None => break,
            }
        }
        assert_eq!(seen, all);
    }

    #[test]
    fn readdir_offset_past_end_is_empty() {
        let (page, next) = readdir_page(long_names(3), 10);
        assert!(page.is_empty());
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn readdir_offset_resumes_listing() {
        let (dir, state, mut transfers) = setup();
        for i in 0..300 {
            std::fs::write(dir.path().join(format!("{i:03}{}", "x".repeat(200))), b"").unwrap();
        }
        let first = call(&state, &mut transfers, Request::new(Operation::ReadDir)).await;
        assert!(first.is_ok());
        assert_eq!(first.entries.len(), 300);
        assert_eq!(first.offset, None);

        let tail = call(
            &state,
            &mut transfers,
            Request::new(Operation::ReadDir).with_path("/").with_offset(298),
        )
        .await;
        let names: Vec<_> = tail.entries.iter().map(|e| &e.name[..3]).collect();
        assert_eq!(names, ["298", "299"]);
    }

    #[test]
    fn oversized_reply_becomes_fbig() {
        let mut resp = Response::for_header(Operation::ReadLink, 9);
        resp.target = Some("t".repeat(MAX_MESSAGE_SIZE));
        let bytes = encode_reply(&resp, Compression::None).unwrap();
        let decoded = Response::decode(&bytes).unwrap();
        assert_eq!(decoded.errno, Errno::FBig);
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.op, Operation::ReadLink);
        assert_eq!(decoded.target, None);
    }

    #[tokio::test]
    async fn reply_is_compressed_for_current_clients_only() {
        let (dir, state, mut transfers) = setup();
        std::fs::write(dir.path().join("f"), b"abcd".repeat(1000)).unwrap();
        let req = Request::new(Operation::Read).with_path("/f").with_size(4000);

        let packed = respond(&state, &mut transfers, &req.encode().unwrap()).await.unwrap();
        let resp = Response::decode(&packed).unwrap();
        assert_eq!(resp.payload.as_deref(), Some(&b"abcd".repeat(1000)[..]));
        assert!(packed.len() < 1000);

        let mut old = req.encode().unwrap();
        old[6..8].copy_from_slice(&(rhizo_common::wire::COMPRESSION_MINOR - 1).to_be_bytes());
        let plain = respond(&state, &mut transfers, &old).await.unwrap();
        assert!(plain.len() > 4000);
        assert_eq!(Response::decode(&plain).unwrap().payload, resp.payload);
    }

    #[tokio::test]
    async fn upload_cap_answers_busy() {
        let (_dir, state, _) = setup();
        let mut transfers = TransferTable::new(Duration::from_secs(60), 2);
        for name in ["/a", "/b"] {
            let begin = call(
                &state,
                &mut transfers,
                Request::new(Operation::TransferBegin).with_path(name),
            )
            .await;
            assert!(begin.is_ok());
        }
        let refused = call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferBegin).with_path("/c"),
        )
        .await;
        assert_eq!(refused.errno, Errno::Busy);
    }

    #[tokio::test]
    async fn escaping_path_is_acces() {
        let (_dir, state, mut transfers) = setup();
        let resp = call(
            &state,
            &mut transfers,
            Request::new(Operation::Stat).with_path("/../etc/passwd"),
        )
        .await;
        assert_eq!(resp.errno, Errno::Acces);
    }

    #[tokio::test]
    async fn mknod_of_device_is_perm() {
        let (_dir, state, mut transfers) = setup();
        let resp = call(
            &state,
            &mut transfers,
            Request::new(Operation::MkNod).with_path("/dev").with_mode(0o020_644),
        )
        .await;
        assert_eq!(resp.errno, Errno::Perm);

        let regular = call(
            &state,
            &mut transfers,
            Request::new(Operation::MkNod).with_path("/reg").with_mode(S_IFREG | 0o640),
        )
        .await;
        assert!(regular.is_ok());
        assert_eq!(regular.attributes.unwrap().permissions(), 0o640);
    }

    #[tokio::test]
    async fn utimens_keeps_omitted_time() {
        let (dir, state, mut transfers) = setup();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let first = Timestamp::new(1_000_000_000, 123_456_789);
        call(
            &state,
            &mut transfers,
            Request::new(Operation::Utimens)
                .with_path("/f")
                .with_times(Some(first), Some(first)),
        )
        .await;
        let later = Timestamp::new(1_500_000_000, 1);
        let resp = call(
            &state,
            &mut transfers,
            Request::new(Operation::Utimens)
                .with_path("/f")
                .with_times(None, Some(later)),
        )
        .await;
        let attrs = resp.attributes.unwrap();
        assert_eq!(attrs.atime, first);
        assert_eq!(attrs.mtime, later);
    }

    #[tokio::test]
    async fn staged_upload_through_dispatch() {
        let (dir, state, mut transfers) = setup();
        let begin = call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferBegin).with_path("/up").with_mode(0o640),
        )
        .await;
        let id = begin.transfer.unwrap();

        let first = call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferChunk)
                .with_transfer(id)
                .with_offset(0)
                .with_payload(b"abc".to_vec()),
        )
        .await;
        assert_eq!(first.size, Some(3));

        let wrong = call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferChunk)
                .with_transfer(id)
                .with_offset(1)
                .with_payload(b"zzz".to_vec()),
        )
        .await;
        assert_eq!(wrong.errno, Errno::Transfer);
        assert!(!dir.path().join("up").exists());

        call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferChunk)
                .with_transfer(id)
                .with_offset(3)
                .with_payload(b"def".to_vec()),
        )
        .await;
        let commit = call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferCommit).with_transfer(id).with_size(6),
        )
        .await;
        assert!(commit.is_ok());
        assert_eq!(commit.attributes.unwrap().permissions(), 0o640);
        assert_eq!(std::fs::read(dir.path().join("up")).unwrap(), b"abcdef");

        let again = call(
            &state,
            &mut transfers,
            Request::new(Operation::TransferCommit).with_transfer(id),
        )
        .await;
        assert_eq!(again.errno, Errno::Transfer);
    }

    #[derive(Debug)]
    struct PanickingTree;

    #[async_trait]
    impl BackingTree for PanickingTree {
        fn read_only(&self) -> bool {
            false
        }
        async fn stat(&self, _: &TreePath) -> TreeResult<FileAttributes> {
            panic!("stat exploded")
        }
        async fn list(&self, _: &TreePath) -> TreeResult<Vec<DirectoryEntry>> {
            unimplemented!()
        }
        async fn create_dir(&self, _: &TreePath, _: u32) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn remove_dir(&self, _: &TreePath) -> TreeResult<()> {
            unimplemented!()
        }
        async fn create_file(&self, _: &TreePath, _: u32) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn remove_file(&self, _: &TreePath) -> TreeResult<()> {
            unimplemented!()
        }
        async fn rename(&self, _: &TreePath, _: &TreePath) -> TreeResult<()> {
            unimplemented!()
        }
        async fn link(&self, _: &TreePath, _: &TreePath) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn symlink(&self, _: &str, _: &TreePath) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn read_link(&self, _: &TreePath) -> TreeResult<String> {
            unimplemented!()
        }
        async fn read(&self, _: &TreePath, _: u64, _: usize) -> TreeResult<Vec<u8>> {
            unimplemented!()
        }
        async fn write(&self, _: &TreePath, _: u64, _: &[u8]) -> TreeResult<u64> {
            unimplemented!()
        }
        async fn truncate(&self, _: &TreePath, _: u64) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn set_times(
            &self,
            _: &TreePath,
            _: Option<Timestamp>,
            _: Option<Timestamp>,
        ) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn set_mode(&self, _: &TreePath, _: u32) -> TreeResult<FileAttributes> {
            unimplemented!()
        }
        async fn fs_stats(&self) -> TreeResult<FsStats> {
            unimplemented!()
        }
        async fn access(&self, _: &TreePath, _: u32) -> TreeResult<()> {
            unimplemented!()
        }
        async fn open(&self, _: &TreePath, _: u32) -> TreeResult<()> {
            unimplemented!()
        }
        async fn stage(&self, _: u64, _: &TreePath) -> TreeResult<Box<dyn StagedWrite>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn handler_panic_becomes_io_and_releases_locks() {
        let dir = TempDir::new().unwrap();
        let state = state_for(Arc::new(PanickingTree), &dir);
        let mut transfers = TransferTable::new(Duration::from_secs(60), 16);

        let resp = call(&state, &mut transfers, Request::new(Operation::Stat).with_path("/f")).await;
        assert_eq!(resp.errno, Errno::Io);

        // The shared lock taken before the panic was released.
        let held = tokio::time::timeout(
            Duration::from_millis(200),
            state.locks.acquire(crate::locks::modify_path(&TreePath::parse("/f").unwrap())),
        )
        .await;
        assert!(held.is_ok());
        assert_eq!(state.workers.available_permits(), state.config.workers);
    }
}
