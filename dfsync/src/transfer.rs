//! Store / Fetch / Delete orchestration around the lock table.
//!
//! Store state machine:
//! ```text
//! START ─► LOCK_CHECK ─┬─► not owner ─────────────────────────► CANCELLED
//!                      └─► RESOLVING ─┬─► synced / stale ────► rejected, lock released
//!                                     └─► RECEIVING ─┬─► error ► lock released-or-deleted
//!                                                    └─► COMPLETE, lock released
//! ```
//!
//! Incoming bytes go to a hidden temporary file in the mount and are renamed
//! over the target only once the whole stream has arrived and its checksum
//! matches the header. A rejected or broken transfer never touches the
//! existing file.

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::changes::{ChangeFeed, ChangeKind};
use crate::config::ClientId;
use crate::conflict::{resolve, Direction, Resolution};
use crate::deadline::Deadline;
use crate::error::{DfsError, DfsResult};
use crate::locks::LockTable;
use crate::manifest::{self, PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::protocol::{FetchChunk, FetchRequest, FileRecord, ListEntry, StoreHeader, UnixTime};

/// Progress of one Store or Fetch call. Never shared between calls.
#[derive(Debug)]
pub struct TransferSession {
    pub file_name: String,
    pub bytes: u64,
    pub file_size: u64,
    /// Checksum of the destination copy when the transfer started, if any
    pub checksum_at_start: Option<u32>,
}

impl TransferSession {
    fn new(file_name: &str, file_size: u64, checksum_at_start: Option<u32>) -> Self {
        Self {
            file_name: file_name.to_string(),
            bytes: 0,
            file_size,
            checksum_at_start,
        }
    }

    fn advance(&mut self, n: usize) {
        self.bytes += n as u64;
        log::trace!("{}: {}/{} bytes", self.file_name, self.bytes, self.file_size);
    }
}

/// Counters for transfer traffic.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub stores_completed: u64,
    pub stores_rejected: u64,
    pub fetches_completed: u64,
    pub fetches_skipped: u64,
    pub deletes_completed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Default)]
struct AtomicTransferStats {
    stores_completed: AtomicU64,
    stores_rejected: AtomicU64,
    fetches_completed: AtomicU64,
    fetches_skipped: AtomicU64,
    deletes_completed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Request handlers for one served mount directory.
///
/// Holds shared handles to the lock table and change feed; neither knows
/// about the endpoint.
pub struct TransferEndpoint {
    mount: PathBuf,
    chunk_size: usize,
    locks: Arc<LockTable>,
    changes: Arc<ChangeFeed>,
    stats: AtomicTransferStats,
}

impl TransferEndpoint {
    pub fn new(
        mount: impl Into<PathBuf>,
        chunk_size: usize,
        locks: Arc<LockTable>,
        changes: Arc<ChangeFeed>,
    ) -> Self {
        Self {
            mount: mount.into(),
            chunk_size: chunk_size.max(1),
            locks,
            changes,
            stats: AtomicTransferStats::default(),
        }
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Grant the write lock on `file_name` to `client`, or refuse immediately.
    pub fn request_lock(&self, file_name: &str, client: &ClientId, deadline: Deadline) -> DfsResult<()> {
        deadline.check()?;
        manifest::resolve(&self.mount, file_name)?;
        if self.locks.acquire(file_name, client) {
            Ok(())
        } else {
            let owner = self
                .locks
                .owner_of(file_name)
                .map_or_else(|| "unknown".to_string(), |o| o.to_string());
            Err(DfsError::ResourceExhausted(format!(
                "{file_name} is locked by {owner}"
            )))
        }
    }

    /// Receive a file from a client that holds its lock.
    ///
    /// `chunks` yields the content in order and ends after the last chunk.
    pub async fn store<S>(&self, header: &StoreHeader, chunks: S, deadline: Deadline) -> DfsResult<String>
    where
        S: Stream<Item = DfsResult<Vec<u8>>>,
    {
        let file_name = header.file_name.as_str();
        let client = ClientId::new(header.client_id.clone());
        let path = manifest::resolve(&self.mount, file_name)?;

        if let Err(e) = deadline.check() {
            self.abandon_expired(file_name, &client).await;
            return Err(e);
        }

        if !self.locks.is_owner(file_name, &client) {
            log::warn!(
                "{client} tried to store {file_name} without its lock (owner: {:?})",
                self.locks.owner_of(file_name)
            );
            return Err(DfsError::Cancelled(format!(
                "{client} does not hold the lock for {file_name}"
            )));
        }

        let existing = match manifest::stat_file(&self.mount, file_name).await {
            Ok(existing) => existing,
            Err(e) => return Err(self.abandon_store(file_name, &client, &path, e).await),
        };
        let file_existed = existing.is_some();

        let rejection = match resolve(
            Direction::Store,
            existing.as_ref().map(FileRecord::version),
            header.version(),
        ) {
            Resolution::Proceed => None,
            Resolution::AlreadySynced => Some(DfsError::AlreadyExists(format!(
                "{file_name} is already up to date on the server"
            ))),
            Resolution::StaleSource => Some(DfsError::Cancelled(format!(
                "server copy of {file_name} is newer"
            ))),
        };
        if let Some(err) = rejection {
            log::info!("Store of {file_name} by {client} rejected: {err}");
            self.stats.stores_rejected.fetch_add(1, Ordering::Relaxed);
            self.locks.release_or_delete(file_name, &client, file_existed);
            return Err(err);
        }

        if let Err(e) = deadline.check() {
            return Err(self.abandon_store(file_name, &client, &path, e).await);
        }

        let mut session = TransferSession::new(
            file_name,
            header.file_size,
            existing.as_ref().map(|r| r.checksum),
        );
        log::info!(
            "Receiving {file_name} from {client} ({} bytes, replacing {:?})",
            header.file_size,
            session.checksum_at_start
        );

        if let Err(e) = self
            .receive(&path, header, chunks, &mut session, deadline)
            .await
        {
            log::warn!(
                "Store of {file_name} aborted at {}/{} bytes: {e}",
                session.bytes,
                session.file_size
            );
            self.stats.stores_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(self.abandon_store(file_name, &client, &path, e).await);
        }

        self.stats.stores_completed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(session.bytes, Ordering::Relaxed);

        if !self.locks.release(file_name, &client) {
            log::error!("Lock on {file_name} vanished from under {client} during store");
            return Err(DfsError::Internal(format!(
                "lock on {file_name} could not be released"
            )));
        }
        self.changes.publish(file_name, ChangeKind::Stored);
        log::info!("Stored {file_name} ({} bytes) from {client}", session.bytes);
        Ok(file_name.to_string())
    }

    /// Give up the lock held by a call whose deadline passed before it ran.
    ///
    /// Nothing happens when `client` does not own the lock.
    pub async fn abandon_expired(&self, file_name: &str, client: &ClientId) {
        let Ok(path) = manifest::resolve(&self.mount, file_name) else {
            return;
        };
        if self.locks.is_owner(file_name, client) {
            log::info!("Releasing {file_name} held by {client} after its call expired");
            let still_exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            self.locks.release_or_delete(file_name, client, still_exists);
        }
    }

    /// Release (file on disk) or delete (no file) the lock, then hand back `err`.
    async fn abandon_store(
        &self,
        file_name: &str,
        client: &ClientId,
        path: &Path,
        err: DfsError,
    ) -> DfsError {
        let still_exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        self.locks.release_or_delete(file_name, client, still_exists);
        err
    }

    async fn receive<S>(
        &self,
        path: &Path,
        header: &StoreHeader,
        chunks: S,
        session: &mut TransferSession,
        deadline: Deadline,
    ) -> DfsResult<()>
    where
        S: Stream<Item = DfsResult<Vec<u8>>>,
    {
        let partial = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&self.mount)?;
        let (file, partial_path) = partial.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = crc32fast::Hasher::new();
        let mut chunks = pin!(chunks);

        loop {
            let next = tokio::time::timeout_at(deadline.expires_at(), chunks.next())
                .await
                .map_err(|_| DfsError::DeadlineExceeded)?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            session.advance(chunk.len());
            if session.bytes > session.file_size {
                return Err(DfsError::Cancelled(format!(
                    "received more than the declared {} bytes",
                    session.file_size
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        if session.bytes != session.file_size {
            return Err(DfsError::Cancelled(format!(
                "stream ended at {}/{} bytes",
                session.bytes, session.file_size
            )));
        }
        let received = hasher.finalize();
        if received != header.checksum {
            return Err(DfsError::Cancelled(format!(
                "content checksum {received:#010x} does not match declared {:#010x}",
                header.checksum
            )));
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        partial_path.persist(path).map_err(|e| DfsError::Io(e.error))?;
        Ok(())
    }

    /// Stream a file to a client if the server copy is authoritative.
    ///
    /// When the caller's copy is current, a single `copy_needed = false`
    /// message is sent and the call fails with `AlreadyExists` or `Cancelled`.
    /// Returns the number of content bytes sent.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        out: &mpsc::Sender<FetchChunk>,
        deadline: Deadline,
    ) -> DfsResult<u64> {
        let file_name = request.file_name.as_str();
        let path = manifest::resolve(&self.mount, file_name)?;

        let Some(record) = manifest::stat_file(&self.mount, file_name).await? else {
            log::info!("Fetch of missing file {file_name}");
            return Err(DfsError::NotFound(format!("{file_name} is not on the server")));
        };
        deadline.check()?;

        let rejection = match resolve(Direction::Fetch, request.local, record.version()) {
            Resolution::Proceed => None,
            Resolution::AlreadySynced => Some(DfsError::AlreadyExists(format!(
                "{file_name} is already up to date on the client"
            ))),
            Resolution::StaleSource => Some(DfsError::Cancelled(format!(
                "client copy of {file_name} is newer"
            ))),
        };
        if let Some(err) = rejection {
            self.stats.fetches_skipped.fetch_add(1, Ordering::Relaxed);
            let skip = FetchChunk {
                file_size: record.size,
                copy_needed: false,
                content: Vec::new(),
            };
            send_chunk(out, skip, deadline).await?;
            return Err(err);
        }

        let mut session = TransferSession::new(file_name, record.size, request.local.map(|v| v.checksum));
        let file = open_for_send(&path, file_name).await?;
        // The file may grow while we read; never send past the size we announced
        let mut reader = file.take(record.size);
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent_any = false;

        loop {
            deadline.check()?;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            session.advance(n);
            let chunk = FetchChunk {
                file_size: record.size,
                copy_needed: true,
                content: buf[..n].to_vec(),
            };
            send_chunk(out, chunk, deadline).await?;
            sent_any = true;
        }

        if session.bytes != record.size {
            return Err(DfsError::Cancelled(format!(
                "{file_name} shrank during transfer ({}/{} bytes)",
                session.bytes, record.size
            )));
        }
        if !sent_any {
            // Empty file: the client still needs the copy flag to create it
            let chunk = FetchChunk {
                file_size: 0,
                copy_needed: true,
                content: Vec::new(),
            };
            send_chunk(out, chunk, deadline).await?;
        }

        self.stats.fetches_completed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(session.bytes, Ordering::Relaxed);
        log::info!("Sent {file_name} ({} bytes)", session.bytes);
        Ok(session.bytes)
    }

    /// Remove a file on behalf of the client holding its lock.
    ///
    /// The lock is deleted when the file is gone and released on every other
    /// exit path, including a failed removal.
    pub async fn delete(&self, file_name: &str, client: &ClientId, deadline: Deadline) -> DfsResult<()> {
        let path = manifest::resolve(&self.mount, file_name)?;

        if !self.locks.is_owner(file_name, client) {
            log::warn!(
                "{client} tried to delete {file_name} without its lock (owner: {:?})",
                self.locks.owner_of(file_name)
            );
            return Err(DfsError::Cancelled(format!(
                "{client} does not hold the lock for {file_name}"
            )));
        }

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.locks.delete(file_name, client);
            return Err(DfsError::NotFound(format!("{file_name} is not on the server")));
        }

        if let Err(e) = deadline.check() {
            self.locks.release_or_delete(file_name, client, true);
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            log::error!("Failed to remove {}: {e}", path.display());
            let still_exists = tokio::fs::try_exists(&path).await.unwrap_or(true);
            self.locks.release_or_delete(file_name, client, still_exists);
            return Err(DfsError::Cancelled(format!("could not remove {file_name}: {e}")));
        }

        if !self.locks.delete(file_name, client) {
            log::error!("Lock on {file_name} vanished from under {client} during delete");
            return Err(DfsError::Internal(format!(
                "lock on {file_name} could not be deleted"
            )));
        }
        self.stats.deletes_completed.fetch_add(1, Ordering::Relaxed);
        self.changes.publish(file_name, ChangeKind::Deleted);
        log::info!("Deleted {file_name} for {client}");
        Ok(())
    }

    pub async fn list(&self, deadline: Deadline) -> DfsResult<Vec<ListEntry>> {
        deadline.check()?;
        manifest::list(&self.mount).await
    }

    pub async fn stat(&self, file_name: &str, deadline: Deadline) -> DfsResult<FileRecord> {
        deadline.check()?;
        manifest::stat_file(&self.mount, file_name)
            .await?
            .ok_or_else(|| DfsError::NotFound(format!("{file_name} is not on the server")))
    }

    /// Compare a client checksum with the server copy.
    ///
    /// Equal checksums fail with `AlreadyExists` and release the caller's
    /// lock if it holds one, since no store will follow.
    pub async fn checksum_probe(
        &self,
        file_name: &str,
        client: &ClientId,
        checksum: u32,
        deadline: Deadline,
    ) -> DfsResult<u32> {
        let record = self.stat(file_name, deadline).await?;
        if record.checksum == checksum {
            if self.locks.is_owner(file_name, client) {
                self.locks.release(file_name, client);
            }
            return Err(DfsError::AlreadyExists(format!(
                "{file_name} has the same checksum on the server"
            )));
        }
        Ok(record.checksum)
    }

    /// Whether the server copy has exactly `mtime`.
    pub async fn compare_mtime(&self, file_name: &str, mtime: UnixTime, deadline: Deadline) -> DfsResult<bool> {
        let record = self.stat(file_name, deadline).await?;
        Ok(record.mtime == mtime)
    }

    /// Park until a store/delete lands or `max_wait` passes, then enumerate
    /// the mount.
    pub async fn manifest(
        &self,
        max_wait: std::time::Duration,
        deadline: Deadline,
    ) -> DfsResult<Vec<FileRecord>> {
        let wait = max_wait.min(deadline.remaining());
        if !wait.is_zero() {
            if let Some(event) = self.changes.wait_for_change(wait).await {
                log::debug!("Notification woken by {:?} of {}", event.kind, event.file_name);
            }
        }
        manifest::enumerate(&self.mount).await
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            stores_completed: self.stats.stores_completed.load(Ordering::Relaxed),
            stores_rejected: self.stats.stores_rejected.load(Ordering::Relaxed),
            fetches_completed: self.stats.fetches_completed.load(Ordering::Relaxed),
            fetches_skipped: self.stats.fetches_skipped.load(Ordering::Relaxed),
            deletes_completed: self.stats.deletes_completed.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

fn client_gone() -> DfsError {
    DfsError::Cancelled("client stopped reading".to_string())
}

/// Hand one chunk to the socket writer, giving up when the deadline passes first.
async fn send_chunk(out: &mpsc::Sender<FetchChunk>, chunk: FetchChunk, deadline: Deadline) -> DfsResult<()> {
    tokio::time::timeout_at(deadline.expires_at(), out.send(chunk))
        .await
        .map_err(|_| DfsError::DeadlineExceeded)?
        .map_err(|_| client_gone())
}

/// Open a file for a fetch. A file deleted since it was stat'ed is `NotFound`.
async fn open_for_send(path: &Path, file_name: &str) -> DfsResult<tokio::fs::File> {
    match tokio::fs::File::open(path).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("{file_name} was removed before it could be sent");
            Err(DfsError::NotFound(format!("{file_name} is not on the server")))
        }
        Err(e) => Err(e.into()),
    }
}
