//! WebSocket client for the file server.
//!
//! Provides:
//! - Write-lock requests
//! - Store / Fetch / Delete of whole files against the local mount
//! - List, Stat, checksum and mtime probes
//! - The long-poll change notification used by [`crate::sync::SyncLoop`]
//!
//! Each call opens its own connection and is bounded by the configured
//! deadline, which is also sent to the server so both sides give up together.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{ClientConfig, ClientId};
use crate::error::{DfsError, DfsResult, ProtocolError, RpcStatus};
use crate::manifest::{self, PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::protocol::{
    ClientFrame, FetchRequest, FileRecord, ListEntry, Reply, Request, ServerFrame, StoreHeader,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One open call on its own connection.
struct Call {
    ws: WsStream,
}

impl Call {
    async fn send(&mut self, frame: &ClientFrame) -> DfsResult<()> {
        let encoded = frame.encode()?;
        self.ws
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|e| ProtocolError::Transport(format!("send failed: {e}")).into())
    }

    async fn next_frame(&mut self) -> DfsResult<ServerFrame> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(ServerFrame::decode(&data)?),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ProtocolError::ConnectionClosed.into())
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ProtocolError::Transport(format!("connection broken: {e}")).into())
                }
            }
        }
    }

    /// Wait for the final reply. The outer error is a transport failure, the
    /// inner one the status the server returned.
    async fn reply(&mut self) -> DfsResult<Result<Reply, RpcStatus>> {
        match self.next_frame().await? {
            ServerFrame::Reply(reply) => Ok(reply),
            ServerFrame::Fetch(_) => Err(unexpected("fetch chunk outside a fetch")),
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn unexpected(what: &'static str) -> DfsError {
    ProtocolError::UnexpectedFrame(what).into()
}

/// Client for one mount directory and one server.
pub struct DfsClient {
    config: ClientConfig,
}

impl DfsClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> &ClientId {
        &self.config.client_id
    }

    pub fn mount_path(&self) -> &Path {
        &self.config.mount_path
    }

    /// Full local path of `file_name` inside the mount.
    pub fn local_path(&self, file_name: &str) -> DfsResult<PathBuf> {
        manifest::resolve(&self.config.mount_path, file_name)
    }

    /// Local metadata of `file_name`, `None` if it is not in the mount.
    pub async fn local_record(&self, file_name: &str) -> DfsResult<Option<FileRecord>> {
        manifest::stat_file(&self.config.mount_path, file_name).await
    }

    async fn open(&self, request: Request, deadline: Duration) -> DfsResult<Call> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.server_url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectFailed(e.to_string()))?;
        let mut call = Call { ws };
        call.send(&ClientFrame::Call {
            deadline_ms: deadline.as_millis() as u64,
            request,
        })
        .await?;
        Ok(call)
    }

    /// Request/response call bounded by `deadline`.
    async fn unary(&self, request: Request, deadline: Duration) -> DfsResult<Reply> {
        let name = request.name();
        let result = tokio::time::timeout(deadline, async {
            let mut call = self.open(request, deadline).await?;
            let reply = call.reply().await;
            call.close().await;
            reply
        })
        .await
        .map_err(|_| DfsError::DeadlineExceeded)?;
        log::trace!("{name} reply: {result:?}");
        Ok(result??)
    }

    /// Ask for the server-side write lock on `file_name`.
    ///
    /// Fails with `ResourceExhausted` while another client holds it.
    pub async fn request_write_access(&self, file_name: &str) -> DfsResult<()> {
        let request = Request::RequestLock {
            file_name: file_name.to_string(),
            client_id: self.config.client_id.to_string(),
        };
        match self.unary(request, self.config.deadline).await? {
            Reply::Empty => {
                log::debug!("Write lock on {file_name} granted");
                Ok(())
            }
            _ => Err(unexpected("lock reply")),
        }
    }

    /// Push the local copy of `file_name` to the server.
    ///
    /// Takes the write lock first. Missing or empty local files fail with
    /// `NotFound` without contacting the server.
    pub async fn store(&self, file_name: &str) -> DfsResult<()> {
        let path = self.local_path(file_name)?;
        let local = match self.local_record(file_name).await? {
            Some(record) if record.size > 0 => record,
            Some(_) => {
                return Err(DfsError::NotFound(format!("{file_name} is empty")));
            }
            None => {
                return Err(DfsError::NotFound(format!("{file_name} is not in the mount")));
            }
        };

        self.request_write_access(file_name).await?;

        let header = StoreHeader {
            file_name: file_name.to_string(),
            file_size: local.size,
            client_id: self.config.client_id.to_string(),
            checksum: local.checksum,
            mtime: local.mtime,
        };
        let deadline = self.config.deadline;
        let reply = tokio::time::timeout(deadline, async {
            let mut call = self.open(Request::Store(header), deadline).await?;
            let sent = self.send_file(&mut call, &path, local.size).await;
            let reply = call.reply().await;
            call.close().await;
            match (sent, reply) {
                // A rejected store may close the stream early; the reply says why
                (_, Ok(reply)) => Ok::<_, DfsError>(reply),
                (Err(e), Err(_)) | (Ok(()), Err(e)) => Err(e),
            }
        })
        .await
        .map_err(|_| DfsError::DeadlineExceeded)??;

        match reply? {
            Reply::Stored { .. } => {
                log::info!("Stored {file_name} ({} bytes)", local.size);
                Ok(())
            }
            _ => Err(unexpected("store reply")),
        }
    }

    async fn send_file(&self, call: &mut Call, path: &Path, size: u64) -> DfsResult<()> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = file.take(size);
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            call.send(&ClientFrame::Chunk(buf[..n].to_vec())).await?;
        }
        call.send(&ClientFrame::EndOfStream).await
    }

    /// Pull the server copy of `file_name` into the mount.
    ///
    /// Returns the number of bytes written. Fails with `AlreadyExists` when
    /// the local copy is identical and `Cancelled` when it is newer; in both
    /// cases the local file is left untouched.
    pub async fn fetch(&self, file_name: &str) -> DfsResult<u64> {
        let path = self.local_path(file_name)?;
        let local = self.local_record(file_name).await?.map(|r| r.version());
        let request = Request::Fetch(FetchRequest {
            file_name: file_name.to_string(),
            local,
        });

        let deadline = self.config.deadline;
        tokio::time::timeout(deadline, async {
            let mut call = self.open(request, deadline).await?;
            let result = self.receive_file(&mut call, &path).await;
            call.close().await;
            result
        })
        .await
        .map_err(|_| DfsError::DeadlineExceeded)?
    }

    async fn receive_file(&self, call: &mut Call, path: &Path) -> DfsResult<u64> {
        let mut partial = None;
        let mut received = 0u64;

        loop {
            match call.next_frame().await? {
                ServerFrame::Fetch(chunk) => {
                    if !chunk.copy_needed {
                        // Local copy is current; the reply carries the reason
                        continue;
                    }
                    if partial.is_none() {
                        let temp = tempfile::Builder::new()
                            .prefix(PARTIAL_PREFIX)
                            .suffix(PARTIAL_SUFFIX)
                            .tempfile_in(&self.config.mount_path)?;
                        let (file, temp_path) = temp.into_parts();
                        partial = Some((tokio::fs::File::from_std(file), temp_path));
                    }
                    if let Some((file, _)) = partial.as_mut() {
                        file.write_all(&chunk.content).await?;
                    }
                    received += chunk.content.len() as u64;
                }
                ServerFrame::Reply(Err(status)) => return Err(status.into()),
                ServerFrame::Reply(Ok(Reply::Fetched { bytes })) => {
                    let Some((mut file, temp_path)) = partial.take() else {
                        return Err(unexpected("fetch finished without content"));
                    };
                    if received != bytes {
                        return Err(DfsError::Cancelled(format!(
                            "received {received} of {bytes} bytes"
                        )));
                    }
                    file.flush().await?;
                    file.sync_all().await?;
                    drop(file);
                    temp_path.persist(path).map_err(|e| DfsError::Io(e.error))?;
                    log::info!("Fetched {} ({received} bytes)", path.display());
                    return Ok(received);
                }
                ServerFrame::Reply(Ok(_)) => return Err(unexpected("fetch reply")),
            }
        }
    }

    /// Delete `file_name` on the server. Takes the write lock first.
    pub async fn delete(&self, file_name: &str) -> DfsResult<()> {
        self.request_write_access(file_name).await?;
        let request = Request::Delete {
            file_name: file_name.to_string(),
            client_id: self.config.client_id.to_string(),
        };
        match self.unary(request, self.config.deadline).await? {
            Reply::Empty => {
                log::info!("Deleted {file_name} on the server");
                Ok(())
            }
            _ => Err(unexpected("delete reply")),
        }
    }

    /// Names and mtimes of every file on the server.
    pub async fn list(&self) -> DfsResult<Vec<ListEntry>> {
        match self.unary(Request::List, self.config.deadline).await? {
            Reply::List(entries) => Ok(entries),
            _ => Err(unexpected("list reply")),
        }
    }

    /// Server-side metadata of one file.
    pub async fn stat(&self, file_name: &str) -> DfsResult<FileRecord> {
        let request = Request::Stat {
            file_name: file_name.to_string(),
        };
        match self.unary(request, self.config.deadline).await? {
            Reply::Stat(record) => Ok(record),
            _ => Err(unexpected("stat reply")),
        }
    }

    /// Compare the local checksum of `file_name` with the server copy.
    ///
    /// Returns the server checksum when they differ; `AlreadyExists` when they
    /// match (any write lock we hold on it is released by the server).
    pub async fn checksum(&self, file_name: &str) -> DfsResult<u32> {
        let local = self
            .local_record(file_name)
            .await?
            .ok_or_else(|| DfsError::NotFound(format!("{file_name} is not in the mount")))?;
        let request = Request::Checksum {
            file_name: file_name.to_string(),
            client_id: self.config.client_id.to_string(),
            checksum: local.checksum,
        };
        match self.unary(request, self.config.deadline).await? {
            Reply::Checksum { checksum } => Ok(checksum),
            _ => Err(unexpected("checksum reply")),
        }
    }

    /// Whether the server copy has the same mtime as the local one.
    pub async fn compare_mtime(&self, file_name: &str) -> DfsResult<bool> {
        let local = self
            .local_record(file_name)
            .await?
            .ok_or_else(|| DfsError::NotFound(format!("{file_name} is not in the mount")))?;
        let request = Request::CompareMtime {
            file_name: file_name.to_string(),
            mtime: local.mtime,
        };
        match self.unary(request, self.config.deadline).await? {
            Reply::SameTimestamp(same) => Ok(same),
            _ => Err(unexpected("mtime reply")),
        }
    }

    /// Long poll for the server manifest.
    ///
    /// The server answers as soon as a store or delete lands, or after
    /// `notify_wait` with the current manifest.
    pub async fn change_notification(&self) -> DfsResult<Vec<FileRecord>> {
        let request = Request::ChangeNotification {
            max_wait_ms: self.config.notify_wait.as_millis() as u64,
        };
        let deadline = self.config.notify_wait + self.config.deadline;
        match self.unary(request, deadline).await? {
            Reply::Manifest(records) => Ok(records),
            _ => Err(unexpected("notification reply")),
        }
    }
}
