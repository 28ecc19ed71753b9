//! WebSocket file server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── LockTable (one mutex)
//!             ├── accept ── call ──────┼── TransferEndpoint ── mount dir
//! Client B ──┘     │                  └── ChangeFeed ──► parked notifications
//!                  └── worker permits (Semaphore)
//! ```
//!
//! Every call arrives on its own connection. Lock, transfer and probe calls
//! wait for one of `worker_count` permits, in arrival order; notification
//! calls park on the change feed without holding a permit, so long polls can
//! never starve transfers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::changes::{ChangeFeed, ChangeFeedStats};
use crate::config::{ClientId, ServerConfig};
use crate::deadline::Deadline;
use crate::error::{DfsError, DfsResult, ProtocolError};
use crate::locks::{LockStats, LockTable};
use crate::protocol::{ClientFrame, FetchChunk, FetchRequest, Reply, Request, ServerFrame};
use crate::transfer::{TransferEndpoint, TransferStats};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Fetch chunks buffered between the file reader and the socket.
const FETCH_QUEUE_DEPTH: usize = 16;

/// Extra time granted to swallow the rest of a rejected store stream.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct ServerState {
    config: ServerConfig,
    endpoint: Arc<TransferEndpoint>,
    changes: Arc<ChangeFeed>,
    workers: Arc<Semaphore>,
    stats: RwLock<ServerStats>,
}

/// The file server.
pub struct DfsServer {
    state: Arc<ServerState>,
}

impl DfsServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let locks = Arc::new(LockTable::new());
        let changes = Arc::new(ChangeFeed::new(config.broadcast_capacity));
        let endpoint = Arc::new(TransferEndpoint::new(
            config.mount_path.clone(),
            config.chunk_size,
            locks,
            changes.clone(),
        ));
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));

        Self {
            state: Arc::new(ServerState {
                config,
                endpoint,
                changes,
                workers,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address, creating the mount directory if needed.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        tokio::fs::create_dir_all(&self.state.config.mount_path).await?;
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!(
            "File server listening on {} serving {}",
            listener.local_addr()?,
            self.state.config.mount_path.display()
        );
        Ok(listener)
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind().await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Serve the single call carried by one connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve_call(&state, addr, &mut ws_sender, &mut ws_receiver).await;

        {
            let mut s = state.stats.write().await;
            s.active_connections -= 1;
        }
        let _ = ws_sender.close().await;
        result
    }

    async fn serve_call(
        state: &ServerState,
        addr: SocketAddr,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some((deadline_ms, request)) = read_call(ws_receiver).await? else {
            log::debug!("Connection from {addr} closed before sending a call");
            return Ok(());
        };
        let deadline = Deadline::from_millis(deadline_ms);
        let kind = request.name();
        log::debug!("{kind} call from {addr} ({deadline_ms} ms)");

        {
            let mut s = state.stats.write().await;
            s.total_calls += 1;
        }

        let mut incoming = IncomingChunks::new(ws_receiver);
        let result = match request {
            Request::ChangeNotification { max_wait_ms } => {
                let wait = Duration::from_millis(max_wait_ms).min(state.config.max_notify_wait);
                state
                    .endpoint
                    .manifest(wait, deadline)
                    .await
                    .map(Reply::Manifest)
            }
            request => {
                let acquire = state.workers.clone().acquire_owned();
                match tokio::time::timeout_at(deadline.expires_at(), acquire).await {
                    Ok(Ok(_permit)) => {
                        Self::dispatch(state, request, deadline, ws_sender, &mut incoming).await
                    }
                    Ok(Err(_)) => Err(DfsError::Internal("worker pool closed".to_string())),
                    Err(_) => {
                        log::warn!("{kind} from {addr} expired waiting for a worker");
                        if let Some((file_name, client_id)) = request.lock_holder() {
                            state
                                .endpoint
                                .abandon_expired(file_name, &ClientId::new(client_id))
                                .await;
                        }
                        Err(DfsError::DeadlineExceeded)
                    }
                }
            }
        };

        if kind == "Store" && !incoming.finished {
            incoming.drain(deadline).await;
        }

        {
            let mut s = state.stats.write().await;
            s.bytes_in += incoming.bytes;
            if result.is_err() {
                s.failed_calls += 1;
            }
        }

        match &result {
            Ok(_) => log::debug!("{kind} from {addr} completed"),
            Err(e) if e.is_expected() => log::info!("{kind} from {addr}: {e}"),
            Err(e) => log::warn!("{kind} from {addr} failed: {e}"),
        }

        let frame = ServerFrame::Reply(result.map_err(|e| e.to_status()));
        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
        Ok(())
    }

    async fn dispatch(
        state: &ServerState,
        request: Request,
        deadline: Deadline,
        ws_sender: &mut WsSender,
        incoming: &mut IncomingChunks<'_>,
    ) -> DfsResult<Reply> {
        let endpoint = &state.endpoint;
        match request {
            Request::RequestLock {
                file_name,
                client_id,
            } => endpoint
                .request_lock(&file_name, &ClientId::new(client_id), deadline)
                .map(|()| Reply::Empty),
            Request::Store(header) => {
                let chunks = stream::unfold(&mut *incoming, |incoming| async move {
                    incoming.next_chunk().await.map(|chunk| (chunk, incoming))
                });
                endpoint
                    .store(&header, chunks, deadline)
                    .await
                    .map(|file_name| Reply::Stored { file_name })
            }
            Request::Fetch(request) => {
                let (result, bytes_out) =
                    Self::serve_fetch(endpoint.clone(), request, deadline, ws_sender).await;
                state.stats.write().await.bytes_out += bytes_out;
                result.map(|bytes| Reply::Fetched { bytes })
            }
            Request::Delete {
                file_name,
                client_id,
            } => endpoint
                .delete(&file_name, &ClientId::new(client_id), deadline)
                .await
                .map(|()| Reply::Empty),
            Request::List => endpoint.list(deadline).await.map(Reply::List),
            Request::Stat { file_name } => endpoint.stat(&file_name, deadline).await.map(Reply::Stat),
            Request::Checksum {
                file_name,
                client_id,
                checksum,
            } => endpoint
                .checksum_probe(&file_name, &ClientId::new(client_id), checksum, deadline)
                .await
                .map(|checksum| Reply::Checksum { checksum }),
            Request::CompareMtime { file_name, mtime } => endpoint
                .compare_mtime(&file_name, mtime, deadline)
                .await
                .map(Reply::SameTimestamp),
            Request::ChangeNotification { .. } => Err(DfsError::Internal(
                "notification call routed to a worker".to_string(),
            )),
        }
    }

    /// Run the file reader and the socket writer side by side.
    ///
    /// Returns the fetch outcome and the number of frame bytes written.
    async fn serve_fetch(
        endpoint: Arc<TransferEndpoint>,
        request: FetchRequest,
        deadline: Deadline,
        ws_sender: &mut WsSender,
    ) -> (DfsResult<u64>, u64) {
        let (tx, rx) = mpsc::channel::<FetchChunk>(FETCH_QUEUE_DEPTH);

        let producer = async move {
            let result = endpoint.fetch(&request, &tx, deadline).await;
            drop(tx);
            result
        };
        let forward = async move {
            let mut rx = rx;
            let mut written = 0u64;
            while let Some(chunk) = rx.recv().await {
                let bytes = ServerFrame::Fetch(chunk).encode()?;
                written += bytes.len() as u64;
                ws_sender
                    .send(Message::Binary(bytes.into()))
                    .await
                    .map_err(|e| DfsError::Cancelled(format!("fetch stream broken: {e}")))?;
            }
            Ok::<u64, DfsError>(written)
        };

        match tokio::join!(producer, forward) {
            (result, Ok(written)) => (result, written),
            // The socket is gone; the producer saw its channel close
            (_, Err(e)) => (Err(e), 0),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.state.endpoint.locks().stats()
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.state.endpoint.stats()
    }

    pub fn change_stats(&self) -> ChangeFeedStats {
        self.state.changes.stats()
    }

    /// Shared lock table, for inspection.
    pub fn locks(&self) -> &Arc<LockTable> {
        self.state.endpoint.locks()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// Read frames until the opening call arrives. `None` if the peer left first.
async fn read_call(ws_receiver: &mut WsReceiver) -> Result<Option<(u64, Request)>, ProtocolError> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                return match ClientFrame::decode(&data)? {
                    ClientFrame::Call {
                        deadline_ms,
                        request,
                    } => Ok(Some((deadline_ms, request))),
                    _ => Err(ProtocolError::UnexpectedFrame("expected a call header")),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ProtocolError::ConnectFailed(e.to_string())),
        }
    }
}

/// Store payload arriving on a connection, ended by `EndOfStream`.
struct IncomingChunks<'a> {
    receiver: &'a mut WsReceiver,
    /// Set once the stream ended, cleanly or not
    finished: bool,
    bytes: u64,
}

impl<'a> IncomingChunks<'a> {
    fn new(receiver: &'a mut WsReceiver) -> Self {
        Self {
            receiver,
            finished: false,
            bytes: 0,
        }
    }

    async fn next_chunk(&mut self) -> Option<DfsResult<Vec<u8>>> {
        if self.finished {
            return None;
        }
        loop {
            let frame = match self.receiver.next().await {
                Some(Ok(Message::Binary(data))) => ClientFrame::decode(&data),
                Some(Ok(Message::Close(_))) | None => {
                    self.finished = true;
                    return Some(Err(DfsError::Cancelled(
                        "client closed the store stream early".to_string(),
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(DfsError::Cancelled(format!("store stream broken: {e}"))));
                }
            };
            return match frame {
                Ok(ClientFrame::Chunk(bytes)) => {
                    self.bytes += bytes.len() as u64;
                    Some(Ok(bytes))
                }
                Ok(ClientFrame::EndOfStream) => {
                    self.finished = true;
                    None
                }
                Ok(ClientFrame::Call { .. }) => Some(Err(
                    ProtocolError::UnexpectedFrame("call header inside a store stream").into(),
                )),
                Err(e) => Some(Err(e.into())),
            };
        }
    }

    /// Swallow the rest of a store stream the handler stopped reading, so the
    /// client sees the reply instead of a reset connection.
    async fn drain(&mut self, deadline: Deadline) {
        let until = deadline.expires_at().max(tokio::time::Instant::now() + DRAIN_GRACE);
        while !self.finished {
            match tokio::time::timeout_at(until, self.next_chunk()).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }
}
