//! Server and client configuration.
//!
//! Client identity, mount paths and deadlines live here and are passed in at
//! construction; nothing is read from process-wide state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Default transfer chunk size (4 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Opaque client identity: host name plus a per-process session tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Derive an id for this process from the host name and a random session tag.
    pub fn generate() -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        let session = Uuid::new_v4().simple().to_string();
        Self(format!("{host}-{}", &session[..8]))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory whose regular files are served
    pub mount_path: PathBuf,
    /// Maximum number of calls handled at once (notification calls excluded)
    pub worker_count: usize,
    /// Bytes per fetch chunk
    pub chunk_size: usize,
    /// Upper bound on how long a notification call is parked waiting for a change
    pub max_notify_wait: Duration,
    /// Change feed channel capacity
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:50051".to_string(),
            mount_path: PathBuf::from("mnt/server"),
            worker_count: 8,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_notify_wait: Duration::from_secs(30),
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Config for testing (small chunks, short notification waits).
    pub fn for_testing(mount_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            mount_path: mount_path.into(),
            worker_count: 4,
            chunk_size: 64,
            max_notify_wait: Duration::from_millis(500),
            broadcast_capacity: 64,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:50051`
    pub server_url: String,
    /// Local directory kept in sync with the server
    pub mount_path: PathBuf,
    /// Identity presented to the server's lock table
    pub client_id: ClientId,
    /// Per-call deadline
    pub deadline: Duration,
    /// Bytes per store chunk
    pub chunk_size: usize,
    /// How long the server may park a notification call
    pub notify_wait: Duration,
    /// Sleep between notification retries after a transport failure
    pub retry_backoff: Duration,
    /// Watch the mount directory for local edits
    pub watch_local: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:50051".to_string(),
            mount_path: PathBuf::from("mnt/client"),
            client_id: ClientId::generate(),
            deadline: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            notify_wait: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(5),
            watch_local: false,
        }
    }
}

impl ClientConfig {
    /// Config for testing against a local server.
    pub fn for_testing(server_url: impl Into<String>, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            mount_path: mount_path.into(),
            client_id: ClientId::generate(),
            deadline: Duration::from_secs(5),
            chunk_size: 64,
            notify_wait: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(50),
            watch_local: false,
        }
    }

    pub fn with_client_id(mut self, id: ClientId) -> Self {
        self.client_id = id;
        self
    }
}
