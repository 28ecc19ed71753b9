//! # dfsync — Distributed file synchronization over WebSocket
//!
//! One server exposes a flat mount directory; many clients keep their own
//! mount in step with it. Writers coordinate through per-file advisory locks
//! held on the server, and conflicts are settled by checksum first, then by
//! modification time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   one connection   ┌──────────────────┐
//! │ DfsClient   │ ◄────per call────► │ DfsServer        │
//! │ + SyncLoop  │   bincode frames   │  worker permits  │
//! └──────┬──────┘                    └────────┬─────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌──────────────────┐
//! │ client mount│                    │ TransferEndpoint │
//! │ (+ watcher) │                    │  LockTable       │
//! └─────────────┘                    │  ChangeFeed      │
//!                                    └────────┬─────────┘
//!                                             ▼
//!                                       server mount
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire frames and request/reply types
//! - [`locks`] — Per-file write locks under one mutex
//! - [`conflict`] — Checksum/mtime conflict resolution
//! - [`transfer`] — Store, Fetch, Delete and probe handlers
//! - [`changes`] — Change feed that wakes parked notification calls
//! - [`server`] — WebSocket server with a bounded worker pool
//! - [`client`] — WebSocket client, one connection per call
//! - [`sync`] — Client notification loop and reconciliation
//! - [`watcher`] — Local mount watcher feeding the sync loop

pub mod changes;
pub mod checksum;
pub mod client;
pub mod config;
pub mod conflict;
pub mod deadline;
pub mod error;
pub mod locks;
pub mod manifest;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transfer;
pub mod watcher;

// Re-exports for convenience
pub use changes::{ChangeEvent, ChangeFeed, ChangeFeedStats, ChangeKind};
pub use client::DfsClient;
pub use config::{ClientConfig, ClientId, ServerConfig, DEFAULT_CHUNK_SIZE};
pub use conflict::{Direction, Resolution};
pub use deadline::Deadline;
pub use error::{DfsError, DfsResult, ProtocolError, RpcStatus, StatusCode};
pub use locks::{LockEntry, LockStats, LockTable};
pub use protocol::{
    ClientFrame, FetchChunk, FetchRequest, FileRecord, FileVersion, ListEntry, Reply, Request,
    ServerFrame, StoreHeader, UnixTime,
};
pub use server::{DfsServer, ServerStats};
pub use sync::{ReconcileReport, SyncAction, SyncHandle, SyncLoop};
pub use transfer::{TransferEndpoint, TransferSession, TransferStats};
pub use watcher::{LocalChange, LocalChangeKind};
