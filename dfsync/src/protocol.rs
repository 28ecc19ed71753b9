//! Binary call protocol over WebSocket frames.
//!
//! Each call uses one WebSocket connection. Frames are bincode-encoded:
//! ```text
//! client                                 server
//!   │ Call { deadline_ms, request } ──────► │
//!   │ Chunk(bytes)*  (Store only)   ──────► │
//!   │ EndOfStream    (Store only)   ──────► │
//!   │ ◄────── FetchChunk{..}*  (Fetch only) │
//!   │ ◄────── Reply(Result<Reply, Status>)  │  always last
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, RpcStatus};

/// Seconds since the Unix epoch, the resolution used for every mtime/ctime.
pub type UnixTime = i64;

/// Content fingerprint plus modification time of one side's copy of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub checksum: u32,
    pub mtime: UnixTime,
}

/// Metadata for one regular file in a mount directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub checksum: u32,
    pub mtime: UnixTime,
    pub ctime: UnixTime,
}

impl FileRecord {
    pub fn version(&self) -> FileVersion {
        FileVersion {
            checksum: self.checksum,
            mtime: self.mtime,
        }
    }
}

/// One row of a `List` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub mtime: UnixTime,
}

/// Header sent at the start of a Store stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub file_name: String,
    pub file_size: u64,
    pub client_id: String,
    pub checksum: u32,
    pub mtime: UnixTime,
}

impl StoreHeader {
    pub fn version(&self) -> FileVersion {
        FileVersion {
            checksum: self.checksum,
            mtime: self.mtime,
        }
    }
}

/// Fetch request. `local` is the caller's copy, if it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub file_name: String,
    pub local: Option<FileVersion>,
}

/// Call request, the first frame of every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    RequestLock { file_name: String, client_id: String },
    Store(StoreHeader),
    Fetch(FetchRequest),
    Delete { file_name: String, client_id: String },
    List,
    Stat { file_name: String },
    /// Compare a checksum against the server copy without transferring bytes
    Checksum { file_name: String, client_id: String, checksum: u32 },
    /// Compare an mtime against the server copy
    CompareMtime { file_name: String, mtime: UnixTime },
    /// Long poll: returns the manifest after a change or `max_wait_ms`
    ChangeNotification { max_wait_ms: u64 },
}

impl Request {
    /// Short name used in logs and stats.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestLock { .. } => "RequestLock",
            Self::Store(_) => "Store",
            Self::Fetch(_) => "Fetch",
            Self::Delete { .. } => "Delete",
            Self::List => "List",
            Self::Stat { .. } => "Stat",
            Self::Checksum { .. } => "Checksum",
            Self::CompareMtime { .. } => "CompareMtime",
            Self::ChangeNotification { .. } => "ChangeNotification",
        }
    }

    /// File and client of a call that runs while the client holds the file's lock.
    pub fn lock_holder(&self) -> Option<(&str, &str)> {
        match self {
            Self::Store(header) => Some((header.file_name.as_str(), header.client_id.as_str())),
            Self::Delete {
                file_name,
                client_id,
            } => Some((file_name.as_str(), client_id.as_str())),
            _ => None,
        }
    }
}

/// Successful call result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Empty,
    Stored { file_name: String },
    Fetched { bytes: u64 },
    List(Vec<ListEntry>),
    Stat(FileRecord),
    Checksum { checksum: u32 },
    SameTimestamp(bool),
    Manifest(Vec<FileRecord>),
}

/// One message of a Fetch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchChunk {
    pub file_size: u64,
    /// False when the caller's copy is already current; no content follows
    pub copy_needed: bool,
    pub content: Vec<u8>,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Call { deadline_ms: u64, request: Request },
    Chunk(Vec<u8>),
    EndOfStream,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Fetch(FetchChunk),
    Reply(Result<Reply, RpcStatus>),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[test]
    fn test_lock_holder_only_for_locked_calls() {
        let delete = Request::Delete {
            file_name: "a.txt".into(),
            client_id: "alice".into(),
        };
        assert_eq!(delete.lock_holder(), Some(("a.txt", "alice")));
        let fetch = Request::Fetch(FetchRequest {
            file_name: "a.txt".into(),
            local: None,
        });
        assert_eq!(fetch.lock_holder(), None);
        assert_eq!(Request::List.lock_holder(), None);
    }

    #[test]
    fn test_store_call_roundtrip() {
        let frame = ClientFrame::Call {
            deadline_ms: 2500,
            request: Request::Store(StoreHeader {
                file_name: "report.txt".into(),
                file_size: 100,
                client_id: "host-1".into(),
                checksum: 0xDEAD_BEEF,
                mtime: 1_700_000_000,
            }),
        };
        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let frame = ServerFrame::Reply(Err(RpcStatus::new(
            StatusCode::ResourceExhausted,
            "held by host-2",
        )));
        match ServerFrame::decode(&frame.encode().unwrap()).unwrap() {
            ServerFrame::Reply(Err(status)) => {
                assert_eq!(status.code, StatusCode::ResourceExhausted);
                assert_eq!(status.message, "held by host-2");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_chunk_frame_overhead_small() {
        let frame = ClientFrame::Chunk(vec![7u8; 4096]);
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 4096 + 16, "overhead too large: {}", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(ServerFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ClientFrame::decode(&[]).is_err());
    }

    #[test]
    fn test_request_names() {
        assert_eq!(Request::List.name(), "List");
        assert_eq!(
            Request::ChangeNotification { max_wait_ms: 1 }.name(),
            "ChangeNotification"
        );
    }

    #[test]
    fn test_record_version() {
        let record = FileRecord {
            name: "a".into(),
            size: 3,
            checksum: 42,
            mtime: 10,
            ctime: 5,
        };
        assert_eq!(record.version(), FileVersion { checksum: 42, mtime: 10 });
    }
}
