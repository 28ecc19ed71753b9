//! Directory enumeration and per-file metadata.
//!
//! Records are derived from the filesystem on every call. Nothing is cached,
//! so a manifest is never staler than the moment it was built.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::checksum::file_checksum;
use crate::error::{DfsError, DfsResult};
use crate::protocol::{FileRecord, ListEntry, UnixTime};

/// Prefix of the hidden temporary files used for in-flight transfers.
pub const PARTIAL_PREFIX: &str = ".dfsync-";
/// Suffix of the hidden temporary files used for in-flight transfers.
pub const PARTIAL_SUFFIX: &str = ".part";

fn unix_secs(time: std::io::Result<SystemTime>) -> UnixTime {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as UnixTime)
}

/// Modification time of `meta` in whole seconds.
pub fn mtime_of(meta: &std::fs::Metadata) -> UnixTime {
    unix_secs(meta.modified())
}

/// Creation time of `meta`, falling back to the mtime where the platform has none.
pub fn ctime_of(meta: &std::fs::Metadata) -> UnixTime {
    match meta.created() {
        Ok(t) => unix_secs(Ok(t)),
        Err(_) => mtime_of(meta),
    }
}

/// True for the temporary files written while a transfer is in flight.
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX)
}

/// Resolve a flat file name against a mount directory.
///
/// Names must be a single path component; anything that could escape the
/// mount is refused.
pub fn resolve(mount: &Path, name: &str) -> DfsResult<PathBuf> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && !is_partial_name(name);
    if !valid {
        return Err(DfsError::NotFound(format!("invalid file name {name:?}")));
    }
    Ok(mount.join(name))
}

/// Metadata of a regular file, or `None` if it does not exist.
pub async fn stat_file(mount: &Path, name: &str) -> DfsResult<Option<FileRecord>> {
    let path = resolve(mount, name)?;
    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    record_from(&path, name, &meta).await
}

/// Build the record for `path` from metadata already read.
///
/// The file may be removed before its content is hashed; that reads as absent.
async fn record_from(path: &Path, name: &str, meta: &std::fs::Metadata) -> DfsResult<Option<FileRecord>> {
    let checksum = match file_checksum(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(FileRecord {
        name: name.to_string(),
        size: meta.len(),
        checksum,
        mtime: mtime_of(meta),
        ctime: ctime_of(meta),
    }))
}

/// Every regular file in `mount` with size, checksum and timestamps.
///
/// Files that vanish between the directory read and the stat are skipped.
pub async fn enumerate(mount: &Path) -> DfsResult<Vec<FileRecord>> {
    let mut records = Vec::new();
    for name in regular_file_names(mount).await? {
        match stat_file(mount, &name).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

/// Name and mtime of every regular file in `mount`. No checksums are computed.
pub async fn list(mount: &Path) -> DfsResult<Vec<ListEntry>> {
    let mut entries = Vec::new();
    for name in regular_file_names(mount).await? {
        if let Ok(meta) = tokio::fs::metadata(mount.join(&name)).await {
            entries.push(ListEntry {
                mtime: mtime_of(&meta),
                name,
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn regular_file_names(mount: &Path) -> DfsResult<Vec<String>> {
    let mut names = Vec::new();
    let mut dir = tokio::fs::read_dir(mount).await?;
    while let Some(entry) = dir.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            log::debug!("Skipping non UTF-8 file name in {}", mount.display());
            continue;
        };
        if is_partial_name(&name) {
            continue;
        }
        // Follow symlinks like stat(2) does
        match tokio::fs::metadata(entry.path()).await {
            Ok(meta) if meta.is_file() => names.push(name),
            _ => {}
        }
    }
    Ok(names)
}
