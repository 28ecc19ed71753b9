//! Local mount watcher.
//!
//! Feeds edits made in the client mount to the sync loop so they are stored
//! (or deleted) on the server without waiting for a manifest round. Events
//! are debounced, then each touched name is classified by whether the file
//! still exists once things have settled.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use crate::manifest::is_partial_name;

/// Quiet period before a burst of events is reported.
pub const WATCH_DEBOUNCE_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChangeKind {
    /// Created or modified; the file exists now
    Changed,
    /// The file is gone
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub file_name: String,
    pub kind: LocalChangeKind,
}

/// Names of mount entries touched by `event`.
///
/// Access events, temporary transfer files and anything outside the top
/// level of the mount are ignored.
pub fn touched_names(event: &Event, mount: &Path) -> Vec<String> {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    );
    if !relevant {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| p.parent().is_some_and(|parent| same_dir(parent, mount)))
        .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
        .filter(|name| !is_partial_name(name))
        .collect()
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Classify settled names by their current state on disk.
pub async fn settle(mount: &Path, names: impl IntoIterator<Item = String>) -> Vec<LocalChange> {
    let mut changes = Vec::new();
    for file_name in names {
        let kind = match tokio::fs::metadata(mount.join(&file_name)).await {
            Ok(meta) if meta.is_file() => LocalChangeKind::Changed,
            Ok(_) => continue,
            Err(_) => LocalChangeKind::Removed,
        };
        changes.push(LocalChange { file_name, kind });
    }
    changes
}

/// Watch `mount` and send debounced batches of changes to `tx`.
///
/// Runs until `shutdown` flips to true or the receiver is dropped.
pub async fn watcher_task(
    mount: PathBuf,
    tx: mpsc::Sender<Vec<LocalChange>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            let _ = notify_tx.blocking_send(res);
        },
        Config::default().with_poll_interval(Duration::from_millis(WATCH_DEBOUNCE_MS)),
    ) {
        Ok(w) => w,
        Err(e) => {
            log::error!("Failed to create mount watcher: {e}");
            return;
        }
    };

    if let Err(e) = watcher.watch(&mount, RecursiveMode::NonRecursive) {
        log::error!("Failed to watch {}: {e}", mount.display());
        return;
    }
    log::info!("Watching {} for local changes", mount.display());

    let debounce = Duration::from_millis(WATCH_DEBOUNCE_MS);
    let mut debounce_timer: Option<tokio::time::Instant> = None;
    let mut pending = BTreeSet::new();

    loop {
        tokio::select! {
            res = notify_rx.recv() => {
                match res {
                    Some(Ok(event)) => {
                        let names = touched_names(&event, &mount);
                        if !names.is_empty() {
                            log::trace!("Mount event {:?} on {names:?}", event.kind);
                            pending.extend(names);
                            debounce_timer = Some(tokio::time::Instant::now() + debounce);
                        }
                    }
                    Some(Err(e)) => log::warn!("Mount watcher error: {e}"),
                    None => break,
                }
            }
            _ = async {
                match debounce_timer {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                debounce_timer = None;
                let changes = settle(&mount, std::mem::take(&mut pending)).await;
                if changes.is_empty() {
                    continue;
                }
                log::debug!("{} local change(s) settled", changes.len());
                if tx.send(changes).await.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("Stopped watching {}", mount.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    #[test]
    fn test_touched_names_filters_partials_and_subdirs() {
        let mount = Path::new("/srv/mount");
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(mount.join("a.txt"))
            .add_path(mount.join(".dfsync-abc123.part"))
            .add_path(mount.join("sub").join("deep.txt"));
        assert_eq!(touched_names(&event, mount), vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_access_events_ignored() {
        let mount = Path::new("/srv/mount");
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(mount.join("a.txt"));
        assert!(touched_names(&event, mount).is_empty());
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(mount.join("a.txt"));
        assert_eq!(touched_names(&removed, mount).len(), 1);
    }

    #[tokio::test]
    async fn test_settle_classifies_by_existence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("here.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        let changes = settle(
            dir.path(),
            ["here.txt", "gone.txt", "folder"].map(String::from),
        )
        .await;
        assert_eq!(
            changes,
            vec![
                LocalChange {
                    file_name: "here.txt".into(),
                    kind: LocalChangeKind::Changed
                },
                LocalChange {
                    file_name: "gone.txt".into(),
                    kind: LocalChangeKind::Removed
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(watcher_task(dir.path().to_path_buf(), tx, shutdown_rx));

        // Give the backend a moment to register the watch
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("new.txt"), b"hello").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report the new file")
            .unwrap();
        assert!(batch.iter().any(|c| c.file_name == "new.txt" && c.kind == LocalChangeKind::Changed));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
