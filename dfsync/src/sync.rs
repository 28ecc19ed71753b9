//! Client-side reconciliation against the server manifest.
//!
//! The notification loop long-polls the server for its manifest and brings
//! the local mount in line with it, file by file:
//!
//! | local copy | checksums | mtimes       | action  |
//! |------------|-----------|--------------|---------|
//! | absent     | -         | -            | Fetch   |
//! | present    | equal     | any          | nothing |
//! | present    | differ    | local newer  | Store   |
//! | present    | differ    | server newer | Fetch   |
//! | present    | differ    | equal        | logged, nothing |
//!
//! Reconcile passes and local-change batches share one single-flight token,
//! so at most one of them touches the mount at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::DfsClient;
use crate::error::{DfsError, DfsResult};
use crate::protocol::FileRecord;
use crate::watcher::{self, LocalChange, LocalChangeKind};

/// What to do about one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Fetch,
    Store,
    Skip,
    /// Same mtime, different content; needs a human
    Anomaly,
}

/// Decide how to reconcile the local copy of a file with the server's.
pub fn plan(local: Option<&FileRecord>, remote: &FileRecord) -> SyncAction {
    let Some(local) = local else {
        return SyncAction::Fetch;
    };
    if local.checksum == remote.checksum {
        return SyncAction::Skip;
    }
    match local.mtime.cmp(&remote.mtime) {
        std::cmp::Ordering::Greater => SyncAction::Store,
        std::cmp::Ordering::Less => SyncAction::Fetch,
        std::cmp::Ordering::Equal => SyncAction::Anomaly,
    }
}

/// Outcome of one reconcile pass or local-change batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub fetched: Vec<String>,
    pub stored: Vec<String>,
    pub deleted: Vec<String>,
    /// Already in sync, or skipped for an expected reason (lock busy, stale)
    pub skipped: Vec<String>,
    pub anomalies: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    /// True when nothing was transferred, deleted or flagged.
    pub fn is_quiet(&self) -> bool {
        self.fetched.is_empty()
            && self.stored.is_empty()
            && self.deleted.is_empty()
            && self.anomalies.is_empty()
            && self.failed.is_empty()
    }

    /// Book a failed or skipped operation. Returns true if it succeeded.
    fn absorb(&mut self, file_name: &str, result: DfsResult<()>) -> bool {
        match result {
            Ok(()) => return true,
            Err(e) if e.is_expected() || matches!(e, DfsError::NotFound(_)) => {
                log::debug!("{file_name}: {e}");
                self.skipped.push(file_name.to_string());
            }
            Err(e) => {
                log::warn!("{file_name}: {e}");
                self.failed.push(file_name.to_string());
            }
        }
        false
    }
}

/// Long-poll loop keeping one mount in sync with the server.
pub struct SyncLoop {
    client: Arc<DfsClient>,
    token: Arc<Mutex<()>>,
    rounds: AtomicU64,
}

impl SyncLoop {
    pub fn new(client: Arc<DfsClient>) -> Self {
        Self {
            client,
            token: Arc::new(Mutex::new(())),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<DfsClient> {
        &self.client
    }

    /// The single-flight token. Hold it to keep reconcile passes out of the mount.
    pub fn token(&self) -> Arc<Mutex<()>> {
        self.token.clone()
    }

    /// Number of manifests received so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Bring the mount in line with `manifest`.
    ///
    /// Waits for any pass already in flight to finish first.
    pub async fn reconcile(&self, manifest: &[FileRecord]) -> ReconcileReport {
        let _flight = self.token.lock().await;
        let mut report = ReconcileReport::default();

        for remote in manifest {
            let name = remote.name.as_str();
            let local = match self.client.local_record(name).await {
                Ok(local) => local,
                Err(e) => {
                    log::warn!("Cannot stat local {name}: {e}");
                    report.failed.push(name.to_string());
                    continue;
                }
            };

            match plan(local.as_ref(), remote) {
                SyncAction::Skip => report.skipped.push(name.to_string()),
                SyncAction::Fetch => {
                    let result = self.client.fetch(name).await.map(|_| ());
                    if report.absorb(name, result) {
                        report.fetched.push(name.to_string());
                    }
                }
                SyncAction::Store => {
                    let result = self.client.store(name).await;
                    if report.absorb(name, result) {
                        report.stored.push(name.to_string());
                    }
                }
                SyncAction::Anomaly => {
                    log::error!(
                        "{name} differs from the server copy but both have mtime {}; leaving it alone",
                        remote.mtime
                    );
                    report.anomalies.push(name.to_string());
                }
            }
        }
        report
    }

    /// Push a settled batch of local edits to the server.
    pub async fn apply_local_changes(&self, changes: &[LocalChange]) -> ReconcileReport {
        let _flight = self.token.lock().await;
        let mut report = ReconcileReport::default();

        for change in changes {
            let name = change.file_name.as_str();
            match change.kind {
                LocalChangeKind::Changed => {
                    let result = self.client.store(name).await;
                    if report.absorb(name, result) {
                        report.stored.push(name.to_string());
                    }
                }
                LocalChangeKind::Removed => {
                    let result = self.client.delete(name).await;
                    if report.absorb(name, result) {
                        report.deleted.push(name.to_string());
                    }
                }
            }
        }
        report
    }

    /// One notification round: wait for the manifest, then reconcile.
    pub async fn poll_once(&self) -> DfsResult<ReconcileReport> {
        let manifest = self.client.change_notification().await?;
        self.rounds.fetch_add(1, Ordering::Relaxed);
        Ok(self.reconcile(&manifest).await)
    }

    /// Poll until `shutdown` flips to true.
    ///
    /// Failed rounds are retried after the configured backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let backoff = self.client.config().retry_backoff;
        log::info!(
            "Sync loop started for {} as {}",
            self.client.mount_path().display(),
            self.client.client_id()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                result = self.poll_once() => match result {
                    Ok(report) if report.is_quiet() => {}
                    Ok(report) => log::info!(
                        "Reconciled: {} fetched, {} stored, {} anomalies, {} failed",
                        report.fetched.len(),
                        report.stored.len(),
                        report.anomalies.len(),
                        report.failed.len()
                    ),
                    Err(e) => {
                        log::warn!("Change notification failed: {e}; retrying in {backoff:?}");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Sync loop stopped");
    }
}

/// Background tasks keeping a mount in sync. Dropping the handle leaves them running.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Spawn the notification loop, plus the mount watcher when enabled.
    pub fn start(sync: Arc<SyncLoop>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if sync.client().config().watch_local {
            let (tx, mut rx) = mpsc::channel::<Vec<LocalChange>>(64);
            let mount = sync.client().mount_path().to_path_buf();
            tasks.push(tokio::spawn(watcher::watcher_task(mount, tx, shutdown_rx.clone())));

            let sync = sync.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(changes) = rx.recv().await {
                    let report = sync.apply_local_changes(&changes).await;
                    if !report.is_quiet() {
                        log::info!(
                            "Local changes: {} stored, {} deleted, {} failed",
                            report.stored.len(),
                            report.deleted.len(),
                            report.failed.len()
                        );
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(async move { sync.run(shutdown_rx).await }));
        Self { shutdown, tasks }
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Sync task ended abnormally: {e}");
            }
        }
    }
}
