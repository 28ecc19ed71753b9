//! Fan-out of "the mount changed" events to parked notification calls.
//!
//! Uses a tokio broadcast channel so one publish reaches every waiting
//! subscriber in O(1). Events only wake waiters; the manifest they return is
//! always enumerated fresh from disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Stored,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub file_name: String,
    pub kind: ChangeKind,
}

/// Statistics for monitoring the feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeedStats {
    pub published: u64,
    pub wakeups: u64,
    pub timeouts: u64,
    pub waiting: usize,
}

#[derive(Default)]
struct AtomicFeedStats {
    published: AtomicU64,
    wakeups: AtomicU64,
    timeouts: AtomicU64,
}

/// Change feed shared by the transfer handlers (publishers) and the
/// notification handler (subscribers).
pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    capacity: usize,
    stats: AtomicFeedStats,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicFeedStats::default(),
        }
    }

    /// Announce a change. Returns the number of waiters woken.
    pub fn publish(&self, file_name: &str, kind: ChangeKind) -> usize {
        let event = Arc::new(ChangeEvent {
            file_name: file_name.to_string(),
            kind,
        });
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine: nobody is parked right now
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeEvent>> {
        self.sender.subscribe()
    }

    /// Park until the next change or until `max_wait` elapses.
    ///
    /// Returns the event that woke us, `None` on timeout.
    pub async fn wait_for_change(&self, max_wait: Duration) -> Option<Arc<ChangeEvent>> {
        let mut rx = self.subscribe();
        loop {
            match tokio::time::timeout(max_wait, rx.recv()).await {
                Ok(Ok(event)) => {
                    self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    log::debug!("Change feed subscriber lagged by {n} events");
                    continue;
                }
                // Sender is owned by self, so Closed cannot happen while we borrow it
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChangeFeedStats {
        ChangeFeedStats {
            published: self.stats.published.load(Ordering::Relaxed),
            wakeups: self.stats.wakeups.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            waiting: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_waiters() {
        let feed = ChangeFeed::new(8);
        assert_eq!(feed.publish("a.txt", ChangeKind::Stored), 0);
        assert_eq!(feed.stats().published, 1);
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let feed = ChangeFeed::new(8);
        let woke = feed.wait_for_change(Duration::from_millis(20)).await;
        assert!(woke.is_none());
        assert_eq!(feed.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_publish() {
        let feed = Arc::new(ChangeFeed::new(8));
        let waiter = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.wait_for_change(Duration::from_secs(5)).await })
        };
        // Let the waiter subscribe
        while feed.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }
        feed.publish("b.txt", ChangeKind::Deleted);

        let event = waiter.await.unwrap().expect("should wake");
        assert_eq!(event.file_name, "b.txt");
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert_eq!(feed.stats().wakeups, 1);
    }

    #[tokio::test]
    async fn test_one_publish_wakes_all() {
        let feed = Arc::new(ChangeFeed::new(8));
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let feed = feed.clone();
                tokio::spawn(async move { feed.wait_for_change(Duration::from_secs(5)).await })
            })
            .collect();
        while feed.stats().waiting < 5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(feed.publish("c.txt", ChangeKind::Stored), 5);
        for w in waiters {
            assert!(w.await.unwrap().is_some());
        }
    }
}
