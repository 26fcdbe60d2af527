//! Shared change-feed snapshot.
//!
//! The collector owns the publishing side and replaces the whole snapshot
//! on every refresh. Probes hold a [`FeedHandle`] and always observe a
//! complete snapshot, either the old one or the new one.

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::FeedEntry;

/// An immutable snapshot of the recent-changes log.
pub type Feed = Arc<Vec<FeedEntry>>;

/// Create a connected publisher/handle pair starting from an empty feed.
pub fn feed_channel() -> (FeedPublisher, FeedHandle) {
    let (tx, rx) = watch::channel(Feed::default());
    (FeedPublisher { tx }, FeedHandle { rx })
}

/// Writing side, held by the collector.
#[derive(Debug)]
pub struct FeedPublisher {
    tx: watch::Sender<Feed>,
}

impl FeedPublisher {
    /// Swap in a new snapshot, returning the previous one.
    pub fn replace(&self, entries: Vec<FeedEntry>) -> Feed {
        self.tx.send_replace(Arc::new(entries))
    }

    /// Another read handle onto the same snapshot.
    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the current snapshot.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    rx: watch::Receiver<Feed>,
}

impl FeedHandle {
    /// A handle pinned to a fixed snapshot.
    pub fn fixed(entries: Vec<FeedEntry>) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(entries));
        Self { rx }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Feed {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModuleDocument;

    fn entry(id: &str) -> FeedEntry {
        FeedEntry {
            id: id.to_string(),
            doc: ModuleDocument::default(),
        }
    }

    #[test]
    fn readers_see_whole_snapshots() {
        let (publisher, handle) = feed_channel();
        assert!(handle.snapshot().is_empty());

        let held = handle.snapshot();
        publisher.replace(vec![entry("a"), entry("b")]);

        assert!(held.is_empty());
        assert_eq!(handle.snapshot().len(), 2);
        assert_eq!(publisher.handle().snapshot().len(), 2);
    }

    #[test]
    fn fixed_handle_outlives_its_sender() {
        let handle = FeedHandle::fixed(vec![entry("a")]);
        assert_eq!(handle.snapshot()[0].id, "a");
    }
}
