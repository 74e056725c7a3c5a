//! Atomically replaced, read-mostly shared values.

use std::sync::Arc;

use tokio::sync::watch;

/// Holds one immutable `Arc<T>` that writers replace whole.
///
/// Readers pin the current value with [`SnapshotCell::load`] and keep using it
/// for as long as they hold the `Arc`, regardless of later publications.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    tx: watch::Sender<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<T> {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot, returning the previous one.
    pub fn publish(&self, next: T) -> Arc<T> {
        self.tx.send_replace(Arc::new(next))
    }

    /// Receiver that is notified on every publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}
