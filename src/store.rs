//! Shared document collection store
//!
//! The collection is only ever replaced as a whole. Writers hand in a
//! function from the current value to the next one; handing back the same
//! collection (by identity) notifies nobody.

use std::sync::Arc;
use tokio::sync::watch;

use crate::document::DocumentCollection;

/// Whole-value state mutation seam.
pub trait DocumentStore: Send + Sync {
    fn update(&self, f: &mut dyn FnMut(&DocumentCollection) -> DocumentCollection);
}

/// A [`DocumentStore`] readers can watch. Clones share the value.
#[derive(Debug, Clone)]
pub struct SharedCollection {
    tx: Arc<watch::Sender<DocumentCollection>>,
}

impl SharedCollection {
    pub fn new(initial: DocumentCollection) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current value.
    pub fn snapshot(&self) -> DocumentCollection {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every real change.
    pub fn subscribe(&self) -> watch::Receiver<DocumentCollection> {
        self.tx.subscribe()
    }
}

impl DocumentStore for SharedCollection {
    fn update(&self, f: &mut dyn FnMut(&DocumentCollection) -> DocumentCollection) {
        self.tx.send_if_modified(|current| {
            let next = f(current);
            if next.ptr_eq(current) {
                return false;
            }
            *current = next;
            true
        });
    }
}
