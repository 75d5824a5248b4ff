use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process-wide map from occurrence id to its cancellation handle.
///
/// Populated when an occurrence is dispatched and emptied on terminal
/// status, so an external caller can cancel a queued or running occurrence
/// by id.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    handles: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, token: CancellationToken) {
        self.handles.insert(id, token);
    }

    pub fn deregister(&self, id: Uuid) {
        self.handles.remove(&id);
    }

    /// Signal the handle for `id` if one is live. Returns whether an entry
    /// existed; never errors for a missing id, and repeated calls on the
    /// same id are safe.
    pub fn request_cancellation(&self, id: Uuid) -> bool {
        match self.handles.get(&id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
