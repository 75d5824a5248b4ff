use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::Priority;

/// One unit of queued work: the boxed body, its cancellation handle, the
/// priority class it was dispatched at, and when it entered the pool.
/// Consumed exactly once by a worker; never persisted.
pub struct WorkItem {
    pub work: BoxFuture<'static, ()>,
    pub cancellation: CancellationToken,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

impl WorkItem {
    pub fn new(
        priority: Priority,
        cancellation: CancellationToken,
        work: BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            work,
            cancellation,
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("priority", &self.priority)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}
