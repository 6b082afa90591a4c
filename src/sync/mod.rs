//! Background sync: a durable queue of mutating requests that failed while
//! offline, replayed when connectivity returns.

mod queue;
mod store;

pub use queue::{Backoff, SyncQueue, SyncReport};
#[cfg(test)]
pub use store::MemoryQueueStore;
pub use store::{QueueStore, SyncQueueItem, SYNC_QUEUE_KEY};
