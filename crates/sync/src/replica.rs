use async_trait::async_trait;

use crate::{Cursor, SyncItem};

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
	/// Transient failure or an ordering precondition not yet met (a dependency
	/// stream hasn't caught up). The stream stops at this item and the
	/// scheduler retries with backoff; nothing is skipped.
	#[error("apply blocked: {0}")]
	Retryable(String),
	/// Irrecoverably malformed payload. Quarantined with a recorded exception
	/// so one bad item cannot block the stream forever.
	#[error("poison item: {0}")]
	Poison(String),
}

/// The local replica's apply seam.
#[async_trait]
pub trait Replica: Send + Sync {
	/// Applies `item` and persists `cursor` within the same storage
	/// transaction. Re-applying an already-applied item must be a no-op:
	/// delivery is at-least-once, effect is exactly-once.
	async fn apply(&self, item: &SyncItem, cursor: &Cursor) -> Result<(), ApplyError>;
}
