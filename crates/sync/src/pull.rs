use async_trait::async_trait;

use crate::{Position, StreamKey, SyncItem};

/// One page of the authority's change feed, ascending by position.
#[derive(Debug, Clone)]
pub struct PullBatch {
	pub items: Vec<SyncItem>,
	/// Where the next pull should start; `None` when the stream is empty.
	pub next_position: Option<Position>,
}

impl PullBatch {
	/// `items.len() < limit` signals "caught up" at the authority boundary.
	#[must_use]
	pub fn caught_up(&self, limit: usize) -> bool {
		self.items.len() < limit
	}
}

#[derive(thiserror::Error, Debug)]
pub enum PullError {
	/// Network or authority transiently down; retried via scheduler backoff.
	#[error("authority unreachable: {0}")]
	Unreachable(String),
	#[error("authority rejected pull: {0}")]
	Rejected(String),
}

/// The authority boundary. Implementations do the actual transport; the
/// synchronizer only sees ordered batches.
#[async_trait]
pub trait PullClient: Send + Sync {
	async fn pull(
		&self,
		stream: StreamKey,
		after: Option<&Position>,
		limit: usize,
	) -> Result<PullBatch, PullError>;
}
