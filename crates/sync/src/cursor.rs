use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Position, StoreError, StreamKey};

/// Durable per-(owner, stream) watermark of the last applied position.
///
/// Invariant: a cursor only moves forward, and it is written in the same
/// durable transaction as the item it represents, so a crash mid-batch leaves
/// it at the last fully-applied item, never ahead of applied state.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Cursor {
	pub owner: Uuid,
	pub stream: StreamKey,
	pub position: Position,
}

#[async_trait]
pub trait CursorStore: Send + Sync {
	async fn get(&self, owner: Uuid, stream: StreamKey) -> Result<Option<Cursor>, StoreError>;

	/// Forward-only write: advancing to a position at or behind the persisted
	/// one is a no-op, which is what makes redelivered items harmless.
	async fn advance(&self, cursor: &Cursor) -> Result<(), StoreError>;
}

/// A poison item that was skipped so it could not block its stream forever.
/// Kept for operator visibility; a recorded exception, not a silent drop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuarantinedItem {
	pub item_id: Uuid,
	pub stream: StreamKey,
	pub position: Position,
	pub reason: String,
	pub quarantined_at: DateTime<Utc>,
}

#[async_trait]
pub trait QuarantineStore: Send + Sync {
	/// Records a skipped item. Must be idempotent by `item_id`: the poison
	/// path writes the quarantine entry before the cursor, so a crash between
	/// the two redelivers the item and records it again on the next pull.
	async fn record(&self, item: QuarantinedItem) -> Result<(), StoreError>;

	async fn list(&self, stream: StreamKey) -> Result<Vec<QuarantinedItem>, StoreError>;
}
