//! In-memory authority used by tests across the workspace, in place of a
//! real sync backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Position, PullBatch, PullClient, PullError, StreamKey, SyncItem};

/// Append-only per-stream logs with monotonically increasing, zero-padded
/// position tokens, served back through [`PullClient`].
#[derive(Default)]
pub struct MemoryAuthority {
	streams: RwLock<HashMap<StreamKey, Vec<SyncItem>>>,
	next_position: RwLock<HashMap<StreamKey, u64>>,
	fail_pulls: RwLock<bool>,
}

impl MemoryAuthority {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a payload to `stream` and returns its assigned position.
	pub async fn publish(&self, stream: StreamKey, id: Uuid, payload: Vec<u8>) -> Position {
		let position = {
			let mut next = self.next_position.write().await;
			let counter = next.entry(stream).or_insert(1);
			let position = Position::from(format!("{:012}", *counter));
			*counter += 1;
			position
		};

		self.streams.write().await.entry(stream).or_default().push(SyncItem {
			id,
			stream,
			position: position.clone(),
			payload,
			produced_at: Utc::now(),
		});

		position
	}

	/// Makes subsequent pulls fail as unreachable until switched back.
	pub async fn set_unreachable(&self, unreachable: bool) {
		*self.fail_pulls.write().await = unreachable;
	}

	pub async fn len(&self, stream: StreamKey) -> usize {
		self.streams
			.read()
			.await
			.get(&stream)
			.map_or(0, Vec::len)
	}
}

#[async_trait]
impl PullClient for MemoryAuthority {
	async fn pull(
		&self,
		stream: StreamKey,
		after: Option<&Position>,
		limit: usize,
	) -> Result<PullBatch, PullError> {
		if *self.fail_pulls.read().await {
			return Err(PullError::Unreachable("authority offline".to_string()));
		}

		let streams = self.streams.read().await;
		let items: Vec<_> = streams
			.get(&stream)
			.into_iter()
			.flatten()
			.filter(|item| after.map_or(true, |position| item.position > *position))
			.take(limit)
			.cloned()
			.collect();

		let next_position = items
			.last()
			.map(|item| item.position.clone())
			.or_else(|| after.cloned());

		Ok(PullBatch {
			items,
			next_position,
		})
	}
}
