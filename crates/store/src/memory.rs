use std::collections::{hash_map::Entry, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use skiff_sync::{
	ApplyError, Cursor, CursorStore, Position, QuarantineStore, QuarantinedItem, Replica,
	StoreError as SyncStoreError, StreamKey, StreamKind, SyncItem,
};
use skiff_transfers::{
	Direction, StoreError as TransferStoreError, TransferRecord, TransferStatus, TransferStore,
};
use skiff_update_log::{StoreError as LogStoreError, UpdateLogStore, UpdateRecord};

#[derive(Default)]
struct Inner {
	cursors: HashMap<(Uuid, StreamKey), Position>,
	quarantine: Vec<QuarantinedItem>,
	update_logs: HashMap<Uuid, Vec<UpdateRecord>>,
	transfers: HashMap<(Uuid, Direction), TransferRecord>,
	/// Items already applied, by item id. This is what makes at-least-once
	/// delivery safe to re-apply.
	applied: HashSet<Uuid>,
	/// Applied items from streams whose payloads we don't decode.
	raw: HashMap<StreamKey, Vec<SyncItem>>,
	/// Item whose apply is held back with a retryable error.
	held: Option<Uuid>,
}

/// Single-process store backing all the engine's persistence seams at once.
///
/// Every mutation happens under one write guard, so an apply that touches the
/// update log and the cursor commits or not as a unit.
#[derive(Default)]
pub struct MemoryStore {
	inner: RwLock<Inner>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes applying the given item fail with a retryable error until
	/// released with `None`. Stands in for an unmet ordering precondition.
	pub async fn hold_item(&self, item: Option<Uuid>) {
		self.inner.write().await.held = item;
	}

	pub async fn has_applied(&self, item: Uuid) -> bool {
		self.inner.read().await.applied.contains(&item)
	}

	pub async fn applied_count(&self) -> usize {
		self.inner.read().await.applied.len()
	}

	pub async fn raw_items(&self, stream: StreamKey) -> Vec<SyncItem> {
		self.inner
			.read()
			.await
			.raw
			.get(&stream)
			.cloned()
			.unwrap_or_default()
	}
}

fn advance_locked(inner: &mut Inner, cursor: &Cursor) {
	match inner.cursors.entry((cursor.owner, cursor.stream)) {
		Entry::Occupied(mut entry) => {
			if *entry.get() < cursor.position {
				entry.insert(cursor.position.clone());
			}
		}
		Entry::Vacant(entry) => {
			entry.insert(cursor.position.clone());
		}
	}
}

fn append_record_locked(inner: &mut Inner, record: &UpdateRecord) -> bool {
	let log = inner.update_logs.entry(record.document_id).or_default();

	if log.iter().any(|existing| existing.id == record.id) {
		return false;
	}

	log.push(record.clone());
	true
}

#[async_trait]
impl CursorStore for MemoryStore {
	async fn get(&self, owner: Uuid, stream: StreamKey) -> Result<Option<Cursor>, SyncStoreError> {
		Ok(self
			.inner
			.read()
			.await
			.cursors
			.get(&(owner, stream))
			.map(|position| Cursor {
				owner,
				stream,
				position: position.clone(),
			}))
	}

	async fn advance(&self, cursor: &Cursor) -> Result<(), SyncStoreError> {
		advance_locked(&mut *self.inner.write().await, cursor);
		Ok(())
	}
}

#[async_trait]
impl QuarantineStore for MemoryStore {
	async fn record(&self, item: QuarantinedItem) -> Result<(), SyncStoreError> {
		let mut inner = self.inner.write().await;

		// Redelivery after a crash between the quarantine write and the
		// cursor advance records the same item again.
		if inner
			.quarantine
			.iter()
			.any(|existing| existing.item_id == item.item_id)
		{
			return Ok(());
		}

		inner.quarantine.push(item);
		Ok(())
	}

	async fn list(&self, stream: StreamKey) -> Result<Vec<QuarantinedItem>, SyncStoreError> {
		Ok(self
			.inner
			.read()
			.await
			.quarantine
			.iter()
			.filter(|item| item.stream == stream)
			.cloned()
			.collect())
	}
}

#[async_trait]
impl Replica for MemoryStore {
	async fn apply(&self, item: &SyncItem, cursor: &Cursor) -> Result<(), ApplyError> {
		// Decode before taking the write guard; a malformed payload must not
		// mutate anything.
		let record = match item.stream.kind {
			StreamKind::Documents => {
				let record = UpdateRecord::decode(&item.payload).map_err(|e| {
					ApplyError::Poison(format!("undecodable update record: {e}"))
				})?;
				record.validate().map_err(ApplyError::Poison)?;

				Some(record)
			}
			StreamKind::Transactions | StreamKind::Files | StreamKind::Users => None,
		};

		let mut inner = self.inner.write().await;

		if inner.held == Some(item.id) {
			return Err(ApplyError::Retryable("item is held".to_string()));
		}

		if !inner.applied.insert(item.id) {
			trace!(item = %item.id, "Already applied;");
			return Ok(());
		}

		match record {
			Some(record) => {
				append_record_locked(&mut inner, &record);
			}
			None => inner.raw.entry(item.stream).or_default().push(item.clone()),
		}

		advance_locked(&mut inner, cursor);

		Ok(())
	}
}

#[async_trait]
impl UpdateLogStore for MemoryStore {
	async fn append(&self, record: &UpdateRecord) -> Result<bool, LogStoreError> {
		Ok(append_record_locked(
			&mut *self.inner.write().await,
			record,
		))
	}

	async fn list(&self, document_id: Uuid) -> Result<Vec<UpdateRecord>, LogStoreError> {
		let mut records = self
			.inner
			.read()
			.await
			.update_logs
			.get(&document_id)
			.cloned()
			.unwrap_or_default();

		records.sort_by_key(|record| record.revision);

		Ok(records)
	}

	async fn remove(&self, document_id: Uuid, ids: &[Uuid]) -> Result<(), LogStoreError> {
		if let Some(log) = self
			.inner
			.write()
			.await
			.update_logs
			.get_mut(&document_id)
		{
			log.retain(|record| !ids.contains(&record.id));
		}

		Ok(())
	}

	async fn documents(&self) -> Result<Vec<Uuid>, LogStoreError> {
		Ok(self.inner.read().await.update_logs.keys().copied().collect())
	}

	async fn next_revision(&self, document_id: Uuid) -> Result<u64, LogStoreError> {
		Ok(self
			.inner
			.read()
			.await
			.update_logs
			.get(&document_id)
			.and_then(|log| log.iter().map(|record| record.revision).max())
			.map_or(1, |max| max + 1))
	}
}

#[async_trait]
impl TransferStore for MemoryStore {
	async fn put(&self, record: &TransferRecord) -> Result<(), TransferStoreError> {
		self.inner
			.write()
			.await
			.transfers
			.insert((record.file_id, record.direction), record.clone());

		Ok(())
	}

	async fn get(
		&self,
		file_id: Uuid,
		direction: Direction,
	) -> Result<Option<TransferRecord>, TransferStoreError> {
		Ok(self
			.inner
			.read()
			.await
			.transfers
			.get(&(file_id, direction))
			.cloned())
	}

	async fn list_status(
		&self,
		status: TransferStatus,
	) -> Result<Vec<TransferRecord>, TransferStoreError> {
		Ok(self
			.inner
			.read()
			.await
			.transfers
			.values()
			.filter(|record| record.status == status)
			.cloned()
			.collect())
	}

	async fn remove(&self, file_id: Uuid, direction: Direction) -> Result<(), TransferStoreError> {
		self.inner.write().await.transfers.remove(&(file_id, direction));
		Ok(())
	}
}
