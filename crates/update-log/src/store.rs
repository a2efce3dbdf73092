use async_trait::async_trait;
use uuid::Uuid;

use crate::{resolve, DocumentState, StoreError, UpdateRecord};

/// Storage seam for the update log. Backed by whatever store the host
/// provides; indexed by (document_id, revision).
#[async_trait]
pub trait UpdateLogStore: Send + Sync {
	/// Idempotent by record id; returns `false` when the record was already
	/// present.
	async fn append(&self, record: &UpdateRecord) -> Result<bool, StoreError>;

	/// All records for a document, ascending by revision.
	async fn list(&self, document_id: Uuid) -> Result<Vec<UpdateRecord>, StoreError>;

	async fn remove(&self, document_id: Uuid, ids: &[Uuid]) -> Result<(), StoreError>;

	async fn documents(&self) -> Result<Vec<Uuid>, StoreError>;

	/// `max(revision) + 1`, or 1 for an untouched document.
	async fn next_revision(&self, document_id: Uuid) -> Result<u64, StoreError>;
}

/// Folds a document's whole log into its current state.
pub async fn resolve_document(
	store: &dyn UpdateLogStore,
	document_id: Uuid,
) -> Result<DocumentState, StoreError> {
	let records = store.list(document_id).await?;
	Ok(resolve(records.iter().map(|record| &record.delta)))
}
