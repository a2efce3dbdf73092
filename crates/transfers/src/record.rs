use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

use crate::StoreError;

#[derive(
	Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
	Upload,
	Download,
}

/// Lifecycle of a transfer record. `Failed` is terminal until someone asks
/// for a manual retry; every other state is passed through by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferStatus {
	Pending,
	Active,
	Completed,
	Failed,
}

/// Stable failure classification, kept alongside the human-readable message
/// so callers can branch without string matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultCode {
	ConnectionLost,
	SourceMissing,
	Io,
	Stalled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFault {
	pub code: FaultCode,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRecord {
	pub file_id: Uuid,
	pub direction: Direction,
	pub status: TransferStatus,
	/// Monotone while the transfer is `Active`; survives interruption so a
	/// resumed transfer reports from where it left off.
	pub progress_pct: u8,
	/// Automatic retries consumed so far. Manual retries don't count.
	pub retries: u32,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub fault: Option<TransferFault>,
}

impl TransferRecord {
	#[must_use]
	pub fn new(file_id: Uuid, direction: Direction) -> Self {
		let now = Utc::now();

		Self {
			file_id,
			direction,
			status: TransferStatus::Pending,
			progress_pct: 0,
			retries: 0,
			created_at: now,
			updated_at: now,
			fault: None,
		}
	}
}

/// Persistence seam for transfer records, keyed by (file_id, direction); an
/// upload and a download of the same file are independent transfers.
#[async_trait]
pub trait TransferStore: Send + Sync {
	async fn put(&self, record: &TransferRecord) -> Result<(), StoreError>;

	async fn get(
		&self,
		file_id: Uuid,
		direction: Direction,
	) -> Result<Option<TransferRecord>, StoreError>;

	async fn list_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>, StoreError>;

	async fn remove(&self, file_id: Uuid, direction: Direction) -> Result<(), StoreError>;
}
