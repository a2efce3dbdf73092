use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
	Direction, Error, FaultCode, StoreError, TransferFault, TransferRecord, TransferStatus,
	TransferStore,
};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("connection lost: {0}")]
	ConnectionLost(String),
	#[error("source no longer exists")]
	SourceMissing,
	#[error("io failure: {0}")]
	Io(String),
}

impl TransportError {
	fn fault(&self) -> TransferFault {
		let code = match self {
			Self::ConnectionLost(_) => FaultCode::ConnectionLost,
			Self::SourceMissing => FaultCode::SourceMissing,
			Self::Io(_) => FaultCode::Io,
		};

		TransferFault {
			code,
			message: self.to_string(),
		}
	}

	/// Permanent failures skip the retry budget entirely; no number of
	/// attempts will make a deleted source reappear.
	const fn is_permanent(&self) -> bool {
		matches!(self, Self::SourceMissing)
	}
}

/// Moves the actual bytes. Implementations resume from
/// `record.progress_pct` where the underlying protocol allows it and report
/// progress through the handle as they go.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn run(
		&self,
		record: &TransferRecord,
		progress: &ProgressHandle,
	) -> Result<(), TransportError>;
}

/// Handed to the transport so it can report progress without seeing the rest
/// of the engine.
pub struct ProgressHandle {
	store: Arc<dyn TransferStore>,
	file_id: Uuid,
	direction: Direction,
}

impl ProgressHandle {
	pub async fn report(&self, pct: u8) -> Result<(), StoreError> {
		record_progress(&*self.store, self.file_id, self.direction, pct).await
	}
}

/// What one execution attempt amounted to, in terms the job scheduler maps
/// onto its own outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRun {
	Completed,
	/// Re-queued; the caller should schedule another attempt with backoff.
	Retry { reason: String },
	/// Retry budget spent. The record stays `Failed` until a manual retry.
	Exhausted { reason: String },
	/// Nothing (left) to do: no record, or a permanently failed source.
	Gone { reason: String },
}

/// Drives transfer records through their lifecycle. All transitions are
/// persisted before the method returns, so a crash at any point resumes from
/// a consistent state.
pub struct TransferEngine {
	store: Arc<dyn TransferStore>,
	transport: Arc<dyn Transport>,
	max_retries: u32,
	/// An `Active` record whose `updated_at` is older than this is treated as
	/// abandoned by a dead execution.
	liveness_timeout: Duration,
}

impl TransferEngine {
	#[must_use]
	pub fn new(
		store: Arc<dyn TransferStore>,
		transport: Arc<dyn Transport>,
		max_retries: u32,
		liveness_timeout: Duration,
	) -> Self {
		Self {
			store,
			transport,
			max_retries,
			liveness_timeout,
		}
	}

	/// Registers intent to transfer a file. Idempotent: an existing record is
	/// returned untouched, including a `Failed` one, which only a
	/// [`Self::manual_retry`] revives.
	#[instrument(skip(self), fields(%file_id, %direction))]
	pub async fn request(
		&self,
		file_id: Uuid,
		direction: Direction,
	) -> Result<TransferRecord, Error> {
		if let Some(existing) = self.store.get(file_id, direction).await? {
			return Ok(existing);
		}

		let record = TransferRecord::new(file_id, direction);
		self.store.put(&record).await?;

		Ok(record)
	}

	/// One execution attempt. Meant to be called from a scheduled job, which
	/// guarantees no two attempts for the same (file, direction) overlap.
	#[instrument(skip(self), fields(%file_id, %direction))]
	pub async fn run(&self, file_id: Uuid, direction: Direction) -> Result<TransferRun, Error> {
		let Some(mut record) = self.store.get(file_id, direction).await? else {
			return Ok(TransferRun::Gone {
				reason: "no transfer record".to_string(),
			});
		};

		match record.status {
			TransferStatus::Completed => return Ok(TransferRun::Completed),
			TransferStatus::Failed => {
				let reason = record
					.fault
					.as_ref()
					.map_or_else(|| "failed".to_string(), |fault| fault.message.clone());

				return Ok(TransferRun::Gone { reason });
			}
			TransferStatus::Active => {
				// Only reachable after a crash mid-attempt; the sweep would
				// requeue it eventually, but since we're here anyway, resume.
				warn!("Resuming a transfer left active by a dead execution;");
			}
			TransferStatus::Pending => {}
		}

		record.status = TransferStatus::Active;
		record.updated_at = Utc::now();
		self.store.put(&record).await?;

		let progress = ProgressHandle {
			store: Arc::clone(&self.store),
			file_id,
			direction,
		};

		match self.transport.run(&record, &progress).await {
			Ok(()) => {
				self.complete(file_id, direction).await?;
				Ok(TransferRun::Completed)
			}
			Err(transport_error) => {
				self.fail(file_id, direction, transport_error.fault(), !transport_error.is_permanent())
					.await?;

				let reason = transport_error.to_string();

				if transport_error.is_permanent() {
					Ok(TransferRun::Gone { reason })
				} else if record.retries < self.max_retries {
					Ok(TransferRun::Retry { reason })
				} else {
					Ok(TransferRun::Exhausted { reason })
				}
			}
		}
	}

	/// Monotone progress update for an active transfer; a report below the
	/// persisted value is logged and dropped.
	pub async fn report_progress(
		&self,
		file_id: Uuid,
		direction: Direction,
		pct: u8,
	) -> Result<(), Error> {
		record_progress(&*self.store, file_id, direction, pct).await?;
		Ok(())
	}

	#[instrument(skip(self), fields(%file_id, %direction))]
	pub async fn complete(&self, file_id: Uuid, direction: Direction) -> Result<(), Error> {
		let Some(mut record) = self.store.get(file_id, direction).await? else {
			return Ok(());
		};

		record.status = TransferStatus::Completed;
		record.progress_pct = 100;
		record.fault = None;
		record.updated_at = Utc::now();
		self.store.put(&record).await?;

		Ok(())
	}

	/// Records a failed attempt. With `retryable` set and budget remaining the
	/// record goes back to `Pending` and the retry counter increments;
	/// otherwise it parks in `Failed`.
	#[instrument(skip(self), fields(%file_id, %direction))]
	pub async fn fail(
		&self,
		file_id: Uuid,
		direction: Direction,
		fault: TransferFault,
		retryable: bool,
	) -> Result<(), Error> {
		let Some(mut record) = self.store.get(file_id, direction).await? else {
			return Ok(());
		};

		if retryable && record.retries < self.max_retries {
			record.retries += 1;
			record.status = TransferStatus::Pending;
		} else {
			record.status = TransferStatus::Failed;
			warn!(code = %fault.code, retries = record.retries, "Transfer failed terminally;");
		}

		record.fault = Some(fault);
		record.updated_at = Utc::now();
		self.store.put(&record).await?;

		Ok(())
	}

	/// Revives a `Failed` record without spending retry budget. Returns
	/// whether there was anything to revive.
	#[instrument(skip(self), fields(%file_id, %direction))]
	pub async fn manual_retry(&self, file_id: Uuid, direction: Direction) -> Result<bool, Error> {
		let Some(mut record) = self.store.get(file_id, direction).await? else {
			return Ok(false);
		};

		if record.status != TransferStatus::Failed {
			return Ok(false);
		}

		record.status = TransferStatus::Pending;
		record.fault = None;
		record.updated_at = Utc::now();
		self.store.put(&record).await?;

		Ok(true)
	}

	/// Drops a completed record once the caller has taken note of it.
	pub async fn acknowledge(&self, file_id: Uuid, direction: Direction) -> Result<(), Error> {
		if let Some(record) = self.store.get(file_id, direction).await? {
			if record.status == TransferStatus::Completed {
				self.store.remove(file_id, direction).await?;
			}
		}

		Ok(())
	}

	/// Finds `Active` records nobody has touched within the liveness timeout
	/// and puts them through the normal failure path. Returns the keys that
	/// were requeued, so the caller can schedule fresh attempts.
	#[instrument(skip(self))]
	pub async fn sweep_stalled(&self) -> Result<Vec<(Uuid, Direction)>, Error> {
		let horizon = Utc::now()
			- chrono::Duration::from_std(self.liveness_timeout)
				.unwrap_or_else(|_| chrono::Duration::seconds(60));

		let mut requeued = Vec::new();

		for record in self.store.list_status(TransferStatus::Active).await? {
			if record.updated_at >= horizon {
				continue;
			}

			warn!(
				file_id = %record.file_id,
				direction = %record.direction,
				stale_for = ?(Utc::now() - record.updated_at).to_std().unwrap_or_default(),
				"Sweeping stalled transfer;"
			);

			let fault = TransferFault {
				code: FaultCode::Stalled,
				message: "no progress within the liveness window".to_string(),
			};

			self.fail(record.file_id, record.direction, fault, true)
				.await?;

			if let Some(after) = self.store.get(record.file_id, record.direction).await? {
				if after.status == TransferStatus::Pending {
					requeued.push((record.file_id, record.direction));
				}
			}
		}

		Ok(requeued)
	}
}

async fn record_progress(
	store: &dyn TransferStore,
	file_id: Uuid,
	direction: Direction,
	pct: u8,
) -> Result<(), StoreError> {
	let Some(mut record) = store.get(file_id, direction).await? else {
		return Ok(());
	};

	if record.status != TransferStatus::Active {
		return Ok(());
	}

	let pct = pct.min(100);

	if pct < record.progress_pct {
		// Most likely a resumed transport re-reporting from an older offset.
		warn!(
			%file_id,
			%direction,
			current = record.progress_pct,
			reported = pct,
			"Ignoring progress regression;"
		);
		return Ok(());
	}

	record.progress_pct = pct;
	record.updated_at = Utc::now();
	store.put(&record).await
}
