use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use skiff_job_system::{Interrupter, JobHandler, JobInput, JobKey, JobOutcome};
use skiff_sync::{StreamKey, SyncRun};
use skiff_transfers::{Direction, TransferRun};

use crate::engine::EngineState;

/// The complete set of background work the engine runs. Registered once at
/// startup; there is no way to add a job type at runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EngineJob {
	/// Pull one (owner, stream) pair up to date.
	Sync,
	/// One attempt of one file transfer.
	Transfer,
	/// Update-log compaction sweep.
	Compaction,
	/// Stalled-transfer sweep.
	StaleSweep,
}

impl fmt::Display for EngineJob {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Sync => "sync",
			Self::Transfer => "transfer",
			Self::Compaction => "compaction",
			Self::StaleSweep => "stale_sweep",
		})
	}
}

/// Trigger payload for [`EngineJob::Sync`].
#[derive(Debug, Clone, Copy)]
pub struct SyncWake {
	pub owner: Uuid,
	pub stream: StreamKey,
}

impl SyncWake {
	pub(crate) fn scope(&self) -> String {
		format!("{}:{}", self.owner, self.stream)
	}
}

/// Trigger payload for [`EngineJob::Transfer`].
#[derive(Debug, Clone, Copy)]
pub struct TransferWork {
	pub file_id: Uuid,
	pub direction: Direction,
}

impl TransferWork {
	pub(crate) fn scope(&self) -> String {
		format!("{}:{}", self.file_id, self.direction)
	}
}

/// Input for the maintenance sweeps, which carry no payload.
#[derive(Debug, Clone, Copy)]
pub struct Tick;

pub(crate) struct SyncJob(pub(crate) Arc<EngineState>);

#[async_trait]
impl JobHandler<EngineJob> for SyncJob {
	#[instrument(skip(self, input, interrupter), fields(%key))]
	async fn run(
		&self,
		key: &JobKey<EngineJob>,
		input: Arc<dyn JobInput>,
		interrupter: &Interrupter,
	) -> JobOutcome {
		let Ok(wake) = input.downcast_arc::<SyncWake>() else {
			error!("Sync lane triggered with a foreign input type;");
			return JobOutcome::Canceled {
				reason: "invalid trigger input".to_string(),
			};
		};

		let synchronizer = self.0.synchronizer(wake.owner, wake.stream);

		match synchronizer.run_once(interrupter).await {
			Ok(SyncRun::CaughtUp { .. } | SyncRun::Interrupted { .. }) => JobOutcome::Completed,
			Ok(SyncRun::Blocked { reason, .. }) => JobOutcome::Retry { reason },
			Err(e) => JobOutcome::Retry {
				reason: e.to_string(),
			},
		}
	}
}

pub(crate) struct TransferJob(pub(crate) Arc<EngineState>);

#[async_trait]
impl JobHandler<EngineJob> for TransferJob {
	#[instrument(skip(self, input, _interrupter), fields(%key))]
	async fn run(
		&self,
		key: &JobKey<EngineJob>,
		input: Arc<dyn JobInput>,
		_interrupter: &Interrupter,
	) -> JobOutcome {
		let Ok(work) = input.downcast_arc::<TransferWork>() else {
			error!("Transfer lane triggered with a foreign input type;");
			return JobOutcome::Canceled {
				reason: "invalid trigger input".to_string(),
			};
		};

		match self.0.transfers.run(work.file_id, work.direction).await {
			Ok(TransferRun::Completed) => {
				self.0.notify_transfer_complete(work.file_id);
				JobOutcome::Completed
			}
			Ok(TransferRun::Retry { reason }) => JobOutcome::Retry { reason },
			// The record itself decides when it is done retrying; the lane
			// goes away and a manual retry re-creates it.
			Ok(TransferRun::Exhausted { reason } | TransferRun::Gone { reason }) => {
				JobOutcome::Canceled { reason }
			}
			Err(e) => JobOutcome::Retry {
				reason: e.to_string(),
			},
		}
	}
}

pub(crate) struct CompactionJob(pub(crate) Arc<EngineState>);

#[async_trait]
impl JobHandler<EngineJob> for CompactionJob {
	#[instrument(skip_all)]
	async fn run(
		&self,
		_key: &JobKey<EngineJob>,
		_input: Arc<dyn JobInput>,
		_interrupter: &Interrupter,
	) -> JobOutcome {
		match self.0.compactor.run_once().await {
			Ok(_summary) => JobOutcome::Completed,
			Err(e) => JobOutcome::Retry {
				reason: e.to_string(),
			},
		}
	}
}

pub(crate) struct StaleSweepJob(pub(crate) Arc<EngineState>);

#[async_trait]
impl JobHandler<EngineJob> for StaleSweepJob {
	#[instrument(skip_all)]
	async fn run(
		&self,
		_key: &JobKey<EngineJob>,
		_input: Arc<dyn JobInput>,
		_interrupter: &Interrupter,
	) -> JobOutcome {
		match self.0.transfers.sweep_stalled().await {
			Ok(requeued) => {
				for (file_id, direction) in requeued {
					warn!(%file_id, %direction, "Re-triggering stalled transfer;");
					self.0.trigger_transfer(file_id, direction).await;
				}

				JobOutcome::Completed
			}
			Err(e) => JobOutcome::Retry {
				reason: e.to_string(),
			},
		}
	}
}
