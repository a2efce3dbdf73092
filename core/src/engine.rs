use std::{
	collections::HashMap,
	sync::{Arc, OnceLock},
	time::Duration,
};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use skiff_job_system::{
	JobDescriptor, JobKey, JobSystem, JobSystemBuilder, LaneReport,
};
use skiff_sync::{
	ChangeEvent, Consumer, CursorStore, Invalidation, PullClient, QuarantineStore, Replica,
	StreamKey, StreamKind, Synchronizer,
};
use skiff_transfers::{Direction, TransferEngine, TransferRecord, TransferStore, Transport};
use skiff_update_log::{MergeCompactor, UpdateLogStore};

use crate::{
	jobs::{CompactionJob, EngineJob, StaleSweepJob, SyncJob, SyncWake, Tick, TransferJob,
		TransferWork},
	EngineConfig, Error,
};

/// Everything the engine needs from its host: the authority connection and
/// the storage seams. The same store object usually backs several of these.
pub struct EngineDeps {
	pub client: Arc<dyn PullClient>,
	pub replica: Arc<dyn Replica>,
	pub cursors: Arc<dyn CursorStore>,
	pub quarantine: Arc<dyn QuarantineStore>,
	pub update_log: Arc<dyn UpdateLogStore>,
	pub transfer_store: Arc<dyn TransferStore>,
	pub transport: Arc<dyn Transport>,
	/// This device's identity; merged records are attributed to it.
	pub device: Uuid,
}

/// Shared by every job handler.
pub(crate) struct EngineState {
	config: EngineConfig,
	client: Arc<dyn PullClient>,
	replica: Arc<dyn Replica>,
	cursors: Arc<dyn CursorStore>,
	quarantine: Arc<dyn QuarantineStore>,
	pub(crate) transfers: TransferEngine,
	pub(crate) compactor: MergeCompactor,
	invalidate_tx: broadcast::Sender<Invalidation>,
	/// Set right after the job system starts; lets handlers (the stale
	/// sweep) schedule follow-up work without a cyclic constructor.
	jobs: OnceLock<Arc<JobSystem<EngineJob>>>,
}

impl EngineState {
	pub(crate) fn synchronizer(&self, owner: Uuid, stream: StreamKey) -> Synchronizer {
		Synchronizer::new(
			owner,
			stream,
			Arc::clone(&self.client),
			Arc::clone(&self.replica),
			Arc::clone(&self.cursors),
			Arc::clone(&self.quarantine),
			self.config.batch_limit,
			self.invalidate_tx.clone(),
		)
	}

	/// Completed transfers invalidate the file scope so cached reads pick up
	/// the newly available content.
	pub(crate) fn notify_transfer_complete(&self, file_id: Uuid) {
		self.invalidate_tx
			.send(Invalidation {
				scope: StreamKey::global(StreamKind::Files),
				affected: vec![file_id],
			})
			.ok();
	}

	pub(crate) async fn trigger_transfer(&self, file_id: Uuid, direction: Direction) {
		let Some(jobs) = self.jobs.get() else {
			error!("Transfer trigger before the job system was wired up;");
			return;
		};

		let work = TransferWork { file_id, direction };
		if let Err(e) = jobs.trigger(EngineJob::Transfer, work.scope(), work).await {
			error!(%file_id, %direction, "Failed to schedule transfer: {e};");
		}
	}
}

/// The assembled engine: job system, consumer pool and invalidation signal.
///
/// One instance per device process. All methods take `&self`; share it behind
/// an `Arc` wherever the host needs it.
pub struct Engine {
	state: Arc<EngineState>,
	jobs: Arc<JobSystem<EngineJob>>,
	consumers: RwLock<HashMap<Uuid, Consumer>>,
}

impl Engine {
	/// Builds the job registration table and starts the scheduler. The
	/// maintenance lanes are seeded here; their intervals keep them alive for
	/// the engine's lifetime.
	pub async fn start(config: EngineConfig, deps: EngineDeps) -> Result<Self, Error> {
		let (invalidate_tx, _) = broadcast::channel(64);

		let state = Arc::new(EngineState {
			transfers: TransferEngine::new(
				deps.transfer_store,
				deps.transport,
				config.transfer_max_retries,
				config.transfer_liveness(),
			),
			compactor: MergeCompactor::new(
				deps.update_log,
				deps.device,
				config.compaction_policy(),
			),
			client: deps.client,
			replica: deps.replica,
			cursors: deps.cursors,
			quarantine: deps.quarantine,
			invalidate_tx,
			jobs: OnceLock::new(),
			config: config.clone(),
		});

		let jobs = Arc::new(
			JobSystemBuilder::new()
				.with_retry_policy(config.retry_policy())
				.register(
					JobDescriptor {
						name: EngineJob::Sync,
						debounce: config.sync_debounce(),
						interval: config.sync_interval(),
						max_retries: config.sync_max_retries,
					},
					SyncJob(Arc::clone(&state)),
				)?
				.register(
					JobDescriptor {
						name: EngineJob::Transfer,
						debounce: config.transfer_debounce(),
						// No interval: abandoned transfers are the stale
						// sweep's business.
						interval: None,
						// One more than the record's own budget, so the
						// record reaches its Exhausted decision before the
						// lane parks.
						max_retries: config.transfer_max_retries + 1,
					},
					TransferJob(Arc::clone(&state)),
				)?
				.register(
					JobDescriptor {
						name: EngineJob::Compaction,
						debounce: Duration::from_secs(1),
						interval: Some(config.compaction_interval()),
						max_retries: 3,
					},
					CompactionJob(Arc::clone(&state)),
				)?
				.register(
					JobDescriptor {
						name: EngineJob::StaleSweep,
						debounce: Duration::from_secs(1),
						interval: Some(config.stale_sweep_interval()),
						max_retries: 3,
					},
					StaleSweepJob(Arc::clone(&state)),
				)?
				.start(),
		);

		state.jobs.set(Arc::clone(&jobs)).ok();

		jobs.trigger(EngineJob::Compaction, "maintenance", Tick).await?;
		jobs.trigger(EngineJob::StaleSweep, "maintenance", Tick).await?;

		info!("Engine started;");

		Ok(Self {
			state,
			jobs,
			consumers: RwLock::new(HashMap::new()),
		})
	}

	/// Registers a connected user's streams and schedules an initial catch-up
	/// pull for each.
	#[instrument(skip(self, streams), fields(%user))]
	pub async fn attach_user(
		&self,
		user: Uuid,
		streams: impl IntoIterator<Item = StreamKey> + Send,
	) -> Result<(), Error> {
		let mut consumer = Consumer::new(user);
		let mut initial = Vec::new();

		for stream in streams {
			if consumer.register(stream) {
				initial.push(stream);
			}
		}

		self.consumers.write().await.insert(user, consumer);

		for stream in initial {
			self.trigger_sync(user, stream).await?;
		}

		Ok(())
	}

	/// Drops a user's consumer and retires their sync lanes, interval timers
	/// included. An in-flight pull finishes; nothing further is scheduled for
	/// this user until they attach again.
	#[instrument(skip(self), fields(%user))]
	pub async fn detach_user(&self, user: Uuid) -> Result<bool, Error> {
		let Some(consumer) = self.consumers.write().await.remove(&user) else {
			return Ok(false);
		};

		for stream in consumer.streams() {
			let wake = SyncWake {
				owner: user,
				stream,
			};
			self.jobs
				.retire(JobKey::new(EngineJob::Sync, wake.scope()))
				.await?;
		}

		Ok(true)
	}

	/// Routes a domain event through every consumer and wakes the matching
	/// synchronizers. Best-effort by design: a missed event costs one
	/// interval's worth of latency, never correctness.
	#[instrument(skip(self), fields(stream = %event.stream))]
	pub async fn handle_change(&self, event: &ChangeEvent) -> Result<usize, Error> {
		let woken: Vec<(Uuid, StreamKey)> = self
			.consumers
			.read()
			.await
			.values()
			.filter_map(|consumer| {
				consumer
					.routes(event)
					.map(|stream| (consumer.user(), stream))
			})
			.collect();

		for &(user, stream) in &woken {
			self.trigger_sync(user, stream).await?;
		}

		debug!(woken = woken.len(), "Routed change event;");

		Ok(woken.len())
	}

	pub async fn trigger_sync(&self, owner: Uuid, stream: StreamKey) -> Result<(), Error> {
		let wake = SyncWake { owner, stream };
		self.jobs
			.trigger(EngineJob::Sync, wake.scope(), wake)
			.await?;

		Ok(())
	}

	pub async fn request_download(&self, file_id: Uuid) -> Result<TransferRecord, Error> {
		self.request_transfer(file_id, Direction::Download).await
	}

	pub async fn request_upload(&self, file_id: Uuid) -> Result<TransferRecord, Error> {
		self.request_transfer(file_id, Direction::Upload).await
	}

	#[instrument(skip(self), fields(%file_id, %direction))]
	pub async fn request_transfer(
		&self,
		file_id: Uuid,
		direction: Direction,
	) -> Result<TransferRecord, Error> {
		let record = self.state.transfers.request(file_id, direction).await?;
		self.state.trigger_transfer(file_id, direction).await;

		Ok(record)
	}

	/// Revives a terminally failed transfer and schedules it, without
	/// touching its retry counter.
	pub async fn retry_transfer(&self, file_id: Uuid, direction: Direction) -> Result<bool, Error> {
		let revived = self.state.transfers.manual_retry(file_id, direction).await?;

		if revived {
			self.state.trigger_transfer(file_id, direction).await;
		}

		Ok(revived)
	}

	/// Drops a completed transfer record.
	pub async fn acknowledge_transfer(
		&self,
		file_id: Uuid,
		direction: Direction,
	) -> Result<(), Error> {
		Ok(self.state.transfers.acknowledge(file_id, direction).await?)
	}

	/// New receiver on the invalidation broadcast. Slow receivers lag and
	/// lose old notifications rather than backpressuring the appliers.
	#[must_use]
	pub fn subscribe_invalidations(&self) -> broadcast::Receiver<Invalidation> {
		self.state.invalidate_tx.subscribe()
	}

	/// Point-in-time view of every scheduling lane.
	pub async fn snapshot(&self) -> Result<Vec<LaneReport<EngineJob>>, Error> {
		Ok(self.jobs.snapshot().await?)
	}

	/// Signals every running execution, waits for them to finish and stops
	/// the scheduler. Idempotent.
	pub async fn shutdown(&self) {
		info!("Engine shutting down;");
		self.jobs.shutdown().await;
	}
}
