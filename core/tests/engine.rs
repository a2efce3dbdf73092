//! Whole-engine flows: wake events in, applied state and invalidations out.

use std::{
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use uuid::Uuid;

use skiff_core::{Engine, EngineConfig, EngineDeps, EngineJob};
use skiff_store::MemoryStore;
use skiff_sync::{testing::MemoryAuthority, ChangeEvent, CursorStore, StreamKey, StreamKind};
use skiff_transfers::{
	Direction, ProgressHandle, TransferRecord, TransferStatus, TransferStore, Transport,
	TransportError,
};

struct ScriptedTransport {
	/// Attempts that fail before one succeeds.
	failures: u32,
	attempts: AtomicU32,
	error: fn() -> TransportError,
}

#[async_trait]
impl Transport for ScriptedTransport {
	async fn run(
		&self,
		_record: &TransferRecord,
		progress: &ProgressHandle,
	) -> Result<(), TransportError> {
		if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
			return Err((self.error)());
		}

		progress.report(50).await.ok();
		progress.report(100).await.ok();
		Ok(())
	}
}

fn deps(
	authority: &Arc<MemoryAuthority>,
	store: &Arc<MemoryStore>,
	transport: Arc<dyn Transport>,
) -> EngineDeps {
	EngineDeps {
		client: Arc::clone(authority) as _,
		replica: Arc::clone(store) as _,
		cursors: Arc::clone(store) as _,
		quarantine: Arc::clone(store) as _,
		update_log: Arc::clone(store) as _,
		transfer_store: Arc::clone(store) as _,
		transport,
		device: Uuid::new_v4(),
	}
}

fn flawless_transport() -> Arc<dyn Transport> {
	Arc::new(ScriptedTransport {
		failures: 0,
		attempts: AtomicU32::new(0),
		error: || TransportError::Io(String::new()),
	})
}

async fn wait_for_status(
	store: &MemoryStore,
	file_id: Uuid,
	direction: Direction,
	status: TransferStatus,
) -> TransferRecord {
	for _ in 0..500 {
		if let Some(record) = TransferStore::get(store, file_id, direction).await.unwrap() {
			if record.status == status {
				return record;
			}
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	panic!("transfer never reached {status}");
}

#[tokio::test(start_paused = true)]
async fn a_change_event_flows_through_to_an_invalidation() {
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let user = Uuid::new_v4();
	let stream = StreamKey::scoped(StreamKind::Transactions, Uuid::new_v4());

	let engine = Engine::start(
		EngineConfig::default(),
		deps(&authority, &store, flawless_transport()),
	)
	.await
	.unwrap();

	let mut invalidations = engine.subscribe_invalidations();

	engine.attach_user(user, [stream]).await.unwrap();

	let mut published = Vec::new();
	for _ in 0..3 {
		let id = Uuid::new_v4();
		authority.publish(stream, id, vec![0]).await;
		published.push(id);
	}

	assert_eq!(
		engine
			.handle_change(&ChangeEvent {
				stream,
				hint: None
			})
			.await
			.unwrap(),
		1
	);

	let invalidation = invalidations.recv().await.unwrap();
	assert_eq!(invalidation.scope, stream);
	assert_eq!(invalidation.affected, published);

	let cursor = CursorStore::get(&*store, user, stream).await.unwrap();
	assert_eq!(cursor.unwrap().position.as_str(), "000000000003");

	engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn events_for_unregistered_streams_wake_nobody() {
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let user = Uuid::new_v4();
	let registered = StreamKey::global(StreamKind::Users);
	let other = StreamKey::scoped(StreamKind::Files, Uuid::new_v4());

	let engine = Engine::start(
		EngineConfig::default(),
		deps(&authority, &store, flawless_transport()),
	)
	.await
	.unwrap();

	engine.attach_user(user, [registered]).await.unwrap();

	assert_eq!(
		engine
			.handle_change(&ChangeEvent {
				stream: other,
				hint: None
			})
			.await
			.unwrap(),
		0
	);

	assert!(engine.detach_user(user).await.unwrap());
	assert_eq!(
		engine
			.handle_change(&ChangeEvent {
				stream: registered,
				hint: None
			})
			.await
			.unwrap(),
		0
	);

	engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_detached_user_stops_syncing_on_the_interval() {
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let user = Uuid::new_v4();
	let stream = StreamKey::global(StreamKind::Users);

	let engine = Engine::start(
		EngineConfig::default(),
		deps(&authority, &store, flawless_transport()),
	)
	.await
	.unwrap();

	engine.attach_user(user, [stream]).await.unwrap();

	// Let the initial catch-up pull run against the still-empty stream.
	tokio::time::sleep(Duration::from_secs(1)).await;

	assert!(engine.detach_user(user).await.unwrap());

	authority.publish(stream, Uuid::new_v4(), vec![0]).await;
	authority.publish(stream, Uuid::new_v4(), vec![1]).await;

	// Well past several sync intervals; a surviving lane would have pulled.
	tokio::time::sleep(Duration::from_secs(120)).await;

	assert!(CursorStore::get(&*store, user, stream)
		.await
		.unwrap()
		.is_none());
	assert!(engine
		.snapshot()
		.await
		.unwrap()
		.iter()
		.all(|lane| lane.key.name != EngineJob::Sync));

	engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_requested_download_runs_to_completion() {
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let file_id = Uuid::new_v4();

	let engine = Engine::start(
		EngineConfig::default(),
		deps(&authority, &store, flawless_transport()),
	)
	.await
	.unwrap();

	let mut invalidations = engine.subscribe_invalidations();

	let record = engine.request_download(file_id).await.unwrap();
	assert_eq!(record.status, TransferStatus::Pending);

	let done = wait_for_status(&store, file_id, Direction::Download, TransferStatus::Completed)
		.await;
	assert_eq!(done.progress_pct, 100);
	assert_eq!(done.retries, 0);

	// Completion invalidates the file scope.
	let invalidation = invalidations.recv().await.unwrap();
	assert_eq!(invalidation.scope, StreamKey::global(StreamKind::Files));
	assert_eq!(invalidation.affected, vec![file_id]);

	// Acknowledged completions leave no record behind.
	engine
		.acknowledge_transfer(file_id, Direction::Download)
		.await
		.unwrap();
	assert!(TransferStore::get(&*store, file_id, Direction::Download)
		.await
		.unwrap()
		.is_none());

	engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_dead_source_parks_the_transfer_until_manual_retry() {
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let file_id = Uuid::new_v4();

	let transport = Arc::new(ScriptedTransport {
		failures: 1,
		attempts: AtomicU32::new(0),
		error: || TransportError::SourceMissing,
	});

	let engine = Engine::start(
		EngineConfig::default(),
		deps(&authority, &store, transport),
	)
	.await
	.unwrap();

	engine.request_upload(file_id).await.unwrap();

	let failed =
		wait_for_status(&store, file_id, Direction::Upload, TransferStatus::Failed).await;
	assert_eq!(failed.retries, 0);

	assert!(engine
		.retry_transfer(file_id, Direction::Upload)
		.await
		.unwrap());

	let done =
		wait_for_status(&store, file_id, Direction::Upload, TransferStatus::Completed).await;
	assert_eq!(done.retries, 0);

	engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connection_loss_is_retried_automatically() {
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let file_id = Uuid::new_v4();

	let transport = Arc::new(ScriptedTransport {
		failures: 2,
		attempts: AtomicU32::new(0),
		error: || TransportError::ConnectionLost("reset by peer".to_string()),
	});

	let engine = Engine::start(
		EngineConfig::default(),
		deps(&authority, &store, transport),
	)
	.await
	.unwrap();

	engine.request_download(file_id).await.unwrap();

	let done = wait_for_status(&store, file_id, Direction::Download, TransferStatus::Completed)
		.await;
	assert_eq!(done.retries, 2);

	engine.shutdown().await;
}
