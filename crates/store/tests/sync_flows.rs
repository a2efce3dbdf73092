//! End-to-end pull/apply flows: a synchronizer pulling from an in-memory
//! authority into the in-memory store.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use skiff_job_system::Interrupter;
use skiff_store::MemoryStore;
use skiff_sync::{
	testing::MemoryAuthority, Cursor, CursorStore, Position, QuarantineStore, QuarantinedItem,
	Replica, StreamKey, StreamKind, SyncItem, SyncRun, Synchronizer,
};
use skiff_update_log::{resolve_document, Delta, NTP64, UpdateLogStore, UpdateRecord};

fn synchronizer(
	owner: Uuid,
	stream: StreamKey,
	authority: &Arc<MemoryAuthority>,
	store: &Arc<MemoryStore>,
	batch_limit: usize,
) -> (Synchronizer, broadcast::Receiver<skiff_sync::Invalidation>) {
	let (invalidate_tx, invalidate_rx) = broadcast::channel(16);

	(
		Synchronizer::new(
			owner,
			stream,
			Arc::clone(authority) as Arc<dyn skiff_sync::PullClient>,
			Arc::clone(store) as Arc<dyn Replica>,
			Arc::clone(store) as Arc<dyn CursorStore>,
			Arc::clone(store) as Arc<dyn QuarantineStore>,
			batch_limit,
			invalidate_tx,
		),
		invalidate_rx,
	)
}

async fn cursor_position(store: &MemoryStore, owner: Uuid, stream: StreamKey) -> Option<Position> {
	CursorStore::get(store, owner, stream)
		.await
		.unwrap()
		.map(|cursor| cursor.position)
}

fn document_payload(document_id: Uuid, revision: u64, field: &str, value: &str) -> Vec<u8> {
	UpdateRecord::new(
		document_id,
		revision,
		Delta::write(field, rmpv::Value::from(value), NTP64(revision), Uuid::new_v4()),
		Uuid::new_v4(),
	)
	.encode()
	.unwrap()
}

#[tokio::test]
async fn cursor_tracks_the_last_applied_position() {
	let owner = Uuid::new_v4();
	let stream = StreamKey::scoped(StreamKind::Transactions, Uuid::new_v4());
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());

	for _ in 0..5 {
		authority.publish(stream, Uuid::new_v4(), vec![1]).await;
	}

	// batch_limit below the backlog exercises the immediate re-pull
	let (sync, _rx) = synchronizer(owner, stream, &authority, &store, 2);
	let interrupter = Interrupter::default();

	assert_eq!(
		sync.run_once(&interrupter).await.unwrap(),
		SyncRun::CaughtUp { applied: 5 }
	);
	assert_eq!(
		cursor_position(&store, owner, stream).await,
		Some(Position::from("000000000005"))
	);

	// Nothing new: cursor stays put, nothing re-applied.
	assert_eq!(
		sync.run_once(&interrupter).await.unwrap(),
		SyncRun::CaughtUp { applied: 0 }
	);
	assert_eq!(store.applied_count().await, 5);
}

#[tokio::test]
async fn a_blocked_stream_resumes_from_the_cursor() {
	let owner = Uuid::new_v4();
	let stream = StreamKey::scoped(StreamKind::Transactions, Uuid::new_v4());
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());

	let mut ids = Vec::new();
	for _ in 0..6 {
		let id = Uuid::new_v4();
		authority.publish(stream, id, vec![1]).await;
		ids.push(id);
	}

	// The fourth item's precondition is not met yet.
	store.hold_item(Some(ids[3])).await;

	let (sync, _rx) = synchronizer(owner, stream, &authority, &store, 10);
	let interrupter = Interrupter::default();

	let run = sync.run_once(&interrupter).await.unwrap();
	assert!(matches!(run, SyncRun::Blocked { applied: 3, .. }));
	assert_eq!(
		cursor_position(&store, owner, stream).await,
		Some(Position::from("000000000003"))
	);

	// Retry after the precondition clears: picks up at item four, applies the
	// rest exactly once.
	store.hold_item(None).await;

	assert_eq!(
		sync.run_once(&interrupter).await.unwrap(),
		SyncRun::CaughtUp { applied: 3 }
	);
	assert_eq!(store.applied_count().await, 6);
	assert_eq!(store.raw_items(stream).await.len(), 6);
	assert_eq!(
		cursor_position(&store, owner, stream).await,
		Some(Position::from("000000000006"))
	);
}

#[tokio::test]
async fn reapplying_a_delivered_item_changes_nothing() {
	let owner = Uuid::new_v4();
	let stream = StreamKey::scoped(StreamKind::Documents, Uuid::new_v4());
	let store = Arc::new(MemoryStore::new());
	let document_id = Uuid::new_v4();

	let item = SyncItem {
		id: Uuid::new_v4(),
		stream,
		position: Position::from("000000000001"),
		payload: document_payload(document_id, 1, "title", "hello"),
		produced_at: chrono::Utc::now(),
	};
	let cursor = Cursor {
		owner,
		stream,
		position: item.position.clone(),
	};

	store.apply(&item, &cursor).await.unwrap();
	store.apply(&item, &cursor).await.unwrap();

	assert_eq!(store.applied_count().await, 1);
	assert_eq!(
		UpdateLogStore::list(&*store, document_id).await.unwrap().len(),
		1
	);
}

#[tokio::test]
async fn poison_items_are_quarantined_and_do_not_block_the_stream() {
	let owner = Uuid::new_v4();
	let root = Uuid::new_v4();
	let stream = StreamKey::scoped(StreamKind::Documents, root);
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());
	let document_id = Uuid::new_v4();

	authority
		.publish(
			stream,
			Uuid::new_v4(),
			document_payload(document_id, 1, "title", "hello"),
		)
		.await;
	let poison_id = Uuid::new_v4();
	authority
		.publish(stream, poison_id, b"not msgpack at all".to_vec())
		.await;
	authority
		.publish(
			stream,
			Uuid::new_v4(),
			document_payload(document_id, 2, "body", "world"),
		)
		.await;

	let (sync, _rx) = synchronizer(owner, stream, &authority, &store, 10);

	assert_eq!(
		sync.run_once(&Interrupter::default()).await.unwrap(),
		SyncRun::CaughtUp { applied: 2 }
	);

	let quarantined = QuarantineStore::list(&*store, stream).await.unwrap();
	assert_eq!(quarantined.len(), 1);
	assert_eq!(quarantined[0].item_id, poison_id);
	assert_eq!(quarantined[0].position, Position::from("000000000002"));

	// The cursor moved past the poison item and the later write landed.
	assert_eq!(
		cursor_position(&store, owner, stream).await,
		Some(Position::from("000000000003"))
	);

	let state = resolve_document(&*store, document_id).await.unwrap();
	assert_eq!(state.fields.get("title"), Some(&rmpv::Value::from("hello")));
	assert_eq!(state.fields.get("body"), Some(&rmpv::Value::from("world")));
}

#[tokio::test]
async fn a_redelivered_poison_item_is_quarantined_once() {
	let owner = Uuid::new_v4();
	let stream = StreamKey::scoped(StreamKind::Documents, Uuid::new_v4());
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());

	let poison_id = Uuid::new_v4();
	authority
		.publish(stream, poison_id, b"not msgpack at all".to_vec())
		.await;

	// A crash between the quarantine write and the cursor advance leaves the
	// entry behind while the next pull redelivers the same item.
	QuarantineStore::record(
		&*store,
		QuarantinedItem {
			item_id: poison_id,
			stream,
			position: Position::from("000000000001"),
			reason: "payload is not a valid update record".to_string(),
			quarantined_at: chrono::Utc::now(),
		},
	)
	.await
	.unwrap();

	let (sync, _rx) = synchronizer(owner, stream, &authority, &store, 10);

	assert_eq!(
		sync.run_once(&Interrupter::default()).await.unwrap(),
		SyncRun::CaughtUp { applied: 0 }
	);

	assert_eq!(QuarantineStore::list(&*store, stream).await.unwrap().len(), 1);
	assert_eq!(
		cursor_position(&store, owner, stream).await,
		Some(Position::from("000000000001"))
	);
}

#[tokio::test]
async fn applied_batches_emit_an_invalidation_for_their_stream() {
	let owner = Uuid::new_v4();
	let stream = StreamKey::global(StreamKind::Users);
	let authority = Arc::new(MemoryAuthority::new());
	let store = Arc::new(MemoryStore::new());

	let first = Uuid::new_v4();
	let second = Uuid::new_v4();
	authority.publish(stream, first, vec![1]).await;
	authority.publish(stream, second, vec![2]).await;

	let (sync, mut invalidations) = synchronizer(owner, stream, &authority, &store, 10);

	sync.run_once(&Interrupter::default()).await.unwrap();

	let invalidation = invalidations.recv().await.unwrap();
	assert_eq!(invalidation.scope, stream);
	assert_eq!(invalidation.affected, vec![first, second]);
}
