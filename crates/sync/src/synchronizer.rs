use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use skiff_job_system::Interrupter;

use crate::{
	ApplyError, Cursor, CursorStore, Error, Invalidation, PullClient, QuarantineStore,
	QuarantinedItem, Replica, StreamKey,
};

use self::SyncRun::{Blocked, CaughtUp, Interrupted};

/// Outcome of one wake of a synchronizer, translated by the caller into the
/// scheduler's success/retry contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRun {
	/// Stream drained; idle until the next wake.
	CaughtUp { applied: usize },
	/// Stopped at an item whose apply precondition is not met yet; the cursor
	/// stays at the last success and the scheduler retries.
	Blocked { applied: usize, reason: String },
	/// Shutdown requested between items; whatever was applied is durable.
	Interrupted { applied: usize },
}

/// Client-side puller for one (owner, stream) pair.
pub struct Synchronizer {
	owner: Uuid,
	stream: StreamKey,
	client: Arc<dyn PullClient>,
	replica: Arc<dyn Replica>,
	cursors: Arc<dyn CursorStore>,
	quarantine: Arc<dyn QuarantineStore>,
	batch_limit: usize,
	invalidate_tx: broadcast::Sender<Invalidation>,
}

impl Synchronizer {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		owner: Uuid,
		stream: StreamKey,
		client: Arc<dyn PullClient>,
		replica: Arc<dyn Replica>,
		cursors: Arc<dyn CursorStore>,
		quarantine: Arc<dyn QuarantineStore>,
		batch_limit: usize,
		invalidate_tx: broadcast::Sender<Invalidation>,
	) -> Self {
		Self {
			owner,
			stream,
			client,
			replica,
			cursors,
			quarantine,
			batch_limit,
			invalidate_tx,
		}
	}

	#[must_use]
	pub const fn stream(&self) -> StreamKey {
		self.stream
	}

	/// One wake: pull from the cursor, apply in order, advance. A full batch
	/// triggers an immediate re-pull, so catch-up after a long offline period
	/// costs O(backlog / batch_limit) round trips instead of one per wake.
	#[instrument(skip(self, interrupter), fields(owner = %self.owner, stream = %self.stream))]
	pub async fn run_once(&self, interrupter: &Interrupter) -> Result<SyncRun, Error> {
		let mut applied_total = 0;

		loop {
			if interrupter.check_stop() {
				return Ok(Interrupted {
					applied: applied_total,
				});
			}

			let mut after = self
				.cursors
				.get(self.owner, self.stream)
				.await?
				.map(|cursor| cursor.position);

			let batch = self
				.client
				.pull(self.stream, after.as_ref(), self.batch_limit)
				.await?;

			let caught_up = batch.caught_up(self.batch_limit);
			let mut affected = Vec::with_capacity(batch.items.len());

			trace!(items = batch.items.len(), "Pulled batch;");

			for item in &batch.items {
				if interrupter.check_stop() {
					self.emit(affected);
					return Ok(Interrupted {
						applied: applied_total,
					});
				}

				// At-least-once delivery: anything at or behind the cursor was
				// already applied, re-application is a no-op by contract.
				if after.as_ref().is_some_and(|position| item.position <= *position) {
					trace!(item = %item.id, position = %item.position, "Skipping redelivered item;");
					continue;
				}

				let next = Cursor {
					owner: self.owner,
					stream: self.stream,
					position: item.position.clone(),
				};

				match self.replica.apply(item, &next).await {
					Ok(()) => {
						affected.push(item.id);
						applied_total += 1;
						after = Some(item.position.clone());
					}
					Err(ApplyError::Poison(reason)) => {
						warn!(item = %item.id, position = %item.position, %reason, "Quarantining poison item;");

						self.quarantine
							.record(QuarantinedItem {
								item_id: item.id,
								stream: self.stream,
								position: item.position.clone(),
								reason,
								quarantined_at: Utc::now(),
							})
							.await?;

						// Advance past it so the rest of the stream flows.
						self.cursors.advance(&next).await?;
						after = Some(item.position.clone());
					}
					Err(ApplyError::Retryable(reason)) => {
						debug!(item = %item.id, %reason, "Apply blocked, cursor stays at last success;");
						self.emit(affected);
						return Ok(Blocked {
							applied: applied_total,
							reason,
						});
					}
				}
			}

			self.emit(affected);

			if caught_up {
				return Ok(CaughtUp {
					applied: applied_total,
				});
			}

			trace!("Full batch, re-pulling immediately;");
		}
	}

	fn emit(&self, affected: Vec<Uuid>) {
		if !affected.is_empty() {
			self.invalidate_tx
				.send(Invalidation {
					scope: self.stream,
					affected,
				})
				.ok();
		}
	}
}
