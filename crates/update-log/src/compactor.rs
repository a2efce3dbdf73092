use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::{Delta, Error, Provenance, UpdateLogStore, UpdateRecord};

#[derive(Debug, Clone)]
pub struct CompactionPolicy {
	/// Don't bother folding fewer entries than this.
	pub min_batch: usize,
	/// Only records older than this are eligible; everything younger may
	/// still be in flight towards the authority.
	pub safety_window: Duration,
}

impl Default for CompactionPolicy {
	fn default() -> Self {
		Self {
			min_batch: 4,
			safety_window: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
	pub document_id: Uuid,
	pub merged_id: Uuid,
	pub folded: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionSummary {
	pub documents_scanned: usize,
	pub records_folded: usize,
	pub records_written: usize,
}

/// Rewrites many small update-log entries into fewer larger ones without
/// changing the resolved document state, recording which originals (and
/// authors) were folded in.
pub struct MergeCompactor {
	store: Arc<dyn UpdateLogStore>,
	/// Attribution for merged records; the original authorship lives on in
	/// `merged_from`.
	device: Uuid,
	policy: CompactionPolicy,
}

impl MergeCompactor {
	pub fn new(store: Arc<dyn UpdateLogStore>, device: Uuid, policy: CompactionPolicy) -> Self {
		Self {
			store,
			device,
			policy,
		}
	}

	/// Maintenance sweep across every document.
	#[instrument(skip(self))]
	pub async fn run_once(&self) -> Result<CompactionSummary, Error> {
		let mut summary = CompactionSummary::default();

		for document_id in self.store.documents().await? {
			summary.documents_scanned += 1;

			if let Some(report) = self.compact_document(document_id, None).await? {
				summary.records_folded += report.folded;
				summary.records_written += 1;
			}
		}

		debug!(?summary, "Compaction sweep finished;");

		Ok(summary)
	}

	/// Folds one document's eligible records. `acked_revision` caps
	/// eligibility at what the authority has acknowledged; `None` relies on
	/// the wall-clock safety window alone.
	#[instrument(skip(self), fields(%document_id))]
	pub async fn compact_document(
		&self,
		document_id: Uuid,
		acked_revision: Option<u64>,
	) -> Result<Option<CompactionReport>, Error> {
		let horizon = Utc::now()
			- chrono::Duration::from_std(self.policy.safety_window)
				.unwrap_or_else(|_| chrono::Duration::seconds(300));

		let eligible: Vec<UpdateRecord> = self
			.store
			.list(document_id)
			.await?
			.into_iter()
			.filter(|record| {
				record.created_at < horizon
					&& acked_revision.map_or(true, |acked| record.revision <= acked)
			})
			.collect();

		if eligible.len() < self.policy.min_batch {
			trace!(eligible = eligible.len(), "Not enough eligible records;");
			return Ok(None);
		}

		let mut delta = Delta::default();
		let mut merged_from = Vec::new();
		let mut revision = 0;

		for record in &eligible {
			delta.merge(&record.delta);
			// prior provenance first, then the folded record itself: the list
			// only ever grows under re-compaction
			merged_from.extend(record.merged_from.iter().cloned());
			merged_from.push(Provenance {
				record_id: record.id,
				author: record.created_by,
			});
			revision = revision.max(record.revision);
		}

		let merged = UpdateRecord {
			id: Uuid::new_v4(),
			document_id,
			revision,
			delta,
			created_by: self.device,
			created_at: Utc::now(),
			merged_from,
		};

		// Write-then-delete, never the reverse: a crash between the two
		// leaves both representations present, and merge idempotency makes
		// the duplication harmless.
		self.store.append(&merged).await?;

		let folded_ids: Vec<Uuid> = eligible.iter().map(|record| record.id).collect();
		self.store.remove(document_id, &folded_ids).await?;

		debug!(
			folded = folded_ids.len(),
			merged_id = %merged.id,
			revision,
			"Compacted document;"
		);

		Ok(Some(CompactionReport {
			document_id,
			merged_id: merged.id,
			folded: folded_ids.len(),
		}))
	}
}
