use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Delta, Error};

/// Attribution of one folded-in original record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
	pub record_id: Uuid,
	pub author: Uuid,
}

/// One entry in a document's append-only update log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRecord {
	pub id: Uuid,
	pub document_id: Uuid,
	/// Per-document monotonic.
	pub revision: u64,
	pub delta: Delta,
	pub created_by: Uuid,
	pub created_at: DateTime<Utc>,
	/// Which original records (and authors) the compactor folded into this
	/// one. Never empty once compaction touches a record, and append-only:
	/// re-compacting concatenates provenance, it never drops entries.
	#[serde(default)]
	pub merged_from: Vec<Provenance>,
}

impl UpdateRecord {
	#[must_use]
	pub fn new(document_id: Uuid, revision: u64, delta: Delta, created_by: Uuid) -> Self {
		Self {
			id: Uuid::new_v4(),
			document_id,
			revision,
			delta,
			created_by,
			created_at: Utc::now(),
			merged_from: Vec::new(),
		}
	}

	/// Wire/store encoding; this is what travels as a sync item payload.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		Ok(rmp_serde::to_vec(self)?)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		Ok(rmp_serde::from_slice(bytes)?)
	}

	/// Schema validation applied before a decoded record is let anywhere near
	/// the log. A record that carries no change at all is malformed, not
	/// merely empty.
	pub fn validate(&self) -> Result<(), String> {
		if self.delta.is_empty() {
			return Err("update record carries an empty delta".to_string());
		}
		if self.revision == 0 {
			return Err("update record revision must start at 1".to_string());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use uhlc::NTP64;

	#[test]
	fn round_trips_through_msgpack() {
		let record = UpdateRecord::new(
			Uuid::new_v4(),
			3,
			Delta::write("title", rmpv::Value::from("hello"), NTP64(42), Uuid::new_v4()),
			Uuid::new_v4(),
		);

		let decoded = UpdateRecord::decode(&record.encode().unwrap()).unwrap();
		assert_eq!(decoded.id, record.id);
		assert_eq!(decoded.revision, 3);
		assert_eq!(decoded.delta, record.delta);
		assert!(decoded.merged_from.is_empty());
	}

	#[test]
	fn empty_delta_fails_validation() {
		let record = UpdateRecord::new(Uuid::new_v4(), 1, Delta::default(), Uuid::new_v4());
		assert!(record.validate().is_err());
	}
}
