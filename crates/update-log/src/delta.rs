use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uhlc::NTP64;
use uuid::Uuid;

/// One field assignment with its logical timestamp and author.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
	pub value: rmpv::Value,
	pub at: NTP64,
	pub by: Uuid,
}

/// Self-describing, commutative, idempotent unit of document change:
/// last-writer-wins per field, with the author id as a deterministic
/// tie-break, plus an optional deletion tombstone.
///
/// `merge` is commutative and idempotent by construction, which is what lets
/// redelivered items, crash-duplicated compaction output, and out-of-order
/// cross-stream arrival all collapse to the same resolved state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
	pub fields: BTreeMap<String, FieldWrite>,
	pub deleted: Option<NTP64>,
}

impl Delta {
	#[must_use]
	pub fn write(field: impl Into<String>, value: rmpv::Value, at: NTP64, by: Uuid) -> Self {
		let mut delta = Self::default();
		delta.set(field, value, at, by);
		delta
	}

	#[must_use]
	pub fn tombstone(at: NTP64) -> Self {
		Self {
			fields: BTreeMap::new(),
			deleted: Some(at),
		}
	}

	pub fn set(&mut self, field: impl Into<String>, value: rmpv::Value, at: NTP64, by: Uuid) {
		self.fields.insert(field.into(), FieldWrite { value, at, by });
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.fields.is_empty() && self.deleted.is_none()
	}

	pub fn merge(&mut self, other: &Self) {
		for (field, incoming) in &other.fields {
			match self.fields.get(field) {
				Some(current)
					if (current.at, current.by) >= (incoming.at, incoming.by) => {}
				_ => {
					self.fields.insert(field.clone(), incoming.clone());
				}
			}
		}

		self.deleted = self.deleted.max(other.deleted);
	}
}

/// Materialized document view after folding deltas. A tombstone wins over
/// every field write, matching the "delete is the be all and end all" rule
/// the rest of the engine assumes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentState {
	pub fields: BTreeMap<String, rmpv::Value>,
	pub deleted: bool,
}

impl From<&Delta> for DocumentState {
	fn from(delta: &Delta) -> Self {
		if delta.deleted.is_some() {
			return Self {
				fields: BTreeMap::new(),
				deleted: true,
			};
		}

		Self {
			fields: delta
				.fields
				.iter()
				.map(|(field, write)| (field.clone(), write.value.clone()))
				.collect(),
			deleted: false,
		}
	}
}

/// Folds any iteration order of deltas into the same state.
pub fn resolve<'a>(deltas: impl IntoIterator<Item = &'a Delta>) -> DocumentState {
	let mut folded = Delta::default();
	for delta in deltas {
		folded.merge(delta);
	}
	DocumentState::from(&folded)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn value(s: &str) -> rmpv::Value {
		rmpv::Value::from(s)
	}

	#[test]
	fn newer_write_wins_per_field() {
		let author = Uuid::new_v4();
		let mut a = Delta::write("title", value("draft"), NTP64(1), author);
		let b = Delta::write("title", value("final"), NTP64(2), author);

		a.merge(&b);

		assert_eq!(a.fields["title"].value, value("final"));
	}

	#[test]
	fn merge_is_commutative_and_idempotent() {
		let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
		let a = Delta::write("title", value("a"), NTP64(5), x);
		let mut b = Delta::write("body", value("b"), NTP64(3), y);
		b.set("title", value("b"), NTP64(5), y);

		let mut ab = a.clone();
		ab.merge(&b);
		let mut ba = b.clone();
		ba.merge(&a);
		assert_eq!(ab, ba);

		let mut abb = ab.clone();
		abb.merge(&b);
		assert_eq!(ab, abb);
	}

	#[test]
	fn equal_timestamps_tie_break_on_author() {
		let (low, high) = {
			let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
			if a < b {
				(a, b)
			} else {
				(b, a)
			}
		};

		let mut a = Delta::write("title", value("low"), NTP64(7), low);
		a.merge(&Delta::write("title", value("high"), NTP64(7), high));

		assert_eq!(a.fields["title"].value, value("high"));
	}

	#[test]
	fn tombstone_shadows_field_writes() {
		let author = Uuid::new_v4();
		let mut delta = Delta::write("title", value("x"), NTP64(9), author);
		delta.merge(&Delta::tombstone(NTP64(4)));

		let state = DocumentState::from(&delta);
		assert!(state.deleted);
		assert!(state.fields.is_empty());
	}

	#[test]
	fn resolve_order_independent() {
		let author = Uuid::new_v4();
		let deltas = vec![
			Delta::write("a", value("1"), NTP64(1), author),
			Delta::write("b", value("2"), NTP64(2), author),
			Delta::write("a", value("3"), NTP64(3), author),
		];

		let forward = resolve(deltas.iter());
		let reversed = resolve(deltas.iter().rev());

		assert_eq!(forward, reversed);
		assert_eq!(forward.fields["a"], value("3"));
	}
}
