use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The change-stream families the engine synchronizes. Adding a kind means
/// adding a variant here and wiring its replica; there is no ambient
/// registration anywhere else.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
	/// Ordered workspace change feed, scoped by root.
	Transactions,
	/// Document content deltas, scoped by root.
	Documents,
	/// File metadata and availability, scoped by root.
	Files,
	/// Global user directory, unscoped.
	Users,
}

impl StreamKind {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Transactions => "transactions",
			Self::Documents => "documents",
			Self::Files => "files",
			Self::Users => "users",
		}
	}
}

impl fmt::Display for StreamKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Identity of one ordered, append-only change stream. Stable for the
/// lifetime of its scope and never reused across incompatible schemas.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct StreamKey {
	pub kind: StreamKind,
	pub root: Option<Uuid>,
}

impl StreamKey {
	#[must_use]
	pub const fn global(kind: StreamKind) -> Self {
		Self { kind, root: None }
	}

	#[must_use]
	pub const fn scoped(kind: StreamKind, root: Uuid) -> Self {
		Self {
			kind,
			root: Some(root),
		}
	}
}

impl fmt::Display for StreamKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.root {
			Some(root) => write!(f, "{}:{root}", self.kind),
			None => write!(f, "{}", self.kind),
		}
	}
}

/// Opaque, totally-ordered stream position supplied by the authority.
///
/// The client never interprets its internal structure, only compares and
/// persists it; the authority guarantees tokens compare lexicographically in
/// stream order (numeric tokens arrive zero-padded).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
	#[must_use]
	pub fn new(token: impl Into<String>) -> Self {
		Self(token.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Position {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for Position {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

impl From<String> for Position {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// One unit of change in a stream. Items within a batch are strictly ordered
/// by `position`; ordering across streams is neither guaranteed nor required.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncItem {
	pub id: Uuid,
	pub stream: StreamKey,
	pub position: Position,
	/// Opaque to the sync layer; the replica decodes it.
	pub payload: Vec<u8>,
	pub produced_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stream_key_display_matches_wire_shape() {
		let root = Uuid::new_v4();
		assert_eq!(
			StreamKey::scoped(StreamKind::Transactions, root).to_string(),
			format!("transactions:{root}")
		);
		assert_eq!(StreamKey::global(StreamKind::Users).to_string(), "users");
	}

	#[test]
	fn zero_padded_positions_compare_in_stream_order() {
		let a = Position::from("000000000002");
		let b = Position::from("000000000010");
		assert!(a < b);
	}
}
