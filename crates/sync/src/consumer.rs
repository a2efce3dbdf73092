use std::collections::HashSet;

use uuid::Uuid;

use crate::StreamKey;

/// Best-effort wake notification. Receipt only shortens latency; its absence
/// is always covered by the scheduler's interval fallback.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
	pub stream: StreamKey,
	pub hint: Option<String>,
}

/// Authority-side router for one connected user.
///
/// Holds only the set of streams the user currently cares about and decides,
/// per incoming domain event, which synchronizers should be told to pull. No
/// application state and no I/O, so fan-out stays O(registered streams) and
/// fully decoupled from batch size and retry policy.
#[derive(Debug)]
pub struct Consumer {
	user: Uuid,
	registered: HashSet<StreamKey>,
}

impl Consumer {
	#[must_use]
	pub fn new(user: Uuid) -> Self {
		Self {
			user,
			registered: HashSet::new(),
		}
	}

	#[must_use]
	pub const fn user(&self) -> Uuid {
		self.user
	}

	/// Returns `false` if the stream was already registered.
	pub fn register(&mut self, stream: StreamKey) -> bool {
		self.registered.insert(stream)
	}

	pub fn deregister(&mut self, stream: StreamKey) -> bool {
		self.registered.remove(&stream)
	}

	pub fn streams(&self) -> impl Iterator<Item = StreamKey> + '_ {
		self.registered.iter().copied()
	}

	/// Pure routing decision: the stream to wake for this user, if any.
	#[must_use]
	pub fn routes(&self, event: &ChangeEvent) -> Option<StreamKey> {
		self.registered.contains(&event.stream).then_some(event.stream)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::StreamKind;

	#[test]
	fn routes_only_registered_streams() {
		let root = Uuid::new_v4();
		let other_root = Uuid::new_v4();
		let mut consumer = Consumer::new(Uuid::new_v4());

		let transactions = StreamKey::scoped(StreamKind::Transactions, root);
		assert!(consumer.register(transactions));
		assert!(!consumer.register(transactions));
		assert!(consumer.register(StreamKey::global(StreamKind::Users)));

		assert_eq!(
			consumer.routes(&ChangeEvent {
				stream: transactions,
				hint: None
			}),
			Some(transactions)
		);
		assert_eq!(
			consumer.routes(&ChangeEvent {
				stream: StreamKey::scoped(StreamKind::Transactions, other_root),
				hint: None
			}),
			None
		);

		consumer.deregister(transactions);
		assert_eq!(
			consumer.routes(&ChangeEvent {
				stream: transactions,
				hint: None
			}),
			None
		);
	}
}
