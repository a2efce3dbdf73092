#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::dbg_macro,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Cursor-based incremental synchronization against a central authority.
//!
//! One [`Synchronizer`] exists per (owner, stream); it pulls ordered batches
//! starting at its persisted cursor, applies each item to the local replica
//! inside the same durable transaction that advances the cursor, and reports
//! back to the job scheduler that woke it. The authority-side [`Consumer`] is
//! the matching router: it knows which streams a connected user cares about
//! and turns domain events into wake-ups, holding no data of its own.

use uuid::Uuid;

mod consumer;
mod cursor;
mod pull;
mod replica;
mod stream;
mod synchronizer;
pub mod testing;

pub use consumer::{ChangeEvent, Consumer};
pub use cursor::{Cursor, CursorStore, QuarantineStore, QuarantinedItem};
pub use pull::{PullBatch, PullClient, PullError};
pub use replica::{ApplyError, Replica};
pub use stream::{Position, StreamKey, StreamKind, SyncItem};
pub use synchronizer::{SyncRun, Synchronizer};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("storage error: {0}")]
	Store(#[from] StoreError),
	#[error("pull error: {0}")]
	Pull(#[from] PullError),
}

/// Storage-seam failures. The storage engine itself is out of scope; anything
/// implementing the store traits reports through this.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("storage unavailable: {0}")]
	Unavailable(String),
	#[error("storage corrupted: {0}")]
	Corrupt(String),
}

/// Raised towards the (out-of-scope) query/view layer after any successful
/// apply, so cached reads covering `scope` can refresh.
#[derive(Debug, Clone)]
pub struct Invalidation {
	pub scope: StreamKey,
	pub affected: Vec<Uuid>,
}
