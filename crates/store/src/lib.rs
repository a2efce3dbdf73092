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

//! In-memory implementation of every storage seam the engine defines.
//!
//! One [`MemoryStore`] behind a single lock plays the role a database plays
//! in production: cursors, the update log, quarantine and transfer records
//! all commit together, which is exactly the transactional boundary the apply
//! contract asks for.

mod memory;

pub use memory::MemoryStore;
