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

//! Append-only per-document CRDT delta log, plus the compactor that folds
//! many small entries into fewer equivalent ones while preserving who wrote
//! what.

mod compactor;
mod delta;
mod record;
mod store;

pub use compactor::{CompactionPolicy, CompactionReport, CompactionSummary, MergeCompactor};
pub use delta::{resolve, Delta, DocumentState, FieldWrite};
pub use record::{Provenance, UpdateRecord};
pub use store::{resolve_document, UpdateLogStore};

pub use uhlc::NTP64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("serialization error: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("deserialization error: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
	#[error("storage error: {0}")]
	Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("storage unavailable: {0}")]
	Unavailable(String),
	#[error("storage corrupted: {0}")]
	Corrupt(String),
}
