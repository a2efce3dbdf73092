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

//! Resumable file-transfer state machine.
//!
//! The [`TransferEngine`] owns every state transition of a transfer record;
//! the actual byte movement happens behind the [`Transport`] seam. Executions
//! are driven by the job scheduler, which supplies retry backoff and per-file
//! mutual exclusion, so this crate only decides what the next state is.

mod engine;
mod record;

pub use engine::{ProgressHandle, Transport, TransportError, TransferEngine, TransferRun};
pub use record::{
	Direction, FaultCode, TransferFault, TransferRecord, TransferStatus, TransferStore,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
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
