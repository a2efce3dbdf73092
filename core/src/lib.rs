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

//! Engine assembly: wires the scheduler, synchronizers, transfer engine and
//! compactor together behind one [`Engine`] handle.
//!
//! The sub-crates are policy-free mechanisms; this crate is where policy
//! lives: which job types exist, their debounce and interval settings, how
//! outcomes map between layers, and which storage seams back what.

mod config;
mod engine;
mod jobs;

pub use config::EngineConfig;
pub use engine::{Engine, EngineDeps};
pub use jobs::{EngineJob, SyncWake, Tick, TransferWork};

pub use skiff_job_system as job_system;
pub use skiff_sync as sync;
pub use skiff_transfers as transfers;
pub use skiff_update_log as update_log;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("job scheduling error: {0}")]
	Jobs(#[from] skiff_job_system::Error),
	#[error(transparent)]
	Sync(#[from] skiff_sync::Error),
	#[error(transparent)]
	Transfers(#[from] skiff_transfers::Error),
	#[error(transparent)]
	UpdateLog(#[from] skiff_update_log::Error),
}
