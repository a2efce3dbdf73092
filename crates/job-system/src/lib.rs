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
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Generic trigger/execute scheduling for background work.
//!
//! Every piece of background work in the engine (synchronizer wake-ups, file
//! transfers, maintenance sweeps) runs through the same scheduler. Work is
//! identified by a [`JobKey`] (a job name plus a concurrency key); for each key
//! the scheduler guarantees at most one running execution, coalesces trigger
//! bursts through a debounce window, retries failed executions with a bounded
//! exponential backoff, and re-fires on a fixed interval as a liveness net so
//! that lost wake events never strand a lane.
//!
//! Handlers are registered once at startup through [`JobSystemBuilder`]; the
//! resulting dispatch table is immutable for the lifetime of the system.

use std::{
	collections::{HashMap, HashSet},
	fmt,
	hash::Hash,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use downcast_rs::{impl_downcast, DowncastSync};
use rand::Rng;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, warn};

mod runner;

use runner::{Runner, RunnerMessage};

/// Discriminant for a job type. Engines define an enum of their job types and
/// get this for free, the same way actor identifiers work.
pub trait JobName:
	Copy + Eq + Hash + Send + Sync + fmt::Debug + fmt::Display + 'static
{
}

impl<T: Copy + Eq + Hash + Send + Sync + fmt::Debug + fmt::Display + 'static> JobName for T {}

/// The identity under which at-most-one-in-flight execution is enforced.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConcurrencyKey(Arc<str>);

impl ConcurrencyKey {
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConcurrencyKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ConcurrencyKey {
	fn from(s: &str) -> Self {
		Self(Arc::from(s))
	}
}

impl From<String> for ConcurrencyKey {
	fn from(s: String) -> Self {
		Self(Arc::from(s.as_str()))
	}
}

/// Full identity of a scheduling lane.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct JobKey<N: JobName> {
	pub name: N,
	pub scope: ConcurrencyKey,
}

impl<N: JobName> JobKey<N> {
	pub fn new(name: N, scope: impl Into<ConcurrencyKey>) -> Self {
		Self {
			name,
			scope: scope.into(),
		}
	}
}

impl<N: JobName> fmt::Display for JobKey<N> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.name, self.scope)
	}
}

/// Erased trigger input. Triggers carry whatever payload their handler
/// expects; the scheduler only stores it and hands the most recent one to the
/// next execution, so coalesced bursts run with the latest input.
pub trait JobInput: DowncastSync + fmt::Debug {}
impl_downcast!(sync JobInput);

impl<T: std::any::Any + Send + Sync + fmt::Debug> JobInput for T {}

/// What a handler reports back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
	/// Execution succeeded; the retry counter resets.
	Completed,
	/// Transient failure; the lane re-runs after backoff until the retry
	/// budget is exhausted, then parks until an external trigger.
	Retry { reason: String },
	/// The target of the job no longer exists; the lane is dropped with no
	/// further automatic runs.
	Canceled { reason: String },
}

/// Static per-job-type policy, created once at startup.
#[derive(Debug, Clone)]
pub struct JobDescriptor<N: JobName> {
	pub name: N,
	/// Delay after the first trigger before running, absorbing bursts.
	pub debounce: Duration,
	/// Liveness fallback: known lanes re-fire this often even with zero
	/// external triggers. `None` disables the fallback.
	pub interval: Option<Duration>,
	/// Automatic retries before the lane parks as failed.
	pub max_retries: u32,
}

/// Bounded exponential backoff with jitter.
///
/// Attempt `n` waits `min(base * 2^(n-1), cap)` scaled by a uniform factor in
/// `[0.75, 1.25]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub base: Duration,
	pub cap: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_millis(500),
			cap: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	#[must_use]
	pub fn delay(&self, attempt: u32) -> Duration {
		let shift = attempt.max(1).min(16) - 1;
		let exp = self.base.saturating_mul(1 << shift);
		exp.min(self.cap).mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
	}
}

/// Cooperative cancellation checkpoint handed to every execution. Handlers
/// check it between discrete steps; a single storage transaction is never
/// interrupted mid-write.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
	stopped: Arc<AtomicBool>,
}

impl Interrupter {
	#[must_use]
	pub fn check_stop(&self) -> bool {
		self.stopped.load(Ordering::Relaxed)
	}

	pub(crate) fn stop(&self) {
		self.stopped.store(true, Ordering::Relaxed);
	}
}

#[async_trait::async_trait]
pub trait JobHandler<N: JobName>: Send + Sync + 'static {
	async fn run(
		&self,
		key: &JobKey<N>,
		input: Arc<dyn JobInput>,
		interrupter: &Interrupter,
	) -> JobOutcome;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("job name registered twice: {0}")]
	DuplicateJob(String),
	#[error("no handler registered for job: {0}")]
	UnknownJob(String),
	#[error("job system already shut down")]
	Shutdown,
}

pub(crate) struct Registration<N: JobName> {
	pub(crate) descriptor: JobDescriptor<N>,
	pub(crate) handler: Arc<dyn JobHandler<N>>,
}

/// Assembles the dispatch table. All job types must be registered before
/// [`start`](Self::start); there is no way to add one afterwards.
pub struct JobSystemBuilder<N: JobName> {
	registry: HashMap<N, Registration<N>>,
	retry: RetryPolicy,
}

impl<N: JobName> Default for JobSystemBuilder<N> {
	fn default() -> Self {
		Self::new()
	}
}

impl<N: JobName> JobSystemBuilder<N> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			registry: HashMap::new(),
			retry: RetryPolicy::default(),
		}
	}

	#[must_use]
	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn register(
		mut self,
		descriptor: JobDescriptor<N>,
		handler: impl JobHandler<N>,
	) -> Result<Self, Error> {
		let name = descriptor.name;
		if self
			.registry
			.insert(
				name,
				Registration {
					descriptor,
					handler: Arc::new(handler),
				},
			)
			.is_some()
		{
			return Err(Error::DuplicateJob(name.to_string()));
		}

		Ok(self)
	}

	#[must_use]
	pub fn start(self) -> JobSystem<N> {
		let (msg_tx, msg_rx) = chan::unbounded();
		let interrupter = Interrupter::default();

		let names = self.registry.keys().copied().collect();

		let runner = Runner::new(
			self.registry,
			self.retry,
			msg_rx,
			msg_tx.clone(),
			interrupter.clone(),
		);

		let handle = tokio::spawn(runner.run());

		JobSystem {
			names,
			msg_tx,
			interrupter,
			handle: Mutex::new(Some(handle)),
		}
	}
}

/// Handle to a running job system. Cheap to share behind an `Arc`.
pub struct JobSystem<N: JobName> {
	names: HashSet<N>,
	msg_tx: chan::Sender<RunnerMessage<N>>,
	interrupter: Interrupter,
	handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<N: JobName> JobSystem<N> {
	/// Requests a run of `name` under `scope`. Bursts within the debounce
	/// window coalesce into one execution carrying the latest input.
	pub async fn trigger(
		&self,
		name: N,
		scope: impl Into<ConcurrencyKey> + Send,
		input: impl JobInput,
	) -> Result<(), Error> {
		self.trigger_erased(JobKey::new(name, scope), Arc::new(input))
			.await
	}

	pub async fn trigger_erased(
		&self,
		key: JobKey<N>,
		input: Arc<dyn JobInput>,
	) -> Result<(), Error> {
		if !self.names.contains(&key.name) {
			return Err(Error::UnknownJob(key.name.to_string()));
		}

		self.msg_tx
			.send(RunnerMessage::Trigger { key, input })
			.await
			.map_err(|_| Error::Shutdown)
	}

	/// Drops a lane along with its debounce, backoff and interval timers, so
	/// it stops re-firing entirely. An in-flight execution finishes but
	/// schedules nothing further; a later trigger starts the lane fresh.
	pub async fn retire(&self, key: JobKey<N>) -> Result<(), Error> {
		if !self.names.contains(&key.name) {
			return Err(Error::UnknownJob(key.name.to_string()));
		}

		self.msg_tx
			.send(RunnerMessage::Retire(key))
			.await
			.map_err(|_| Error::Shutdown)
	}

	/// Point-in-time view of every lane, for operator surfaces.
	pub async fn snapshot(&self) -> Result<Vec<LaneReport<N>>, Error> {
		let (tx, rx) = oneshot::channel();
		self.msg_tx
			.send(RunnerMessage::Snapshot(tx))
			.await
			.map_err(|_| Error::Shutdown)?;

		rx.await.map_err(|_| Error::Shutdown)
	}

	/// Stops accepting triggers, signals running executions through their
	/// [`Interrupter`] and waits for them to finish.
	pub async fn shutdown(&self) {
		self.interrupter.stop();

		let (tx, rx) = oneshot::channel();
		if self.msg_tx.send(RunnerMessage::Shutdown(tx)).await.is_ok() {
			if rx.await.is_err() {
				warn!("Job system runner dropped shutdown ack");
			}
		}

		if let Some(handle) = self.handle.lock().await.take() {
			if handle.await.is_err() {
				error!("Job system runner task panicked");
			}
		}
	}
}

/// Where a lane currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePhase {
	Idle,
	Debouncing,
	Running,
	Backoff,
	Failed,
}

#[derive(Debug, Clone)]
pub struct LaneReport<N: JobName> {
	pub key: JobKey<N>,
	pub phase: LanePhase,
	pub attempts: u32,
	pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_is_bounded_and_grows() {
		let policy = RetryPolicy {
			base: Duration::from_millis(100),
			cap: Duration::from_secs(5),
		};

		for attempt in 1..=20 {
			let d = policy.delay(attempt);
			assert!(d <= Duration::from_secs(5).mul_f64(1.25));
			assert!(d >= Duration::from_millis(75));
		}

		// the un-jittered curve doubles until the cap
		assert!(policy.delay(4) >= Duration::from_millis(800).mul_f64(0.75));
	}
}
