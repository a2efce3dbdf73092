use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use async_channel as chan;
use futures::{future::poll_fn, FutureExt};
use tokio::{sync::oneshot, task::JoinSet};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
	Interrupter, JobInput, JobKey, JobName, JobOutcome, LanePhase, LaneReport, Registration,
	RetryPolicy,
};

pub(crate) enum RunnerMessage<N: JobName> {
	Trigger {
		key: JobKey<N>,
		input: Arc<dyn JobInput>,
	},
	Finished {
		key: JobKey<N>,
		outcome: JobOutcome,
	},
	Retire(JobKey<N>),
	Snapshot(oneshot::Sender<Vec<LaneReport<N>>>),
	Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
	Debounce,
	Backoff,
	Interval,
}

struct Timer<N: JobName> {
	key: JobKey<N>,
	kind: TimerKind,
}

enum LaneState {
	Idle,
	Debouncing { timer: delay_queue::Key },
	Running { rerun_requested: bool },
	Backoff { timer: delay_queue::Key },
	Failed,
}

struct Lane {
	state: LaneState,
	last_input: Arc<dyn JobInput>,
	attempts: u32,
	last_error: Option<String>,
	interval_timer: Option<delay_queue::Key>,
}

/// Single-task event loop owning every lane. All state transitions happen
/// here, so per-key mutual exclusion needs no locks: a lane only starts an
/// execution from within this loop, and only one loop exists.
pub(crate) struct Runner<N: JobName> {
	registry: HashMap<N, Registration<N>>,
	retry: RetryPolicy,
	lanes: HashMap<JobKey<N>, Lane>,
	timers: DelayQueue<Timer<N>>,
	msg_rx: chan::Receiver<RunnerMessage<N>>,
	msg_tx: chan::Sender<RunnerMessage<N>>,
	executions: JoinSet<()>,
	interrupter: Interrupter,
}

impl<N: JobName> Runner<N> {
	pub(crate) fn new(
		registry: HashMap<N, Registration<N>>,
		retry: RetryPolicy,
		msg_rx: chan::Receiver<RunnerMessage<N>>,
		msg_tx: chan::Sender<RunnerMessage<N>>,
		interrupter: Interrupter,
	) -> Self {
		Self {
			registry,
			retry,
			lanes: HashMap::new(),
			timers: DelayQueue::new(),
			msg_rx,
			msg_tx,
			executions: JoinSet::new(),
			interrupter,
		}
	}

	pub(crate) async fn run(mut self) {
		loop {
			tokio::select! {
				msg = self.msg_rx.recv() => match msg {
					Ok(RunnerMessage::Trigger { key, input }) => self.on_trigger(key, input),
					Ok(RunnerMessage::Finished { key, outcome }) => self.on_finished(&key, outcome),
					Ok(RunnerMessage::Retire(key)) => self.on_retire(&key),
					Ok(RunnerMessage::Snapshot(tx)) => {
						tx.send(self.snapshot()).ok();
					}
					Ok(RunnerMessage::Shutdown(ack)) => {
						self.drain(ack).await;
						return;
					}
					Err(_) => {
						// Every handle dropped without an explicit shutdown.
						let (tx, _rx) = oneshot::channel();
						self.drain(tx).await;
						return;
					}
				},

				Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)),
					if !self.timers.is_empty() =>
				{
					let Timer { key, kind } = expired.into_inner();
					self.on_timer(&key, kind);
				}
			}
		}
	}

	#[instrument(skip(self, input), fields(%key))]
	fn on_trigger(&mut self, key: JobKey<N>, input: Arc<dyn JobInput>) {
		let Some(registration) = self.registry.get(&key.name) else {
			// `JobSystem::trigger` validates names, so this only happens if a
			// handler re-triggers a name it never registered.
			error!("Trigger for unregistered job");
			return;
		};

		let descriptor = &registration.descriptor;

		let lane = self.lanes.entry(key.clone()).or_insert_with(|| Lane {
			state: LaneState::Idle,
			last_input: Arc::clone(&input),
			attempts: 0,
			last_error: None,
			interval_timer: None,
		});

		lane.last_input = input;

		if lane.interval_timer.is_none() {
			if let Some(every) = descriptor.interval {
				lane.interval_timer = Some(self.timers.insert(
					Timer {
						key: key.clone(),
						kind: TimerKind::Interval,
					},
					every,
				));
			}
		}

		match &mut lane.state {
			LaneState::Idle => {
				lane.state = LaneState::Debouncing {
					timer: self.timers.insert(
						Timer {
							key,
							kind: TimerKind::Debounce,
						},
						descriptor.debounce,
					),
				};
			}
			LaneState::Failed => {
				debug!("External trigger resumes a parked lane");
				lane.attempts = 0;
				lane.last_error = None;
				lane.state = LaneState::Debouncing {
					timer: self.timers.insert(
						Timer {
							key,
							kind: TimerKind::Debounce,
						},
						descriptor.debounce,
					),
				};
			}
			LaneState::Debouncing { .. } => {
				// First-trigger-wins timer; only the input was refreshed.
				trace!("Coalesced into pending debounce window");
			}
			LaneState::Running { rerun_requested } => {
				trace!("Trigger while running, coalesced into a single re-run");
				*rerun_requested = true;
			}
			LaneState::Backoff { .. } => {
				trace!("Trigger during backoff, retry will use the new input");
			}
		}
	}

	#[instrument(skip(self), fields(%key, ?kind))]
	fn on_timer(&mut self, key: &JobKey<N>, kind: TimerKind) {
		let Some(lane) = self.lanes.get_mut(key) else {
			return;
		};

		match kind {
			TimerKind::Debounce => {
				if matches!(lane.state, LaneState::Debouncing { .. }) {
					self.start_execution(key);
				}
			}
			TimerKind::Backoff => {
				if matches!(lane.state, LaneState::Backoff { .. }) {
					self.start_execution(key);
				}
			}
			TimerKind::Interval => {
				let Some(registration) = self.registry.get(&key.name) else {
					return;
				};

				if let Some(every) = registration.descriptor.interval {
					lane.interval_timer = Some(self.timers.insert(
						Timer {
							key: key.clone(),
							kind: TimerKind::Interval,
						},
						every,
					));
				}

				match lane.state {
					LaneState::Idle => {
						trace!("Interval liveness re-fire");
						lane.state = LaneState::Debouncing {
							timer: self.timers.insert(
								Timer {
									key: key.clone(),
									kind: TimerKind::Debounce,
								},
								registration.descriptor.debounce,
							),
						};
					}
					LaneState::Failed => {
						// Exhausted lanes stay parked until an external trigger.
						trace!("Interval skipping parked lane");
					}
					_ => {}
				}
			}
		}
	}

	fn start_execution(&mut self, key: &JobKey<N>) {
		let Some(registration) = self.registry.get(&key.name) else {
			return;
		};
		let Some(lane) = self.lanes.get_mut(key) else {
			return;
		};

		lane.state = LaneState::Running {
			rerun_requested: false,
		};

		let handler = Arc::clone(&registration.handler);
		let input = Arc::clone(&lane.last_input);
		let msg_tx = self.msg_tx.clone();
		let interrupter = self.interrupter.clone();
		let key = key.clone();

		trace!(%key, "Starting execution");

		self.executions.spawn(async move {
			let outcome =
				match AssertUnwindSafe(handler.run(&key, input, &interrupter))
					.catch_unwind()
					.await
				{
					Ok(outcome) => outcome,
					Err(_) => {
						error!(%key, "Job handler panicked");
						JobOutcome::Retry {
							reason: "handler panicked".to_string(),
						}
					}
				};

			if msg_tx
				.send(RunnerMessage::Finished { key, outcome })
				.await
				.is_err()
			{
				warn!("Runner gone before execution could report its outcome");
			}
		});
	}

	#[instrument(skip(self, outcome), fields(%key))]
	fn on_finished(&mut self, key: &JobKey<N>, outcome: JobOutcome) {
		let Some(registration) = self.registry.get(&key.name) else {
			return;
		};
		let Some(lane) = self.lanes.get_mut(key) else {
			return;
		};

		let rerun_requested = matches!(
			lane.state,
			LaneState::Running {
				rerun_requested: true
			}
		);

		match outcome {
			JobOutcome::Completed => {
				lane.attempts = 0;
				lane.last_error = None;

				if rerun_requested {
					trace!("Coalesced re-run after completion");
					lane.state = LaneState::Debouncing {
						timer: self.timers.insert(
							Timer {
								key: key.clone(),
								kind: TimerKind::Debounce,
							},
							registration.descriptor.debounce,
						),
					};
				} else {
					lane.state = LaneState::Idle;
				}
			}

			JobOutcome::Retry { reason } => {
				lane.attempts += 1;
				lane.last_error = Some(reason.clone());

				if lane.attempts > registration.descriptor.max_retries {
					warn!(
						attempts = lane.attempts,
						%reason,
						"Retry budget exhausted, lane parked until an external trigger",
					);
					lane.state = LaneState::Failed;
				} else {
					let delay = self.retry.delay(lane.attempts);
					debug!(attempt = lane.attempts, ?delay, %reason, "Execution failed, retrying");
					lane.state = LaneState::Backoff {
						timer: self.timers.insert(
							Timer {
								key: key.clone(),
								kind: TimerKind::Backoff,
							},
							delay,
						),
					};
				}
			}

			JobOutcome::Canceled { reason } => {
				debug!(%reason, "Job canceled, dropping lane");
				if let Some(timer) = lane.interval_timer.take() {
					self.timers.try_remove(&timer);
				}
				self.lanes.remove(key);
			}
		}
	}

	/// Drops a lane and every timer it holds. A running execution finishes on
	/// its own; its `Finished` message finds no lane and schedules nothing.
	#[instrument(skip(self), fields(%key))]
	fn on_retire(&mut self, key: &JobKey<N>) {
		let Some(lane) = self.lanes.remove(key) else {
			return;
		};

		debug!("Retiring lane");

		if let Some(timer) = lane.interval_timer {
			self.timers.try_remove(&timer);
		}

		match lane.state {
			LaneState::Debouncing { timer } | LaneState::Backoff { timer } => {
				self.timers.try_remove(&timer);
			}
			LaneState::Idle | LaneState::Running { .. } | LaneState::Failed => {}
		}
	}

	fn snapshot(&self) -> Vec<LaneReport<N>> {
		self.lanes
			.iter()
			.map(|(key, lane)| LaneReport {
				key: key.clone(),
				phase: match lane.state {
					LaneState::Idle => LanePhase::Idle,
					LaneState::Debouncing { .. } => LanePhase::Debouncing,
					LaneState::Running { .. } => LanePhase::Running,
					LaneState::Backoff { .. } => LanePhase::Backoff,
					LaneState::Failed => LanePhase::Failed,
				},
				attempts: lane.attempts,
				last_error: lane.last_error.clone(),
			})
			.collect()
	}

	async fn drain(&mut self, ack: oneshot::Sender<()>) {
		debug!(running = self.executions.len(), "Job system shutting down");

		// Interrupter is already flagged by the handle; flag again for the
		// path where every handle was dropped instead.
		self.interrupter.stop();

		while self.executions.join_next().await.is_some() {}

		ack.send(()).ok();
	}
}
