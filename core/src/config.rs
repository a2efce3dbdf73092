use std::time::Duration;

use serde::{Deserialize, Serialize};

use skiff_job_system::RetryPolicy;
use skiff_update_log::CompactionPolicy;

/// Every policy knob of the engine, with defaults tuned for interactive
/// workloads. Durations are plain integers so the struct deserializes from
/// any flat config format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
	/// Items per pull; a full batch triggers an immediate re-pull.
	pub batch_limit: usize,
	/// Debounce window for synchronizer wake-ups.
	pub sync_debounce_ms: u64,
	/// Liveness re-pull interval for known sync lanes. 0 disables it.
	pub sync_interval_secs: u64,
	/// Automatic retries of a blocked synchronizer before its lane parks.
	pub sync_max_retries: u32,
	/// Debounce window for transfer executions.
	pub transfer_debounce_ms: u64,
	/// Automatic retry budget per transfer record.
	pub transfer_max_retries: u32,
	/// An active transfer silent for longer than this is considered stalled.
	pub transfer_liveness_secs: u64,
	/// How often the stalled-transfer sweep runs.
	pub stale_sweep_interval_secs: u64,
	/// How often the update-log compaction sweep runs.
	pub compaction_interval_secs: u64,
	/// Minimum records worth folding into one.
	pub compaction_min_batch: usize,
	/// Records younger than this are never compacted.
	pub compaction_safety_window_secs: u64,
	/// First backoff delay after a failed execution.
	pub retry_base_ms: u64,
	/// Upper bound on any backoff delay.
	pub retry_cap_secs: u64,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			batch_limit: 256,
			sync_debounce_ms: 150,
			sync_interval_secs: 30,
			sync_max_retries: 10,
			transfer_debounce_ms: 100,
			transfer_max_retries: 3,
			transfer_liveness_secs: 60,
			stale_sweep_interval_secs: 30,
			compaction_interval_secs: 300,
			compaction_min_batch: 4,
			compaction_safety_window_secs: 300,
			retry_base_ms: 500,
			retry_cap_secs: 30,
		}
	}
}

impl EngineConfig {
	#[must_use]
	pub const fn sync_debounce(&self) -> Duration {
		Duration::from_millis(self.sync_debounce_ms)
	}

	#[must_use]
	pub const fn sync_interval(&self) -> Option<Duration> {
		match self.sync_interval_secs {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}

	#[must_use]
	pub const fn transfer_debounce(&self) -> Duration {
		Duration::from_millis(self.transfer_debounce_ms)
	}

	#[must_use]
	pub const fn transfer_liveness(&self) -> Duration {
		Duration::from_secs(self.transfer_liveness_secs)
	}

	#[must_use]
	pub const fn stale_sweep_interval(&self) -> Duration {
		Duration::from_secs(self.stale_sweep_interval_secs)
	}

	#[must_use]
	pub const fn compaction_interval(&self) -> Duration {
		Duration::from_secs(self.compaction_interval_secs)
	}

	#[must_use]
	pub const fn compaction_policy(&self) -> CompactionPolicy {
		CompactionPolicy {
			min_batch: self.compaction_min_batch,
			safety_window: Duration::from_secs(self.compaction_safety_window_secs),
		}
	}

	#[must_use]
	pub const fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			base: Duration::from_millis(self.retry_base_ms),
			cap: Duration::from_secs(self.retry_cap_secs),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_config_files_fill_in_defaults() {
		let config: EngineConfig =
			serde_json::from_str(r#"{ "batch_limit": 16, "sync_interval_secs": 0 }"#).unwrap();

		assert_eq!(config.batch_limit, 16);
		assert_eq!(config.sync_interval(), None);
		assert_eq!(config.sync_debounce(), Duration::from_millis(150));
		assert_eq!(config.transfer_max_retries, 3);
	}
}
