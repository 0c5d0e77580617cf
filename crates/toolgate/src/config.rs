// Runtime configuration specs.
//
// Config file parsing lives outside the core; these structs are what the
// loading layer hands in. All fields have serde defaults so a partial
// document deserializes into a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a circuit breaker, per backend or as the system-wide
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BreakerSpec {
	/// Number of consecutive failures before the circuit opens.
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,

	/// How long the circuit stays open before admitting a trial call.
	#[serde(default = "default_open_duration_ms")]
	pub open_duration_ms: u64,
}

fn default_failure_threshold() -> u32 {
	5
}

fn default_open_duration_ms() -> u64 {
	30_000
}

impl Default for BreakerSpec {
	fn default() -> Self {
		Self {
			failure_threshold: default_failure_threshold(),
			open_duration_ms: default_open_duration_ms(),
		}
	}
}

impl BreakerSpec {
	pub fn open_duration(&self) -> Duration {
		Duration::from_millis(self.open_duration_ms)
	}
}

/// Configuration for the tool result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSpec {
	/// Hard maximum number of entries before LRU eviction kicks in.
	#[serde(default = "default_max_entries")]
	pub max_entries: usize,

	/// Time-to-live from stored-at, regardless of access.
	#[serde(default = "default_ttl_ms")]
	pub ttl_ms: u64,

	/// Interval for the eager expiry sweep.
	#[serde(default = "default_sweep_interval_ms")]
	pub sweep_interval_ms: u64,
}

fn default_max_entries() -> usize {
	1024
}

fn default_ttl_ms() -> u64 {
	60_000
}

fn default_sweep_interval_ms() -> u64 {
	30_000
}

impl Default for CacheSpec {
	fn default() -> Self {
		Self {
			max_entries: default_max_entries(),
			ttl_ms: default_ttl_ms(),
			sweep_interval_ms: default_sweep_interval_ms(),
		}
	}
}

impl CacheSpec {
	pub fn ttl(&self) -> Duration {
		Duration::from_millis(self.ttl_ms)
	}

	pub fn sweep_interval(&self) -> Duration {
		Duration::from_millis(self.sweep_interval_ms)
	}
}

/// Configuration for the health-check coordinator loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CoordinatorSpec {
	/// Interval between scheduled probe rounds.
	#[serde(default = "default_probe_interval_ms")]
	pub probe_interval_ms: u64,

	/// Bound on each individual backend probe.
	#[serde(default = "default_probe_timeout_ms")]
	pub probe_timeout_ms: u64,

	/// Consecutive probe failures before a backend is disabled outright.
	/// This is a harder, manual-reset condition than a breaker OPEN.
	#[serde(default = "default_auto_disable_threshold")]
	pub auto_disable_threshold: u32,

	/// Maximum random delay added before each scheduled probe so a fleet of
	/// backends is not probed in lockstep.
	#[serde(default = "default_probe_jitter_ms")]
	pub probe_jitter_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
	60_000
}

fn default_probe_timeout_ms() -> u64 {
	5_000
}

fn default_auto_disable_threshold() -> u32 {
	10
}

fn default_probe_jitter_ms() -> u64 {
	250
}

impl Default for CoordinatorSpec {
	fn default() -> Self {
		Self {
			probe_interval_ms: default_probe_interval_ms(),
			probe_timeout_ms: default_probe_timeout_ms(),
			auto_disable_threshold: default_auto_disable_threshold(),
			probe_jitter_ms: default_probe_jitter_ms(),
		}
	}
}

impl CoordinatorSpec {
	pub fn probe_interval(&self) -> Duration {
		Duration::from_millis(self.probe_interval_ms)
	}

	pub fn probe_timeout(&self) -> Duration {
		Duration::from_millis(self.probe_timeout_ms)
	}
}

/// Top-level configuration handed to [`crate::gateway::Gateway`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
	#[serde(default)]
	pub breaker: BreakerSpec,
	#[serde(default)]
	pub cache: CacheSpec,
	#[serde(default)]
	pub coordinator: CoordinatorSpec,
}
