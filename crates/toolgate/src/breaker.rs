// Per-backend circuit breakers.
//
// State machine:
//
// ```text
// CLOSED --[failures >= threshold]--> OPEN      (opened_at = now)
// OPEN --[open_duration elapsed, call requested]--> HALF_OPEN (one trial)
// HALF_OPEN --[trial succeeds]--> CLOSED        (failure count reset)
// HALF_OPEN --[trial fails]--> OPEN             (opened_at reset to now)
// ```
//
// All counter mutation and the transition decision for one backend happen
// under that backend's own mutex; different backends never contend. Every
// state transition publishes exactly one `breaker_state_changed` event;
// repeated calls that do not change state never publish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::BreakerSpec;
use crate::events::{DomainEvent, Severity, SharedHub, EVENT_BREAKER_STATE_CHANGED};

/// The state of one circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
	/// Requests flow normally.
	#[default]
	Closed,
	/// Requests are rejected without touching the backend.
	Open,
	/// One trial request is allowed through.
	HalfOpen,
}

impl fmt::Display for BreakerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			BreakerState::Closed => "closed",
			BreakerState::Open => "open",
			BreakerState::HalfOpen => "half_open",
		};
		f.write_str(s)
	}
}

/// Mutable state for one backend's circuit.
struct Circuit {
	state: BreakerState,
	/// Consecutive failures since the circuit was last CLOSED.
	failure_count: u32,
	opened_at: Option<Instant>,
	/// Set while the single HALF_OPEN trial call is outstanding.
	trial_in_flight: bool,
	/// Per-backend override; falls back to the system-wide default.
	spec: Option<BreakerSpec>,
}

impl Circuit {
	fn new() -> Self {
		Self {
			state: BreakerState::Closed,
			failure_count: 0,
			opened_at: None,
			trial_in_flight: false,
			spec: None,
		}
	}

	fn transition(&mut self, to: BreakerState) -> BreakerState {
		let from = self.state;
		self.state = to;
		match to {
			BreakerState::Closed => {
				self.failure_count = 0;
				self.opened_at = None;
				self.trial_in_flight = false;
			},
			BreakerState::Open => {
				self.opened_at = Some(Instant::now());
				self.trial_in_flight = false;
			},
			BreakerState::HalfOpen => {
				self.trial_in_flight = false;
			},
		}
		from
	}
}

/// Snapshot of one circuit for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
	pub backend: String,
	pub state: BreakerState,
	pub failure_count: u32,
	/// Milliseconds the circuit has been open, if it is.
	pub open_for_ms: Option<u64>,
}

/// Registry of per-backend circuits sharing a system-wide default spec.
pub struct CircuitBreakers {
	default_spec: RwLock<BreakerSpec>,
	circuits: RwLock<HashMap<String, Arc<Mutex<Circuit>>>>,
	hub: SharedHub,
}

impl CircuitBreakers {
	pub fn new(default_spec: BreakerSpec, hub: SharedHub) -> Self {
		Self {
			default_spec: RwLock::new(default_spec),
			circuits: RwLock::new(HashMap::new()),
			hub,
		}
	}

	fn circuit(&self, backend: &str) -> Arc<Mutex<Circuit>> {
		if let Some(circuit) = self.circuits.read().get(backend) {
			return Arc::clone(circuit);
		}
		let mut circuits = self.circuits.write();
		Arc::clone(
			circuits
				.entry(backend.to_string())
				.or_insert_with(|| Arc::new(Mutex::new(Circuit::new()))),
		)
	}

	fn spec_for(&self, circuit: &Circuit) -> BreakerSpec {
		circuit.spec.unwrap_or(*self.default_spec.read())
	}

	/// Whether a call to `backend` may proceed right now.
	///
	/// `Ok(())` admits the call. `Err(retry_after)` means short-circuit the
	/// caller without attempting the backend; the hint says how long until
	/// a trial will be admitted, when known.
	pub fn try_acquire(&self, backend: &str) -> Result<(), Option<Duration>> {
		let cell = self.circuit(backend);
		let (result, emitted) = {
			let mut circuit = cell.lock();
			let spec = self.spec_for(&circuit);
			match circuit.state {
				BreakerState::Closed => (Ok(()), None),
				BreakerState::Open => {
					let elapsed = circuit.opened_at.map(|at| at.elapsed());
					let expired = elapsed.is_none_or(|e| e >= spec.open_duration());
					if expired {
						let from = circuit.transition(BreakerState::HalfOpen);
						circuit.trial_in_flight = true;
						let event = self.transition_event(backend, from, &circuit);
						(Ok(()), Some(event))
					} else {
						let retry_after = elapsed.map(|e| spec.open_duration().saturating_sub(e));
						(Err(retry_after), None)
					}
				},
				BreakerState::HalfOpen => {
					if circuit.trial_in_flight {
						// Exactly one trial at a time.
						(Err(None), None)
					} else {
						circuit.trial_in_flight = true;
						(Ok(()), None)
					}
				},
			}
		};
		if let Some(event) = emitted {
			self.hub.publish(event);
		}
		result
	}

	/// Convenience form of [`Self::try_acquire`].
	pub fn allow_call(&self, backend: &str) -> bool {
		self.try_acquire(backend).is_ok()
	}

	/// Give back an admitted call slot without recording an outcome. Only
	/// meaningful when the admitted call was the HALF_OPEN trial and the
	/// caller resolved the request some other way (e.g. a cache hit).
	pub fn cancel_acquire(&self, backend: &str) {
		let cell = self.circuit(backend);
		let mut circuit = cell.lock();
		if circuit.state == BreakerState::HalfOpen {
			circuit.trial_in_flight = false;
		}
	}

	/// Record a successful call outcome for `backend`.
	pub fn record_success(&self, backend: &str) {
		let cell = self.circuit(backend);
		let emitted = {
			let mut circuit = cell.lock();
			match circuit.state {
				BreakerState::Closed => {
					// A success always fully resets the streak.
					circuit.failure_count = 0;
					None
				},
				BreakerState::HalfOpen => {
					let from = circuit.transition(BreakerState::Closed);
					Some(self.transition_event(backend, from, &circuit))
				},
				BreakerState::Open => {
					// Late result from a call admitted before the trip; the
					// circuit stays open until its duration elapses.
					debug!(target: "breaker", backend, "success recorded while open, ignoring");
					None
				},
			}
		};
		if let Some(event) = emitted {
			self.hub.publish(event);
		}
	}

	/// Record a failed call outcome for `backend`.
	pub fn record_failure(&self, backend: &str) {
		let cell = self.circuit(backend);
		let emitted = {
			let mut circuit = cell.lock();
			match circuit.state {
				BreakerState::Closed => {
					circuit.failure_count += 1;
					let spec = self.spec_for(&circuit);
					if circuit.failure_count >= spec.failure_threshold {
						let from = circuit.transition(BreakerState::Open);
						Some(self.transition_event(backend, from, &circuit))
					} else {
						None
					}
				},
				BreakerState::HalfOpen => {
					circuit.failure_count += 1;
					let from = circuit.transition(BreakerState::Open);
					Some(self.transition_event(backend, from, &circuit))
				},
				BreakerState::Open => None,
			}
		};
		if let Some(event) = emitted {
			self.hub.publish(event);
		}
	}

	/// Set or clear the per-backend spec override.
	pub fn set_backend_spec(&self, backend: &str, spec: Option<BreakerSpec>) {
		let cell = self.circuit(backend);
		cell.lock().spec = spec;
	}

	/// Replace the system-wide default spec. Applies to every circuit
	/// without an explicit override, including future decisions of existing
	/// circuits.
	pub fn set_default_spec(&self, spec: BreakerSpec) {
		*self.default_spec.write() = spec;
	}

	/// Drop state for a deregistered backend.
	pub fn forget(&self, backend: &str) {
		self.circuits.write().remove(backend);
	}

	/// Admin listing of all known circuits.
	pub fn states(&self) -> Vec<BreakerStatus> {
		let circuits = self.circuits.read();
		circuits
			.iter()
			.map(|(backend, cell)| {
				let circuit = cell.lock();
				BreakerStatus {
					backend: backend.clone(),
					state: circuit.state,
					failure_count: circuit.failure_count,
					open_for_ms: circuit
						.opened_at
						.filter(|_| circuit.state == BreakerState::Open)
						.map(|at| at.elapsed().as_millis() as u64),
				}
			})
			.sorted_by(|a, b| a.backend.cmp(&b.backend))
			.collect()
	}

	fn transition_event(&self, backend: &str, from: BreakerState, circuit: &Circuit) -> DomainEvent {
		let severity = match circuit.state {
			BreakerState::Open => Severity::High,
			BreakerState::HalfOpen => Severity::Warning,
			BreakerState::Closed => Severity::Info,
		};
		DomainEvent::new(EVENT_BREAKER_STATE_CHANGED, severity)
			.backend(backend)
			.with("from", from)
			.with("to", circuit.state)
			.with("failure_count", circuit.failure_count)
	}
}
