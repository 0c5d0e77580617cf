// Health-check coordinator.
//
// One perpetual loop per process: every tick it probes each enabled backend
// with its own spawned task and bounded timeout, so a hung backend only
// affects its own probe, never the tick for the others. Probe outcomes
// drive the breaker, the backend's health/catalog, and the auto-disable
// threshold. Probe failures never propagate to callers; they only change
// state and emit events.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakers;
use crate::cache::ToolResultCache;
use crate::config::CoordinatorSpec;
use crate::errors::GatewayError;
use crate::events::{
	DomainEvent, Severity, SharedHub, EVENT_BACKEND_AUTO_DISABLED, EVENT_BACKEND_STATUS_CHANGED,
};
use crate::registry::{BackendRegistry, HealthStatus};

/// Result of one probe, returned from force-probes for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
	pub backend: String,
	pub healthy: bool,
	pub tools: usize,
	pub consecutive_failures: u32,
	pub auto_disabled: bool,
}

enum Command {
	ForceProbe {
		backend: String,
		reply: oneshot::Sender<Result<ProbeReport, GatewayError>>,
	},
}

/// Handle for requesting out-of-band probes from the running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
	commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
	/// Probe one backend immediately, without waiting for the next
	/// scheduled tick, and wait for its outcome.
	pub async fn force_probe(&self, backend: &str) -> Result<ProbeReport, GatewayError> {
		let (reply, response) = oneshot::channel();
		self
			.commands
			.send(Command::ForceProbe {
				backend: backend.to_string(),
				reply,
			})
			.await
			.map_err(|_| GatewayError::Internal("coordinator is not running".to_string()))?;
		response
			.await
			.map_err(|_| GatewayError::Internal("coordinator dropped the probe".to_string()))?
	}
}

/// Everything a probe needs, cloneable into spawned tasks.
#[derive(Clone)]
struct ProbeCtx {
	registry: Arc<BackendRegistry>,
	breakers: Arc<CircuitBreakers>,
	cache: Arc<ToolResultCache>,
	hub: SharedHub,
	spec: CoordinatorSpec,
}

/// The background loop object. Construct with [`Coordinator::new`], then
/// `tokio::spawn(coordinator.run())`.
pub struct Coordinator {
	ctx: ProbeCtx,
	commands: mpsc::Receiver<Command>,
}

impl Coordinator {
	pub fn new(
		registry: Arc<BackendRegistry>,
		breakers: Arc<CircuitBreakers>,
		cache: Arc<ToolResultCache>,
		hub: SharedHub,
		spec: CoordinatorSpec,
	) -> (Self, CoordinatorHandle) {
		let (tx, rx) = mpsc::channel(16);
		(
			Self {
				ctx: ProbeCtx {
					registry,
					breakers,
					cache,
					hub,
					spec,
				},
				commands: rx,
			},
			CoordinatorHandle { commands: tx },
		)
	}

	pub async fn run(mut self) {
		let mut ticker = tokio::time::interval(self.ctx.spec.probe_interval());
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		info!(
			target: "coordinator",
			interval_ms = self.ctx.spec.probe_interval_ms,
			"health-check loop started"
		);

		let mut commands_open = true;
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					self.probe_round();
				},
				command = self.commands.recv(), if commands_open => {
					match command {
						Some(Command::ForceProbe { backend, reply }) => {
							// Spawned so a slow backend cannot stall the loop;
							// the requester waits on the oneshot instead.
							let ctx = self.ctx.clone();
							tokio::spawn(async move {
								let report = probe_backend(&ctx, &backend).await;
								let _ = reply.send(report);
							});
						},
						None => {
							// All handles dropped; scheduled probing continues.
							commands_open = false;
						},
					}
				},
			}
		}
	}

	/// Kick off one probe task per enabled backend. Tasks are independent;
	/// the round itself returns immediately.
	fn probe_round(&self) {
		let backends = self.ctx.registry.list(true);
		debug!(target: "coordinator", count = backends.len(), "probe round");
		for backend in backends {
			let ctx = self.ctx.clone();
			let name = backend.name().to_string();
			tokio::spawn(async move {
				// Spread scheduled probes out so a large fleet is not hit in
				// lockstep.
				if ctx.spec.probe_jitter_ms > 0 {
					let jitter = rand::rng().random_range(0..=ctx.spec.probe_jitter_ms);
					tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
				}
				if let Err(err) = probe_backend(&ctx, &name).await {
					// Backend may have been deregistered between listing and
					// probing; nothing to do.
					debug!(target: "coordinator", backend = %name, error = %err, "probe skipped");
				}
			});
		}
	}
}

async fn probe_backend(ctx: &ProbeCtx, name: &str) -> Result<ProbeReport, GatewayError> {
	let backend = ctx
		.registry
		.get(name)
		.ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;

	let refresh = backend.refresh_catalog(ctx.spec.probe_timeout()).await;

	if let Some(transition) = refresh.transition {
		let severity = match transition.to {
			HealthStatus::Unhealthy => Severity::High,
			_ => Severity::Info,
		};
		let reason = match &refresh.result {
			Ok(count) => format!("probe succeeded, {count} tools"),
			Err(err) => err.to_string(),
		};
		ctx.hub.publish(
			DomainEvent::new(EVENT_BACKEND_STATUS_CHANGED, severity)
				.backend(name)
				.with("from", transition.from)
				.with("to", transition.to)
				.with("reason", reason),
		);
	}

	let mut auto_disabled = false;
	match &refresh.result {
		Ok(tools) => {
			ctx.breakers.record_success(name);
			Ok(ProbeReport {
				backend: name.to_string(),
				healthy: true,
				tools: *tools,
				consecutive_failures: 0,
				auto_disabled,
			})
		},
		Err(err) => {
			ctx.breakers.record_failure(name);

			if refresh.consecutive_failures >= ctx.spec.auto_disable_threshold {
				// Harder than a breaker OPEN: stays off until an admin
				// re-enables it.
				let changed = ctx.registry.set_enabled(name, false).unwrap_or(false);
				if changed {
					auto_disabled = true;
					let dropped = ctx.cache.invalidate_backend(name);
					warn!(
						target: "coordinator",
						backend = %name,
						failures = refresh.consecutive_failures,
						cache_dropped = dropped,
						"backend auto-disabled"
					);
					ctx.hub.publish(
						DomainEvent::new(EVENT_BACKEND_AUTO_DISABLED, Severity::Critical)
							.backend(name)
							.with("consecutive_failures", refresh.consecutive_failures)
							.with("reason", err.to_string()),
					);
				}
			}

			Ok(ProbeReport {
				backend: name.to_string(),
				healthy: false,
				tools: 0,
				consecutive_failures: refresh.consecutive_failures,
				auto_disabled,
			})
		},
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::Arc;
	use std::time::Duration;

	use serde_json::json;

	use super::*;
	use crate::cache::CacheKey;
	use crate::config::{BreakerSpec, CacheSpec};
	use crate::events::{EventHub, EVENT_BREAKER_STATE_CHANGED};
	use crate::registry::testing::ScriptedTransport;
	use crate::registry::transport::{ToolSpec, TransportError};
	use crate::registry::BackendConfig;

	struct Fixture {
		registry: Arc<BackendRegistry>,
		breakers: Arc<CircuitBreakers>,
		cache: Arc<ToolResultCache>,
		hub: SharedHub,
		handle: CoordinatorHandle,
	}

	fn fixture(spec: CoordinatorSpec) -> Fixture {
		let hub = Arc::new(EventHub::new());
		let registry = Arc::new(BackendRegistry::new());
		let breakers = Arc::new(CircuitBreakers::new(
			BreakerSpec::default(),
			Arc::clone(&hub),
		));
		let cache = Arc::new(ToolResultCache::new(CacheSpec::default()));
		let (coordinator, handle) = Coordinator::new(
			Arc::clone(&registry),
			Arc::clone(&breakers),
			Arc::clone(&cache),
			Arc::clone(&hub),
			spec,
		);
		tokio::spawn(coordinator.run());
		Fixture {
			registry,
			breakers,
			cache,
			hub,
			handle,
		}
	}

	fn quiet_spec() -> CoordinatorSpec {
		CoordinatorSpec {
			// Long interval keeps scheduled rounds out of force-probe tests.
			probe_interval_ms: 3_600_000,
			probe_timeout_ms: 1_000,
			auto_disable_threshold: 3,
			probe_jitter_ms: 0,
		}
	}

	fn config(name: &str) -> BackendConfig {
		BackendConfig {
			name: name.to_string(),
			endpoint: format!("http://{name}:9000"),
			timeout_ms: 1_000,
			enabled: true,
			breaker: None,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_force_probe_success_updates_health_and_catalog() {
		let fx = fixture(quiet_spec());
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Ok(vec![ToolSpec::named("get_health")]));
		fx.registry.register(config("db"), transport).unwrap();

		let report = fx.handle.force_probe("db").await.unwrap();
		assert!(report.healthy);
		assert_eq!(report.tools, 1);

		let backend = fx.registry.get("db").unwrap();
		assert_eq!(backend.health().status, HealthStatus::Healthy);
		assert!(backend.knows_operation("get_health"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_force_probe_unknown_backend() {
		let fx = fixture(quiet_spec());
		let err = fx.handle.force_probe("ghost").await.unwrap_err();
		assert!(matches!(err, GatewayError::BackendNotFound(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_status_change_event_only_on_transition() {
		let fx = fixture(quiet_spec());
		let (_id, mut events) = fx.hub.subscribe(
			"test",
			[EVENT_BACKEND_STATUS_CHANGED],
			HashMap::new(),
		);

		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Err(TransportError::Unreachable("refused".into())));
		transport.queue_list(Err(TransportError::Unreachable("refused".into())));
		fx.registry.register(config("db"), transport).unwrap();

		fx.handle.force_probe("db").await.unwrap();
		let event = events.try_recv().unwrap();
		assert_eq!(event.payload.get("to").map(String::as_str), Some("unhealthy"));
		assert_eq!(event.payload.get("severity").map(String::as_str), Some("high"));

		fx.handle.force_probe("db").await.unwrap();
		assert!(events.try_recv().is_err(), "repeat failure must not re-emit");
	}

	#[tokio::test(start_paused = true)]
	async fn test_probe_failures_drive_breaker() {
		let fx = fixture(quiet_spec());
		fx.breakers.set_backend_spec(
			"db",
			Some(BreakerSpec {
				failure_threshold: 2,
				open_duration_ms: 60_000,
			}),
		);
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Err(TransportError::Failed("boom".into())));
		transport.queue_list(Err(TransportError::Failed("boom".into())));
		fx.registry.register(config("db"), transport).unwrap();

		fx.handle.force_probe("db").await.unwrap();
		assert!(fx.breakers.allow_call("db"));
		fx.handle.force_probe("db").await.unwrap();
		assert!(!fx.breakers.allow_call("db"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_auto_disable_after_threshold_and_cache_invalidation() {
		let fx = fixture(quiet_spec());
		let (_id, mut events) = fx.hub.subscribe(
			"test",
			[EVENT_BACKEND_AUTO_DISABLED],
			HashMap::new(),
		);

		let transport = Arc::new(ScriptedTransport::new());
		for _ in 0..3 {
			transport.queue_list(Err(TransportError::Unreachable("down".into())));
		}
		fx.registry.register(config("db"), transport).unwrap();

		let key = CacheKey::new("db", "get_health", &json!({}));
		fx.cache.put(key.clone(), json!({"cached": true}));

		for i in 0..3 {
			let report = fx.handle.force_probe("db").await.unwrap();
			assert_eq!(report.auto_disabled, i == 2);
		}

		assert!(!fx.registry.get("db").unwrap().is_enabled());
		let event = events.try_recv().unwrap();
		assert_eq!(event.payload.get("severity").map(String::as_str), Some("critical"));
		assert_eq!(
			event.payload.get("consecutive_failures").map(String::as_str),
			Some("3")
		);
		assert!(fx.cache.get(&key).is_none(), "disable invalidates cached results");
	}

	#[tokio::test(start_paused = true)]
	async fn test_scheduled_round_probes_enabled_backends_only() {
		let spec = CoordinatorSpec {
			probe_interval_ms: 60_000,
			probe_timeout_ms: 1_000,
			auto_disable_threshold: 10,
			probe_jitter_ms: 0,
		};
		let fx = fixture(spec);

		let up = Arc::new(ScriptedTransport::new());
		up.queue_list(Ok(vec![ToolSpec::named("get_health")]));
		fx.registry.register(config("up"), up).unwrap();

		let off = Arc::new(ScriptedTransport::new());
		fx.registry.register(config("off"), off).unwrap();
		fx.registry.set_enabled("off", false).unwrap();

		// First tick fires immediately; give the spawned probes a chance.
		tokio::time::sleep(Duration::from_millis(100)).await;

		assert_eq!(
			fx.registry.get("up").unwrap().health().status,
			HealthStatus::Healthy
		);
		assert_eq!(
			fx.registry.get("off").unwrap().health().status,
			HealthStatus::Unknown,
			"disabled backends are not probed"
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_slow_backend_does_not_delay_others() {
		let spec = CoordinatorSpec {
			probe_interval_ms: 60_000,
			probe_timeout_ms: 500,
			auto_disable_threshold: 10,
			probe_jitter_ms: 0,
		};
		let fx = fixture(spec);

		let hung = Arc::new(ScriptedTransport::new());
		hung.set_delay(Duration::from_secs(3_600));
		fx.registry.register(config("hung"), hung).unwrap();

		let fast = Arc::new(ScriptedTransport::new());
		fast.queue_list(Ok(vec![ToolSpec::named("get_health")]));
		fx.registry.register(config("fast"), fast).unwrap();

		tokio::time::sleep(Duration::from_millis(600)).await;

		assert_eq!(
			fx.registry.get("fast").unwrap().health().status,
			HealthStatus::Healthy,
			"fast backend probed despite hung sibling"
		);
		// The hung probe itself times out rather than hanging forever.
		assert_eq!(
			fx.registry.get("hung").unwrap().health().status,
			HealthStatus::Unhealthy
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_breaker_transition_events_flow_from_probes() {
		let fx = fixture(quiet_spec());
		fx.breakers.set_backend_spec(
			"db",
			Some(BreakerSpec {
				failure_threshold: 1,
				open_duration_ms: 60_000,
			}),
		);
		let (_id, mut events) = fx.hub.subscribe(
			"test",
			[EVENT_BREAKER_STATE_CHANGED],
			HashMap::new(),
		);

		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Err(TransportError::Failed("boom".into())));
		fx.registry.register(config("db"), transport).unwrap();

		fx.handle.force_probe("db").await.unwrap();
		let event = events.try_recv().unwrap();
		assert_eq!(event.payload.get("to").map(String::as_str), Some("open"));
	}
}
