// The gateway call path and admin control surface.
//
// One request flows permission check -> breaker -> cache -> invocation ->
// cache store -> breaker update; state-change events fan out through the
// hub. These steps are sequential within one request and share nothing
// across requests except the per-backend breaker lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::breaker::{BreakerStatus, CircuitBreakers};
use crate::cache::{CacheKey, CacheStats, ToolResultCache};
use crate::config::{BreakerSpec, GatewayConfig};
use crate::coordinator::{Coordinator, CoordinatorHandle, ProbeReport};
use crate::errors::GatewayError;
use crate::events::{
	DomainEvent, EventHub, Severity, SharedHub, EVENT_BACKEND_DISABLED, EVENT_BACKEND_ENABLED,
	EVENT_CACHE_CLEARED,
};
use crate::policy::{CallerIdentity, PermissionEngine, PolicyDocument, ToolOverride};
use crate::registry::transport::BackendTransport;
use crate::registry::{Backend, BackendConfig, BackendRegistry, HealthSnapshot};

/// Result of one gateway call: the payload, and whether it was served from
/// the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
	pub value: Value,
	pub cached: bool,
}

/// Admin listing entry for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendOverview {
	pub name: String,
	pub endpoint: String,
	#[serde(flatten)]
	pub health: HealthSnapshot,
	pub in_flight: usize,
	pub tools: usize,
}

/// The runtime orchestration core, wired together.
pub struct Gateway {
	config: GatewayConfig,
	registry: Arc<BackendRegistry>,
	breakers: Arc<CircuitBreakers>,
	cache: Arc<ToolResultCache>,
	policy: Arc<PermissionEngine>,
	hub: SharedHub,
	coordinator: Mutex<Option<CoordinatorHandle>>,
}

impl Gateway {
	pub fn new(config: GatewayConfig, policy: PolicyDocument) -> Self {
		let hub: SharedHub = Arc::new(EventHub::new());
		let breakers = Arc::new(CircuitBreakers::new(config.breaker, Arc::clone(&hub)));
		let cache = Arc::new(ToolResultCache::new(config.cache));
		Self {
			config,
			registry: Arc::new(BackendRegistry::new()),
			breakers,
			cache,
			policy: Arc::new(PermissionEngine::new(policy)),
			hub,
			coordinator: Mutex::new(None),
		}
	}

	/// Spawn the coordinator loop and the cache sweeper. Returns the
	/// coordinator handle, which is also retained for
	/// [`Self::force_probe`].
	pub fn start(&self) -> CoordinatorHandle {
		let (coordinator, handle) = Coordinator::new(
			Arc::clone(&self.registry),
			Arc::clone(&self.breakers),
			Arc::clone(&self.cache),
			Arc::clone(&self.hub),
			self.config.coordinator,
		);
		tokio::spawn(coordinator.run());
		Arc::clone(&self.cache).spawn_sweeper();
		*self.coordinator.lock() = Some(handle.clone());
		info!(target: "gateway", "background tasks started");
		handle
	}

	pub fn registry(&self) -> &Arc<BackendRegistry> {
		&self.registry
	}

	pub fn hub(&self) -> &SharedHub {
		&self.hub
	}

	pub fn policy(&self) -> &Arc<PermissionEngine> {
		&self.policy
	}

	/// Execute one operation call on behalf of a verified identity.
	pub async fn call(
		&self,
		identity: &CallerIdentity,
		backend_name: &str,
		operation: &str,
		arguments: Value,
	) -> Result<CallOutcome, GatewayError> {
		// Permission first; nothing else is consulted on a deny.
		let decision = self.policy.resolve(identity, backend_name, operation, None);
		if !decision.allowed {
			return Err(GatewayError::denied(decision.reason));
		}

		// Resolve the typed handle once; everything below operates on it.
		let backend = self
			.registry
			.get(backend_name)
			.ok_or_else(|| GatewayError::BackendNotFound(backend_name.to_string()))?;
		if !backend.is_enabled() {
			return Err(GatewayError::unreachable(
				backend_name,
				"backend is administratively disabled",
			));
		}
		if !backend.knows_operation(operation) {
			return Err(GatewayError::operation_not_found(backend_name, operation));
		}

		// Breaker short-circuit, before the cache per the call-path order.
		self
			.breakers
			.try_acquire(backend_name)
			.map_err(|retry_after| GatewayError::CircuitOpen {
				backend: backend_name.to_string(),
				retry_after,
			})?;

		let key = CacheKey::new(backend_name, operation, &arguments);
		if let Some(value) = self.cache.get(&key) {
			// The admitted slot goes unused; hand a HALF_OPEN trial back.
			self.breakers.cancel_acquire(backend_name);
			debug!(target: "gateway", backend = %backend_name, operation, "cache hit");
			return Ok(CallOutcome {
				value,
				cached: true,
			});
		}

		// The invocation runs in its own task: a caller that disconnects
		// mid-call must not cancel the shared breaker/cache updates.
		let task = tokio::spawn(invoke_and_record(
			backend,
			Arc::clone(&self.registry),
			Arc::clone(&self.breakers),
			Arc::clone(&self.cache),
			key,
			operation.to_string(),
			arguments,
		));
		match task.await {
			Ok(result) => result.map(|value| CallOutcome {
				value,
				cached: false,
			}),
			Err(join_err) => Err(GatewayError::Internal(format!(
				"invocation task failed: {join_err}"
			))),
		}
	}

	// --- admin surface -----------------------------------------------------

	/// Register a backend with an explicit transport, applying any
	/// per-backend breaker override it declares.
	pub fn register_backend(
		&self,
		config: BackendConfig,
		transport: Arc<dyn BackendTransport>,
	) -> Result<Arc<Backend>, GatewayError> {
		let backend = self.registry.register(config, transport)?;
		if let Some(spec) = backend.breaker_spec() {
			self
				.breakers
				.set_backend_spec(backend.name(), Some(spec));
		}
		Ok(backend)
	}

	/// Register a backend reached over the default HTTP transport.
	pub fn register_http_backend(
		&self,
		config: BackendConfig,
	) -> Result<Arc<Backend>, GatewayError> {
		let transport = Arc::new(crate::registry::transport::HttpTransport::new(
			config.endpoint.clone(),
		));
		self.register_backend(config, transport)
	}

	/// Deregister a backend. In-flight calls drain on their existing
	/// handles; breaker and cache state for the name are dropped.
	pub fn deregister_backend(&self, name: &str) -> Result<(), GatewayError> {
		self.registry.deregister(name)?;
		self.breakers.forget(name);
		self.cache.invalidate_backend(name);
		Ok(())
	}

	pub fn enable_backend(&self, name: &str) -> Result<(), GatewayError> {
		if self.registry.set_enabled(name, true)? {
			self
				.hub
				.publish(DomainEvent::new(EVENT_BACKEND_ENABLED, Severity::Info).backend(name));
		}
		Ok(())
	}

	/// Disable a backend and drop its cached results.
	pub fn disable_backend(&self, name: &str) -> Result<(), GatewayError> {
		if self.registry.set_enabled(name, false)? {
			self.cache.invalidate_backend(name);
			self
				.hub
				.publish(DomainEvent::new(EVENT_BACKEND_DISABLED, Severity::Warning).backend(name));
		}
		Ok(())
	}

	/// Probe a backend immediately. Requires [`Self::start`] to have run.
	pub async fn force_probe(&self, name: &str) -> Result<ProbeReport, GatewayError> {
		let handle = self
			.coordinator
			.lock()
			.clone()
			.ok_or_else(|| GatewayError::Internal("coordinator not started".to_string()))?;
		handle.force_probe(name).await
	}

	/// Probe every enabled backend immediately, outside the scheduled cycle.
	/// Probes run concurrently through the coordinator, so health, breaker,
	/// and event semantics are identical to a scheduled round. Requires
	/// [`Self::start`] to have run.
	pub async fn refresh_catalogs(&self) -> Result<Vec<ProbeReport>, GatewayError> {
		let handle = self
			.coordinator
			.lock()
			.clone()
			.ok_or_else(|| GatewayError::Internal("coordinator not started".to_string()))?;
		let names: Vec<String> = self
			.registry
			.list(true)
			.iter()
			.map(|backend| backend.name().to_string())
			.collect();
		let reports =
			futures::future::join_all(names.iter().map(|name| handle.force_probe(name))).await;
		// A backend deregistered between listing and probing just drops out.
		Ok(reports.into_iter().flatten().collect())
	}

	pub fn list_backends(&self) -> Vec<BackendOverview> {
		self
			.registry
			.list(false)
			.into_iter()
			.map(|backend| BackendOverview {
				name: backend.name().to_string(),
				endpoint: backend.endpoint().to_string(),
				health: backend.health(),
				in_flight: backend.in_flight(),
				tools: backend.catalog().len(),
			})
			.collect()
	}

	pub fn set_breaker_spec(&self, backend: &str, spec: Option<BreakerSpec>) {
		self.breakers.set_backend_spec(backend, spec);
	}

	pub fn set_default_breaker_spec(&self, spec: BreakerSpec) {
		self.breakers.set_default_spec(spec);
	}

	pub fn breaker_states(&self) -> Vec<BreakerStatus> {
		self.breakers.states()
	}

	pub fn cache_stats(&self) -> CacheStats {
		self.cache.stats()
	}

	/// Global cache clear. Returns how many entries were dropped.
	pub fn clear_cache(&self) -> usize {
		let removed = self.cache.clear();
		self.hub.publish(
			DomainEvent::new(EVENT_CACHE_CLEARED, Severity::Info).with("removed", removed),
		);
		removed
	}

	pub fn invalidate_backend_cache(&self, backend: &str) -> usize {
		self.cache.invalidate_backend(backend)
	}

	pub fn invalidate_operation_cache(&self, backend: &str, operation: &str) -> usize {
		self.cache.invalidate_operation(backend, operation)
	}

	pub fn set_override(&self, identity: &str, backend: &str, over: ToolOverride) {
		self.policy.set_override(identity, backend, over);
	}

	pub fn remove_override(&self, identity: &str, backend: &str) -> bool {
		self.policy.remove_override(identity, backend)
	}

	pub fn list_overrides(&self, identity: &str) -> HashMap<String, ToolOverride> {
		self.policy.list_overrides(identity)
	}
}

/// Body of the detached invocation task: call the backend, then update the
/// cache and breaker for everyone else regardless of whether the original
/// caller is still listening. A call draining after deregistration skips
/// the shared-state updates; its backend no longer exists.
async fn invoke_and_record(
	backend: Arc<Backend>,
	registry: Arc<BackendRegistry>,
	breakers: Arc<CircuitBreakers>,
	cache: Arc<ToolResultCache>,
	key: CacheKey,
	operation: String,
	arguments: Value,
) -> Result<Value, GatewayError> {
	let name = backend.name().to_string();
	let result = backend.invoke(&operation, &arguments).await;
	if registry.get(&name).is_none() {
		return result;
	}
	match &result {
		Ok(value) => {
			cache.put(key, value.clone());
			breakers.record_success(&name);
		},
		Err(err) if err.is_invocation_failure() => {
			breakers.record_failure(&name);
		},
		Err(_) => {},
	}
	result
}
