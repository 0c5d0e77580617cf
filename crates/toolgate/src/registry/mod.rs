// Backend registry: the set of configured backends, each with its health
// state and discovered capability catalog.
//
// Lookup resolves to a typed `Arc<Backend>` handle once per request; the
// handle carries the transport, so later operations never go back through
// string-keyed dispatch. Health fields are mutated only through
// `refresh_catalog` (driven by the coordinator or an admin force-probe) and
// `set_enabled`. Deregistration removes the record from lookup immediately
// while outstanding handles let in-flight calls drain.

pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BreakerSpec;
use crate::errors::GatewayError;
use crate::events::now_ms;
use transport::{BackendTransport, HttpTransport, ToolSpec, TransportError};

/// Health of one backend as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	#[default]
	Unknown,
	Healthy,
	Unhealthy,
}

impl fmt::Display for HealthStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			HealthStatus::Unknown => "unknown",
			HealthStatus::Healthy => "healthy",
			HealthStatus::Unhealthy => "unhealthy",
		};
		f.write_str(s)
	}
}

/// Static configuration for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackendConfig {
	/// Unique name.
	pub name: String,
	/// Invocation endpoint.
	pub endpoint: String,
	/// Declared per-call timeout.
	#[serde(default = "default_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	/// Per-backend breaker override, if any.
	#[serde(default)]
	pub breaker: Option<BreakerSpec>,
}

fn default_timeout_ms() -> u64 {
	10_000
}

fn default_enabled() -> bool {
	true
}

/// Mutable health/lifecycle fields, serialized per backend behind one lock.
struct HealthState {
	status: HealthStatus,
	consecutive_failures: u32,
	last_check_ms: Option<u64>,
	enabled: bool,
}

/// Point-in-time view of a backend's health for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
	pub status: HealthStatus,
	pub consecutive_failures: u32,
	pub last_check_ms: Option<u64>,
	pub enabled: bool,
}

/// A health transition observed while refreshing the catalog. The caller
/// that drove the refresh publishes the matching event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
	pub from: HealthStatus,
	pub to: HealthStatus,
}

/// Outcome of one catalog refresh / health probe.
pub struct CatalogRefresh {
	/// Number of tools discovered, or why the probe failed.
	pub result: Result<usize, GatewayError>,
	/// Set when the probe changed the health status (not on repeats).
	pub transition: Option<HealthTransition>,
	/// Failure streak after this probe.
	pub consecutive_failures: u32,
}

impl CatalogRefresh {
	pub fn succeeded(&self) -> bool {
		self.result.is_ok()
	}
}

/// Typed handle to one registered backend.
pub struct Backend {
	name: String,
	endpoint: String,
	timeout: Duration,
	breaker: Option<BreakerSpec>,
	transport: Arc<dyn BackendTransport>,
	state: Mutex<HealthState>,
	catalog: RwLock<Arc<Vec<ToolSpec>>>,
	in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a call finishes, however it ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::Relaxed);
	}
}

impl Backend {
	fn new(config: BackendConfig, transport: Arc<dyn BackendTransport>) -> Self {
		Self {
			name: config.name,
			endpoint: config.endpoint,
			timeout: Duration::from_millis(config.timeout_ms),
			breaker: config.breaker,
			transport,
			state: Mutex::new(HealthState {
				status: HealthStatus::Unknown,
				consecutive_failures: 0,
				last_check_ms: None,
				enabled: config.enabled,
			}),
			catalog: RwLock::new(Arc::new(Vec::new())),
			in_flight: AtomicUsize::new(0),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	pub fn breaker_spec(&self) -> Option<BreakerSpec> {
		self.breaker
	}

	pub fn is_enabled(&self) -> bool {
		self.state.lock().enabled
	}

	pub fn health(&self) -> HealthSnapshot {
		let state = self.state.lock();
		HealthSnapshot {
			status: state.status,
			consecutive_failures: state.consecutive_failures,
			last_check_ms: state.last_check_ms,
			enabled: state.enabled,
		}
	}

	/// The last discovered capability catalog.
	pub fn catalog(&self) -> Arc<Vec<ToolSpec>> {
		Arc::clone(&self.catalog.read())
	}

	/// Whether the catalog admits `operation`. An empty catalog means
	/// discovery has not happened yet and nothing can be ruled out.
	pub fn knows_operation(&self, operation: &str) -> bool {
		let catalog = self.catalog.read();
		catalog.is_empty() || catalog.iter().any(|tool| tool.name == operation)
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::Relaxed)
	}

	/// Invoke one operation, bounded by the backend's declared timeout.
	pub async fn invoke(&self, operation: &str, arguments: &Value) -> Result<Value, GatewayError> {
		self.in_flight.fetch_add(1, Ordering::Relaxed);
		let _guard = InFlightGuard(&self.in_flight);

		match tokio::time::timeout(self.timeout, self.transport.invoke(operation, arguments)).await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(err)) => Err(self.map_transport_error(err)),
			Err(_elapsed) => Err(GatewayError::BackendTimeout {
				backend: self.name.clone(),
				timeout: self.timeout,
			}),
		}
	}

	/// Probe the backend by listing its capabilities, replacing the stored
	/// catalog on success. Health fields update atomically with respect to
	/// other probes of the same backend.
	pub async fn refresh_catalog(&self, bound: Duration) -> CatalogRefresh {
		let outcome = match tokio::time::timeout(bound, self.transport.list_tools()).await {
			Ok(Ok(tools)) => Ok(tools),
			Ok(Err(err)) => Err(self.map_transport_error(err)),
			Err(_elapsed) => Err(GatewayError::BackendTimeout {
				backend: self.name.clone(),
				timeout: bound,
			}),
		};

		match outcome {
			Ok(tools) => {
				let count = tools.len();
				*self.catalog.write() = Arc::new(tools);

				let mut state = self.state.lock();
				let from = state.status;
				state.status = HealthStatus::Healthy;
				state.consecutive_failures = 0;
				state.last_check_ms = Some(now_ms());
				let transition = (from != HealthStatus::Healthy).then_some(HealthTransition {
					from,
					to: HealthStatus::Healthy,
				});
				drop(state);

				debug!(target: "registry", backend = %self.name, tools = count, "catalog refreshed");
				CatalogRefresh {
					result: Ok(count),
					transition,
					consecutive_failures: 0,
				}
			},
			Err(err) => {
				let mut state = self.state.lock();
				let from = state.status;
				state.status = HealthStatus::Unhealthy;
				state.consecutive_failures += 1;
				state.last_check_ms = Some(now_ms());
				let failures = state.consecutive_failures;
				let transition = (from != HealthStatus::Unhealthy).then_some(HealthTransition {
					from,
					to: HealthStatus::Unhealthy,
				});
				drop(state);

				warn!(target: "registry", backend = %self.name, failures, error = %err, "catalog refresh failed");
				CatalogRefresh {
					result: Err(err),
					transition,
					consecutive_failures: failures,
				}
			},
		}
	}

	/// Flip the enabled flag. Returns true if the value changed.
	pub fn set_enabled(&self, enabled: bool) -> bool {
		let mut state = self.state.lock();
		let changed = state.enabled != enabled;
		state.enabled = enabled;
		changed
	}

	fn map_transport_error(&self, err: TransportError) -> GatewayError {
		match err {
			TransportError::Timeout => GatewayError::BackendTimeout {
				backend: self.name.clone(),
				timeout: self.timeout,
			},
			TransportError::Unreachable(reason) => GatewayError::unreachable(&self.name, reason),
			TransportError::Failed(message) => GatewayError::backend_error(&self.name, message),
		}
	}
}

impl fmt::Debug for Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Backend")
			.field("name", &self.name)
			.field("endpoint", &self.endpoint)
			.finish_non_exhaustive()
	}
}

/// The set of registered backends.
#[derive(Default)]
pub struct BackendRegistry {
	backends: RwLock<HashMap<String, Arc<Backend>>>,
}

impl BackendRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a backend with an explicit transport.
	pub fn register(
		&self,
		config: BackendConfig,
		transport: Arc<dyn BackendTransport>,
	) -> Result<Arc<Backend>, GatewayError> {
		let mut backends = self.backends.write();
		if backends.contains_key(&config.name) {
			return Err(GatewayError::DuplicateBackend(config.name));
		}
		let name = config.name.clone();
		let backend = Arc::new(Backend::new(config, transport));
		backends.insert(name.clone(), Arc::clone(&backend));
		info!(target: "registry", backend = %name, endpoint = %backend.endpoint, "backend registered");
		Ok(backend)
	}

	/// Register a backend reached over the default HTTP transport.
	pub fn register_http(&self, config: BackendConfig) -> Result<Arc<Backend>, GatewayError> {
		let transport = Arc::new(HttpTransport::new(config.endpoint.clone()));
		self.register(config, transport)
	}

	/// Remove a backend from lookup. Existing handles keep in-flight calls
	/// alive until they complete; no new call can resolve the name.
	pub fn deregister(&self, name: &str) -> Result<Arc<Backend>, GatewayError> {
		let removed = self.backends.write().remove(name);
		match removed {
			Some(backend) => {
				let draining = backend.in_flight();
				info!(target: "registry", backend = %name, draining, "backend deregistered");
				Ok(backend)
			},
			None => Err(GatewayError::BackendNotFound(name.to_string())),
		}
	}

	pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
		self.backends.read().get(name).map(Arc::clone)
	}

	/// List backends, optionally only the enabled ones, sorted by name.
	pub fn list(&self, enabled_only: bool) -> Vec<Arc<Backend>> {
		let mut backends: Vec<Arc<Backend>> = self
			.backends
			.read()
			.values()
			.filter(|backend| !enabled_only || backend.is_enabled())
			.map(Arc::clone)
			.collect();
		backends.sort_by(|a, b| a.name.cmp(&b.name));
		backends
	}

	pub fn len(&self) -> usize {
		self.backends.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.backends.read().is_empty()
	}

	/// Flip a backend's enabled flag. Returns true if the value changed.
	pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, GatewayError> {
		let backend = self
			.get(name)
			.ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;
		Ok(backend.set_enabled(enabled))
	}

	/// Probe one backend and refresh its catalog, bounded by `bound`.
	pub async fn refresh_catalog(
		&self,
		name: &str,
		bound: Duration,
	) -> Result<CatalogRefresh, GatewayError> {
		let backend = self
			.get(name)
			.ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;
		Ok(backend.refresh_catalog(bound).await)
	}
}


#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use assert_matches::assert_matches;
	use serde_json::json;

	use super::testing::ScriptedTransport;
	use super::transport::{ToolSpec, TransportError};
	use super::*;

	fn config(name: &str) -> BackendConfig {
		BackendConfig {
			name: name.to_string(),
			endpoint: format!("http://{name}.internal:9000"),
			timeout_ms: 1_000,
			enabled: true,
			breaker: None,
		}
	}

	#[tokio::test]
	async fn test_register_and_lookup() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		registry.register(config("db"), transport).unwrap();

		assert!(registry.get("db").is_some());
		assert!(registry.get("missing").is_none());
		assert_eq!(registry.len(), 1);
	}

	#[tokio::test]
	async fn test_duplicate_name_rejected() {
		let registry = BackendRegistry::new();
		registry
			.register(config("db"), Arc::new(ScriptedTransport::new()))
			.unwrap();
		let err = registry
			.register(config("db"), Arc::new(ScriptedTransport::new()))
			.unwrap_err();
		assert_matches!(err, GatewayError::DuplicateBackend(name) if name == "db");
	}

	#[tokio::test]
	async fn test_deregister_removes_lookup() {
		let registry = BackendRegistry::new();
		registry
			.register(config("db"), Arc::new(ScriptedTransport::new()))
			.unwrap();
		registry.deregister("db").unwrap();
		assert!(registry.get("db").is_none());
		assert_matches!(
			registry.deregister("db"),
			Err(GatewayError::BackendNotFound(_))
		);
	}

	#[tokio::test]
	async fn test_list_enabled_only() {
		let registry = BackendRegistry::new();
		registry
			.register(config("a"), Arc::new(ScriptedTransport::new()))
			.unwrap();
		registry
			.register(config("b"), Arc::new(ScriptedTransport::new()))
			.unwrap();
		registry.set_enabled("b", false).unwrap();

		assert_eq!(registry.list(false).len(), 2);
		let enabled = registry.list(true);
		assert_eq!(enabled.len(), 1);
		assert_eq!(enabled[0].name(), "a");
	}

	#[tokio::test]
	async fn test_refresh_catalog_success_transitions_to_healthy() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Ok(vec![
			ToolSpec::named("get_health"),
			ToolSpec::named("run_query"),
		]));
		registry.register(config("db"), transport).unwrap();

		let refresh = registry
			.refresh_catalog("db", Duration::from_secs(1))
			.await
			.unwrap();
		assert_eq!(refresh.result.as_ref().ok(), Some(&2));
		assert_eq!(
			refresh.transition,
			Some(HealthTransition {
				from: HealthStatus::Unknown,
				to: HealthStatus::Healthy,
			})
		);

		let backend = registry.get("db").unwrap();
		assert_eq!(backend.health().status, HealthStatus::Healthy);
		assert!(backend.knows_operation("run_query"));
		assert!(!backend.knows_operation("drop_table"));
	}

	#[tokio::test]
	async fn test_refresh_catalog_failure_increments_streak_once_transitions() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Err(TransportError::Unreachable("refused".into())));
		transport.queue_list(Err(TransportError::Unreachable("refused".into())));
		registry.register(config("db"), transport).unwrap();

		let first = registry
			.refresh_catalog("db", Duration::from_secs(1))
			.await
			.unwrap();
		assert!(first.transition.is_some(), "unknown -> unhealthy transitions");
		assert_eq!(first.consecutive_failures, 1);

		let second = registry
			.refresh_catalog("db", Duration::from_secs(1))
			.await
			.unwrap();
		assert!(second.transition.is_none(), "repeat failure is not a transition");
		assert_eq!(second.consecutive_failures, 2);
	}

	#[tokio::test]
	async fn test_recovery_resets_failure_streak() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_list(Err(TransportError::Failed("boom".into())));
		transport.queue_list(Ok(vec![ToolSpec::named("get_health")]));
		registry.register(config("db"), transport).unwrap();

		registry
			.refresh_catalog("db", Duration::from_secs(1))
			.await
			.unwrap();
		let recovery = registry
			.refresh_catalog("db", Duration::from_secs(1))
			.await
			.unwrap();

		assert_eq!(
			recovery.transition,
			Some(HealthTransition {
				from: HealthStatus::Unhealthy,
				to: HealthStatus::Healthy,
			})
		);
		assert_eq!(registry.get("db").unwrap().health().consecutive_failures, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_invoke_timeout_maps_to_typed_error() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.set_delay(Duration::from_secs(5));
		transport.queue_invoke(Ok(json!({"ok": true})));
		let backend = registry.register(config("db"), transport).unwrap();

		let err = backend.invoke("get_health", &json!({})).await.unwrap_err();
		assert_matches!(err, GatewayError::BackendTimeout { .. });
	}

	#[tokio::test]
	async fn test_invoke_maps_transport_errors() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_invoke(Err(TransportError::Unreachable("refused".into())));
		transport.queue_invoke(Err(TransportError::Failed("500".into())));
		let backend = registry.register(config("db"), transport).unwrap();

		assert_matches!(
			backend.invoke("op", &json!({})).await,
			Err(GatewayError::BackendUnreachable { .. })
		);
		assert_matches!(
			backend.invoke("op", &json!({})).await,
			Err(GatewayError::BackendError { .. })
		);
	}

	#[tokio::test]
	async fn test_in_flight_guard_counts_down() {
		let registry = BackendRegistry::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.queue_invoke(Ok(json!(1)));
		let backend = registry.register(config("db"), transport).unwrap();

		backend.invoke("op", &json!({})).await.unwrap();
		assert_eq!(backend.in_flight(), 0);
	}
}
