//! End-to-end tests of the gateway call path.
//!
//! These drive the public surface only: register backends, make calls, and
//! observe outcomes through returned values and hub subscriptions. The
//! backend side is a scripted in-process transport.

use std::collections::{HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use toolgate::{
	BackendConfig, BackendTransport, BreakerSpec, CallerIdentity, Gateway, GatewayConfig,
	GatewayError, PolicyDocument, RolePolicy, SystemPolicy, ToolOverride, ToolRestriction,
	ToolSpec, TransportError,
};

/// Transport whose responses are queued up front.
#[derive(Default)]
struct QueuedTransport {
	invokes: Mutex<VecDeque<Result<Value, TransportError>>>,
	invoked: Mutex<u32>,
	tools: Mutex<Vec<ToolSpec>>,
}

impl QueuedTransport {
	fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn queue(&self, result: Result<Value, TransportError>) {
		self.invokes.lock().push_back(result);
	}

	fn invoked(&self) -> u32 {
		*self.invoked.lock()
	}
}

#[async_trait]
impl BackendTransport for QueuedTransport {
	async fn invoke(&self, _operation: &str, _arguments: &Value) -> Result<Value, TransportError> {
		*self.invoked.lock() += 1;
		self
			.invokes
			.lock()
			.pop_front()
			.unwrap_or_else(|| Ok(Value::Null))
	}

	async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
		Ok(self.tools.lock().clone())
	}
}

fn policy() -> PolicyDocument {
	let mut roles = HashMap::new();
	roles.insert(
		"agent".to_string(),
		RolePolicy {
			backends: HashSet::from(["*".to_string()]),
			restrictions: HashMap::from([(
				"db".to_string(),
				ToolRestriction::Allow {
					patterns: vec!["get_*".to_string(), "run_*".to_string()],
				},
			)]),
			admin: false,
		},
	);
	PolicyDocument {
		system: SystemPolicy {
			deny_patterns: vec!["drop_*".to_string()],
			deny_exempt_roles: HashSet::new(),
			admin_only_patterns: vec![],
		},
		roles,
		overrides: HashMap::new(),
	}
}

fn db_config(breaker: Option<BreakerSpec>) -> BackendConfig {
	BackendConfig {
		name: "db".to_string(),
		endpoint: "http://db.internal:9000".to_string(),
		timeout_ms: 1_000,
		enabled: true,
		breaker,
	}
}

fn alice() -> CallerIdentity {
	CallerIdentity::new("alice", "agent")
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trip_and_recovery_cycle() -> anyhow::Result<()> {
	let gw = Gateway::new(GatewayConfig::default(), policy());
	let transport = QueuedTransport::new();
	for _ in 0..3 {
		transport.queue(Err(TransportError::Unreachable("refused".into())));
	}
	transport.queue(Ok(json!({"status": "ok"})));
	gw.register_backend(
		db_config(Some(BreakerSpec {
			failure_threshold: 3,
			open_duration_ms: 30_000,
		})),
		transport.clone(),
	)?;

	let (_id, mut events) = gw
		.hub()
		.subscribe("test", ["breaker_state_changed"], HashMap::new());

	// Three failures trip the circuit; each surfaces as a typed error.
	for i in 0..3 {
		let err = gw
			.call(&alice(), "db", "get_health", json!({"attempt": i}))
			.await
			.unwrap_err();
		assert_matches!(err, GatewayError::BackendUnreachable { .. });
	}
	let opened = events.try_recv()?;
	assert_eq!(opened.payload.get("to").map(String::as_str), Some("open"));
	assert!(events.try_recv().is_err(), "exactly one event for the trip");

	// While open the backend is never touched.
	let err = gw
		.call(&alice(), "db", "get_health", json!({}))
		.await
		.unwrap_err();
	assert_matches!(
		err,
		GatewayError::CircuitOpen {
			retry_after: Some(_),
			..
		}
	);
	assert_eq!(transport.invoked(), 3);

	// After the open duration one trial goes through and closes the circuit.
	tokio::time::advance(Duration::from_secs(30)).await;
	let outcome = gw.call(&alice(), "db", "get_health", json!({})).await?;
	assert_eq!(outcome.value, json!({"status": "ok"}));

	let half_open = events.try_recv()?;
	assert_eq!(
		half_open.payload.get("to").map(String::as_str),
		Some("half_open")
	);
	let closed = events.try_recv()?;
	assert_eq!(closed.payload.get("to").map(String::as_str), Some("closed"));
	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cache_serves_until_ttl_expires() -> anyhow::Result<()> {
	let mut config = GatewayConfig::default();
	config.cache.ttl_ms = 5_000;
	let gw = Gateway::new(config, policy());
	let transport = QueuedTransport::new();
	transport.queue(Ok(json!({"rows": 1})));
	transport.queue(Ok(json!({"rows": 2})));
	gw.register_backend(db_config(None), transport.clone())?;

	let args = json!({"q": "select 1"});
	let first = gw.call(&alice(), "db", "run_query", args.clone()).await?;
	assert!(!first.cached);

	let hit = gw.call(&alice(), "db", "run_query", args.clone()).await?;
	assert!(hit.cached);
	assert_eq!(hit.value, json!({"rows": 1}));
	assert_eq!(transport.invoked(), 1);

	tokio::time::advance(Duration::from_secs(5)).await;
	let refetched = gw.call(&alice(), "db", "run_query", args).await?;
	assert!(!refetched.cached);
	assert_eq!(refetched.value, json!({"rows": 2}));
	Ok(())
}

#[tokio::test]
async fn test_argument_order_does_not_defeat_the_cache() -> anyhow::Result<()> {
	let gw = Gateway::new(GatewayConfig::default(), policy());
	let transport = QueuedTransport::new();
	transport.queue(Ok(json!(42)));
	gw.register_backend(db_config(None), transport.clone())?;

	gw.call(&alice(), "db", "run_query", json!({"a": 1, "b": 2}))
		.await?;
	let hit = gw
		.call(&alice(), "db", "run_query", json!({"b": 2, "a": 1}))
		.await?;
	assert!(hit.cached);
	assert_eq!(transport.invoked(), 1);
	Ok(())
}

#[tokio::test]
async fn test_override_replaces_role_restriction() -> anyhow::Result<()> {
	let gw = Gateway::new(GatewayConfig::default(), policy());
	gw.register_backend(db_config(None), QueuedTransport::new())?;

	// Role default: get_*/run_* only.
	assert!(gw.call(&alice(), "db", "admin_reset", json!({})).await.is_err());

	gw.set_override(
		"alice",
		"db",
		ToolOverride::Custom {
			allow: vec!["admin_reset".to_string()],
			deny: vec![],
		},
	);

	// The override replaces the role default for this backend entirely.
	assert!(gw.call(&alice(), "db", "admin_reset", json!({})).await.is_ok());
	let err = gw
		.call(&alice(), "db", "get_health", json!({}))
		.await
		.unwrap_err();
	assert_matches!(err, GatewayError::PermissionDenied { .. });

	// System denylist still applies over the override.
	gw.set_override("alice", "db", ToolOverride::All);
	let err = gw
		.call(&alice(), "db", "drop_table", json!({}))
		.await
		.unwrap_err();
	assert_matches!(err, GatewayError::PermissionDenied { .. });

	gw.remove_override("alice", "db");
	assert!(gw.call(&alice(), "db", "get_health", json!({})).await.is_ok());
	Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_severity_filtered_subscription() -> anyhow::Result<()> {
	let gw = Gateway::new(GatewayConfig::default(), policy());
	let transport = QueuedTransport::new();
	transport.queue(Err(TransportError::Failed("boom".into())));
	transport.queue(Ok(json!(1)));
	gw.register_backend(
		db_config(Some(BreakerSpec {
			failure_threshold: 1,
			open_duration_ms: 1_000,
		})),
		transport,
	)?;

	let mut filters = HashMap::new();
	filters.insert(
		"severity".to_string(),
		HashSet::from(["high".to_string(), "critical".to_string()]),
	);
	let (_id, mut events) = gw
		.hub()
		.subscribe("pager", ["breaker_state_changed"], filters);

	// Trip (high), then recover (warning + info).
	let _ = gw.call(&alice(), "db", "get_health", json!({})).await;
	tokio::time::advance(Duration::from_secs(1)).await;
	gw.call(&alice(), "db", "get_health", json!({"fresh": true}))
		.await?;

	let event = events.try_recv()?;
	assert_eq!(event.payload.get("severity").map(String::as_str), Some("high"));
	assert!(
		events.try_recv().is_err(),
		"warning/info transitions are filtered out"
	);
	Ok(())
}

#[tokio::test]
async fn test_force_probe_through_gateway() -> anyhow::Result<()> {
	let gw = Gateway::new(GatewayConfig::default(), policy());
	let transport = QueuedTransport::new();
	transport
		.tools
		.lock()
		.push(ToolSpec::named("get_health"));
	gw.register_backend(db_config(None), transport)?;

	gw.start();
	let report = gw.force_probe("db").await?;
	assert!(report.healthy);
	assert_eq!(report.tools, 1);

	// Discovery now bounds the operation namespace.
	let err = gw
		.call(&alice(), "db", "run_migration", json!({}))
		.await
		.unwrap_err();
	assert_matches!(err, GatewayError::OperationNotFound { .. });
	Ok(())
}
