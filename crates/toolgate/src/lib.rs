//! Gateway runtime core for fronting remote tool backends.
//!
//! The [`gateway::Gateway`] ties the pieces together: a registry of typed
//! backend handles, per-backend circuit breakers, a bounded TTL result
//! cache, a layered permission engine, a health-check coordinator, and an
//! event hub that fans state changes out to subscribers. Connection
//! handling, authentication, and persistence are collaborators outside this
//! crate; the core takes verified identities in and hands typed results and
//! events back.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod pattern;
pub mod policy;
pub mod registry;

pub use breaker::{BreakerState, BreakerStatus, CircuitBreakers};
pub use cache::{CacheKey, CacheStats, ToolResultCache};
pub use config::{BreakerSpec, CacheSpec, CoordinatorSpec, GatewayConfig};
pub use coordinator::{Coordinator, CoordinatorHandle, ProbeReport};
pub use errors::GatewayError;
pub use events::{DomainEvent, EventHub, Severity, SharedHub, SubscriptionId};
pub use gateway::{BackendOverview, CallOutcome, Gateway};
pub use policy::{
	CallerIdentity, Decision, PermissionEngine, PolicyDocument, RolePolicy, SystemPolicy,
	ToolOverride, ToolRestriction,
};
pub use registry::transport::{BackendTransport, HttpTransport, ToolSpec, TransportError};
pub use registry::{Backend, BackendConfig, BackendRegistry, HealthStatus};
