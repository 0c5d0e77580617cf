// Domain events and the subscription/broadcast hub.
//
// Events are ephemeral: the hub fans each published event out to matching
// live subscriptions and keeps nothing. Persistence, if any, is an external
// collaborator subscribed like everyone else.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Event type tags emitted by the core.
pub const EVENT_BACKEND_STATUS_CHANGED: &str = "backend_status_changed";
pub const EVENT_BREAKER_STATE_CHANGED: &str = "breaker_state_changed";
pub const EVENT_BACKEND_AUTO_DISABLED: &str = "backend_auto_disabled";
pub const EVENT_BACKEND_ENABLED: &str = "backend_enabled";
pub const EVENT_BACKEND_DISABLED: &str = "backend_disabled";
pub const EVENT_CACHE_CLEARED: &str = "cache_cleared";

/// Buffered events per subscriber before deliveries start being dropped.
const SUBSCRIBER_BUFFER: usize = 64;

/// Severity attached to every event payload so filters can target it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Warning,
	High,
	Critical,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Severity::Info => "info",
			Severity::Warning => "warning",
			Severity::High => "high",
			Severity::Critical => "critical",
		};
		f.write_str(s)
	}
}

/// A single domain event: type tag, emission timestamp, flat payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
	#[serde(rename = "type")]
	pub event_type: String,
	pub timestamp_ms: u64,
	pub payload: BTreeMap<String, String>,
}

impl DomainEvent {
	pub fn new(event_type: impl Into<String>, severity: Severity) -> Self {
		let mut payload = BTreeMap::new();
		payload.insert("severity".to_string(), severity.to_string());
		Self {
			event_type: event_type.into(),
			timestamp_ms: now_ms(),
			payload,
		}
	}

	pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.payload.insert(key.into(), value.to_string());
		self
	}

	pub fn backend(self, name: &str) -> Self {
		self.with("backend", name)
	}
}

/// Current timestamp as Unix milliseconds.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

/// Identifier handed back from [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// A live subscription: which event types it wants and, per payload field,
/// which values it accepts.
struct Subscription {
	connection: String,
	event_types: HashSet<String>,
	filters: HashMap<String, HashSet<String>>,
	sender: mpsc::Sender<DomainEvent>,
}

impl Subscription {
	fn matches(&self, event: &DomainEvent) -> bool {
		if !self.event_types.contains(&event.event_type) {
			return false;
		}
		// Every filter field must be present in the payload with an accepted
		// value; a field the event lacks fails the filter.
		self.filters.iter().all(|(field, accepted)| {
			event
				.payload
				.get(field)
				.is_some_and(|value| accepted.contains(value))
		})
	}
}

/// Counters reported by [`EventHub::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
	pub subscriptions: usize,
}

/// In-process subscription table with filtered best-effort fan-out.
///
/// Delivery is at-most-once per subscription per event: a full buffer drops
/// the event for that subscriber only, and a closed receiver gets the
/// subscription pruned. Neither outcome affects other subscribers or the
/// publisher.
#[derive(Default)]
pub struct EventHub {
	subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl EventHub {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a subscription for `connection` and return the id plus the
	/// receiving end the connection layer should drain.
	///
	/// A connection re-subscribing replaces its previous subscription.
	pub fn subscribe(
		&self,
		connection: impl Into<String>,
		event_types: impl IntoIterator<Item = impl Into<String>>,
		filters: HashMap<String, HashSet<String>>,
	) -> (SubscriptionId, mpsc::Receiver<DomainEvent>) {
		let connection = connection.into();
		let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
		let subscription = Subscription {
			connection: connection.clone(),
			event_types: event_types.into_iter().map(Into::into).collect(),
			filters,
			sender,
		};

		let id = SubscriptionId(Uuid::new_v4());
		let mut subs = self.subscriptions.write();
		subs.retain(|_, existing| existing.connection != connection);
		subs.insert(id, subscription);
		debug!(target: "events", %id, connection = %connection, "subscription registered");
		(id, receiver)
	}

	/// Remove a subscription by id. Returns true if it existed.
	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		let removed = self.subscriptions.write().remove(&id).is_some();
		if removed {
			debug!(target: "events", %id, "subscription removed");
		}
		removed
	}

	/// Remove every subscription belonging to a disconnected connection.
	pub fn drop_connection(&self, connection: &str) -> usize {
		let mut subs = self.subscriptions.write();
		let before = subs.len();
		subs.retain(|_, sub| sub.connection != connection);
		before - subs.len()
	}

	/// Fan an event out to all matching subscriptions. Returns how many
	/// subscribers the event was handed to.
	pub fn publish(&self, event: DomainEvent) -> usize {
		// Snapshot matching senders so delivery happens outside the lock and
		// concurrent (un)subscribes cannot block or race the fan-out.
		let matching: Vec<(SubscriptionId, mpsc::Sender<DomainEvent>)> = {
			let subs = self.subscriptions.read();
			subs
				.iter()
				.filter(|(_, sub)| sub.matches(&event))
				.map(|(id, sub)| (*id, sub.sender.clone()))
				.collect()
		};

		let mut delivered = 0;
		let mut dead = Vec::new();
		for (id, sender) in matching {
			match sender.try_send(event.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					// Slow consumer: drop this delivery, keep the subscription.
					warn!(target: "events", %id, event_type = %event.event_type, "subscriber buffer full, dropping event");
				},
				Err(mpsc::error::TrySendError::Closed(_)) => {
					dead.push(id);
				},
			}
		}

		if !dead.is_empty() {
			let mut subs = self.subscriptions.write();
			for id in dead {
				if subs.remove(&id).is_some() {
					debug!(target: "events", %id, "pruned closed subscription");
				}
			}
		}
		delivered
	}

	pub fn stats(&self) -> HubStats {
		HubStats {
			subscriptions: self.subscriptions.read().len(),
		}
	}
}

/// Convenience alias used by components that publish.
pub type SharedHub = Arc<EventHub>;
