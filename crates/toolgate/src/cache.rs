// Bounded, time-boxed cache of tool results.
//
// Keys are deterministic fingerprints of (backend, operation, normalized
// arguments). Entries expire a fixed TTL after they were stored, regardless
// of access; capacity overflow evicts the single least-recently-used entry.
// Expiry is checked lazily on read and eagerly by a periodic sweep so
// entries nobody reads again still get released.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheSpec;

/// Deterministic cache key for one (backend, operation, arguments) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	backend: String,
	operation: String,
	fingerprint: String,
}

impl CacheKey {
	/// Build a key. Argument objects are normalized by recursively sorting
	/// map keys, so `{"a":1,"b":2}` and `{"b":2,"a":1}` fingerprint alike.
	pub fn new(backend: &str, operation: &str, arguments: &Value) -> Self {
		let mut fingerprint = String::with_capacity(64);
		fingerprint.push_str(backend);
		fingerprint.push(':');
		fingerprint.push_str(operation);
		fingerprint.push(':');
		write_canonical(arguments, &mut fingerprint);
		Self {
			backend: backend.to_string(),
			operation: operation.to_string(),
			fingerprint,
		}
	}

	pub fn backend(&self) -> &str {
		&self.backend
	}

	pub fn operation(&self) -> &str {
		&self.operation
	}
}

/// Append a canonical (key-sorted) JSON rendering of `value`.
fn write_canonical(value: &Value, out: &mut String) {
	match value {
		Value::Object(map) => {
			out.push('{');
			let mut keys: Vec<&String> = map.keys().collect();
			keys.sort_unstable();
			for (i, key) in keys.iter().enumerate() {
				if i > 0 {
					out.push(',');
				}
				// Display for Value emits compact JSON, which handles
				// string escaping for us.
				let _ = write!(out, "{}:", Value::String((*key).clone()));
				write_canonical(&map[*key], out);
			}
			out.push('}');
		},
		Value::Array(items) => {
			out.push('[');
			for (i, item) in items.iter().enumerate() {
				if i > 0 {
					out.push(',');
				}
				write_canonical(item, out);
			}
			out.push(']');
		},
		other => {
			let _ = write!(out, "{}", other);
		},
	}
}

struct Entry {
	backend: String,
	operation: String,
	value: Value,
	/// Serialized size, kept for eviction accounting.
	bytes: usize,
	stored_at: Instant,
	/// Stamp from the monotone access clock; smallest is least recently used.
	last_access: u64,
}

#[derive(Default)]
struct Inner {
	entries: HashMap<String, Entry>,
	access_clock: u64,
	total_bytes: usize,
}

impl Inner {
	fn touch(&mut self) -> u64 {
		self.access_clock += 1;
		self.access_clock
	}

	fn remove(&mut self, key: &str) -> Option<Entry> {
		let entry = self.entries.remove(key)?;
		self.total_bytes -= entry.bytes;
		Some(entry)
	}
}

/// Counters reported by [`ToolResultCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub size: usize,
	pub bytes: usize,
	pub evictions: u64,
}

/// Shared result cache. Reads and writes take one short-lived mutex over
/// the entry map; hit/miss/eviction counters live in atomics outside it.
pub struct ToolResultCache {
	spec: CacheSpec,
	inner: Mutex<Inner>,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}

impl ToolResultCache {
	pub fn new(spec: CacheSpec) -> Self {
		Self {
			spec,
			inner: Mutex::new(Inner::default()),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
		}
	}

	/// Look up a result. An expired entry counts as a miss and is removed.
	pub fn get(&self, key: &CacheKey) -> Option<Value> {
		let ttl = self.spec.ttl();
		let value = {
			let mut inner = self.inner.lock();
			let expired = inner
				.entries
				.get(&key.fingerprint)
				.is_some_and(|entry| entry.stored_at.elapsed() >= ttl);
			if expired {
				inner.remove(&key.fingerprint);
				None
			} else {
				let stamp = inner.touch();
				inner.entries.get_mut(&key.fingerprint).map(|entry| {
					entry.last_access = stamp;
					entry.value.clone()
				})
			}
		};
		match value {
			Some(value) => {
				self.hits.fetch_add(1, Ordering::Relaxed);
				Some(value)
			},
			None => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				None
			},
		}
	}

	/// Store a result, evicting the least-recently-used entry first when the
	/// cache is at capacity and the key is new.
	pub fn put(&self, key: CacheKey, value: Value) {
		let bytes = value.to_string().len();
		let mut inner = self.inner.lock();

		if !inner.entries.contains_key(&key.fingerprint)
			&& inner.entries.len() >= self.spec.max_entries
		{
			if let Some(victim) = inner
				.entries
				.iter()
				.min_by_key(|(_, entry)| entry.last_access)
				.map(|(k, _)| k.clone())
			{
				inner.remove(&victim);
				self.evictions.fetch_add(1, Ordering::Relaxed);
			}
		}

		let stamp = inner.touch();
		if let Some(old) = inner.entries.insert(
			key.fingerprint.clone(),
			Entry {
				backend: key.backend,
				operation: key.operation,
				value,
				bytes,
				stored_at: Instant::now(),
				last_access: stamp,
			},
		) {
			inner.total_bytes -= old.bytes;
		}
		inner.total_bytes += bytes;
	}

	/// Drop every entry belonging to a backend (used when it is disabled or
	/// deregistered). Returns how many entries were removed.
	pub fn invalidate_backend(&self, backend: &str) -> usize {
		self.retain_and_count(|entry| entry.backend != backend)
	}

	/// Drop every entry for one operation on one backend.
	pub fn invalidate_operation(&self, backend: &str, operation: &str) -> usize {
		self.retain_and_count(|entry| !(entry.backend == backend && entry.operation == operation))
	}

	/// Global clear. Returns how many entries were removed.
	pub fn clear(&self) -> usize {
		let mut inner = self.inner.lock();
		let removed = inner.entries.len();
		inner.entries.clear();
		inner.total_bytes = 0;
		removed
	}

	/// Remove expired entries eagerly. Returns how many were removed.
	pub fn sweep(&self) -> usize {
		let ttl = self.spec.ttl();
		self.retain_and_count(|entry| entry.stored_at.elapsed() < ttl)
	}

	pub fn stats(&self) -> CacheStats {
		let inner = self.inner.lock();
		CacheStats {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			size: inner.entries.len(),
			bytes: inner.total_bytes,
			evictions: self.evictions.load(Ordering::Relaxed),
		}
	}

	fn retain_and_count(&self, keep: impl Fn(&Entry) -> bool) -> usize {
		let mut inner = self.inner.lock();
		let before = inner.entries.len();
		let mut freed = 0;
		inner.entries.retain(|_, entry| {
			let kept = keep(entry);
			if !kept {
				freed += entry.bytes;
			}
			kept
		});
		inner.total_bytes -= freed;
		before - inner.entries.len()
	}

	/// Spawn the periodic expiry sweep for this cache.
	pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		let interval = self.spec.sweep_interval();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let removed = self.sweep();
				if removed > 0 {
					debug!(target: "cache", removed, "swept expired entries");
				}
			}
		})
	}
}
