// Permission resolution engine.
//
// Resolution combines three layers, most global first: system policy
// (denylist + admin-only patterns), per-identity overrides, and role
// defaults. The first matching rule wins; later layers can never re-allow
// something an earlier layer denied. Both layers match operation names
// through the one matcher in `crate::pattern`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pattern;

/// A verified caller, as handed in by the (external) authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
	pub name: String,
	pub role: String,
}

impl CallerIdentity {
	pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			role: role.into(),
		}
	}
}

/// Role-level tool restriction for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ToolRestriction {
	/// Unrestricted.
	All,
	/// Only operations matching one of the patterns.
	Allow { patterns: Vec<String> },
	/// Everything except operations matching one of the patterns.
	Deny { patterns: Vec<String> },
	/// Fully blocked.
	None,
}

/// Per-identity override for one backend. `Custom` replaces the role
/// default entirely for that backend; its deny list layers on top of its
/// allow list and always wins within the override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ToolOverride {
	/// Use the role default.
	Inherit,
	/// Unrestricted for this backend.
	All,
	/// Fully blocked for this backend.
	None,
	/// Explicit pattern lists. An empty allow list means allow-all, before
	/// deny exceptions are applied.
	Custom {
		#[serde(default)]
		allow: Vec<String>,
		#[serde(default)]
		deny: Vec<String>,
	},
}

/// A role's defaults: which backends it may reach at all, and the tool
/// restriction per backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePolicy {
	/// Reachable backends. The single entry `*` grants reach to every
	/// backend.
	#[serde(default)]
	pub backends: HashSet<String>,
	#[serde(default)]
	pub restrictions: HashMap<String, ToolRestriction>,
	/// Whether the role has admin equivalence for admin-only operations.
	#[serde(default)]
	pub admin: bool,
}

/// System-wide policy applied before any role or override is consulted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
	/// Operations denied to every role except the exempt ones.
	#[serde(default)]
	pub deny_patterns: Vec<String>,
	#[serde(default)]
	pub deny_exempt_roles: HashSet<String>,
	/// Operations restricted to roles with admin equivalence.
	#[serde(default)]
	pub admin_only_patterns: Vec<String>,
}

/// Full policy document: the unit the engine snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
	#[serde(default)]
	pub system: SystemPolicy,
	/// Role name -> role policy.
	#[serde(default)]
	pub roles: HashMap<String, RolePolicy>,
	/// Identity name -> backend name -> override.
	#[serde(default)]
	pub overrides: HashMap<String, HashMap<String, ToolOverride>>,
}

/// Outcome of a resolution, with the reason for logging and the caller's
/// error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
	pub allowed: bool,
	pub reason: String,
}

impl Decision {
	fn allow(reason: impl Into<String>) -> Self {
		Self {
			allowed: true,
			reason: reason.into(),
		}
	}

	fn deny(reason: impl Into<String>) -> Self {
		Self {
			allowed: false,
			reason: reason.into(),
		}
	}
}

/// Deterministic, side-effect-free permission checks over an atomically
/// swappable policy snapshot. Reads never block writers and vice versa.
pub struct PermissionEngine {
	snapshot: ArcSwap<PolicyDocument>,
	/// Serializes read-modify-write cycles on the snapshot.
	writer: Mutex<()>,
}

impl PermissionEngine {
	pub fn new(document: PolicyDocument) -> Self {
		Self {
			snapshot: ArcSwap::from_pointee(document),
			writer: Mutex::new(()),
		}
	}

	/// Replace the whole policy document.
	pub fn replace(&self, document: PolicyDocument) {
		let _guard = self.writer.lock();
		self.snapshot.store(Arc::new(document));
	}

	pub fn document(&self) -> Arc<PolicyDocument> {
		self.snapshot.load_full()
	}

	pub fn is_allowed(
		&self,
		identity: &CallerIdentity,
		backend: &str,
		operation: &str,
		resource: Option<&str>,
	) -> bool {
		self.resolve(identity, backend, operation, resource).allowed
	}

	/// Resolve a permission check. Resolution order, first match wins:
	///
	/// 1. backend not in the role's reachable set -> deny
	/// 2. system denylist (unless the role is exempt) -> deny
	/// 3. admin-only operation without admin equivalence -> deny
	/// 4. per-identity `custom` override -> its allow list, then its deny
	///    exceptions on top
	/// 5. per-identity `all` -> allow, `none` -> deny
	/// 6. role restriction for the backend (`all`/`allow`/`deny`/`none`)
	/// 7. no restriction at all -> allow
	pub fn resolve(
		&self,
		identity: &CallerIdentity,
		backend: &str,
		operation: &str,
		resource: Option<&str>,
	) -> Decision {
		let doc = self.snapshot.load();
		let decision = resolve_in(&doc, identity, backend, operation, resource);
		debug!(
			target: "policy",
			identity = %identity.name,
			role = %identity.role,
			backend,
			operation,
			allowed = decision.allowed,
			reason = %decision.reason,
			"permission resolved"
		);
		decision
	}

	/// Install or replace a per-identity override for one backend.
	pub fn set_override(&self, identity: &str, backend: &str, over: ToolOverride) {
		let _guard = self.writer.lock();
		let mut doc = PolicyDocument::clone(&self.snapshot.load());
		doc
			.overrides
			.entry(identity.to_string())
			.or_default()
			.insert(backend.to_string(), over);
		self.snapshot.store(Arc::new(doc));
	}

	/// Remove a per-identity override. Returns true if one existed.
	pub fn remove_override(&self, identity: &str, backend: &str) -> bool {
		let _guard = self.writer.lock();
		let mut doc = PolicyDocument::clone(&self.snapshot.load());
		let removed = doc
			.overrides
			.get_mut(identity)
			.map(|per_backend| per_backend.remove(backend).is_some())
			.unwrap_or(false);
		if removed {
			if let Some(per_backend) = doc.overrides.get(identity) {
				if per_backend.is_empty() {
					doc.overrides.remove(identity);
				}
			}
			self.snapshot.store(Arc::new(doc));
		}
		removed
	}

	/// List the overrides configured for an identity.
	pub fn list_overrides(&self, identity: &str) -> HashMap<String, ToolOverride> {
		self
			.snapshot
			.load()
			.overrides
			.get(identity)
			.cloned()
			.unwrap_or_default()
	}
}

fn resolve_in(
	doc: &PolicyDocument,
	identity: &CallerIdentity,
	backend: &str,
	operation: &str,
	resource: Option<&str>,
) -> Decision {
	// Step 1: role reachability.
	let Some(role) = doc.roles.get(&identity.role) else {
		return Decision::deny(format!("unknown role '{}'", identity.role));
	};
	if !role.backends.contains(backend) && !role.backends.contains("*") {
		return Decision::deny(format!(
			"backend '{}' not reachable by role '{}'",
			backend, identity.role
		));
	}

	// Step 2: system denylist. A denylisted resource blocks as well.
	if !doc.system.deny_exempt_roles.contains(&identity.role) {
		if pattern::matches_any(&doc.system.deny_patterns, operation) {
			return Decision::deny(format!("operation '{}' is system-denied", operation));
		}
		if let Some(resource) = resource {
			if pattern::matches_any(&doc.system.deny_patterns, resource) {
				return Decision::deny(format!("resource '{}' is system-denied", resource));
			}
		}
	}

	// Step 3: admin-only operations.
	if pattern::matches_any(&doc.system.admin_only_patterns, operation) && !role.admin {
		return Decision::deny(format!("operation '{}' requires admin equivalence", operation));
	}

	// Steps 4-5: per-identity override replaces the role default for this
	// backend, except `inherit`.
	if let Some(over) = doc
		.overrides
		.get(&identity.name)
		.and_then(|per_backend| per_backend.get(backend))
	{
		match over {
			ToolOverride::Inherit => {},
			ToolOverride::All => return Decision::allow("override mode all"),
			ToolOverride::None => return Decision::deny("override mode none"),
			ToolOverride::Custom { allow, deny } => {
				// Deny exceptions always win over allow patterns here.
				if pattern::matches_any(deny, operation) {
					return Decision::deny(format!("override denies operation '{}'", operation));
				}
				return if allow.is_empty() || pattern::matches_any(allow, operation) {
					Decision::allow("override allows operation")
				} else {
					Decision::deny(format!(
						"operation '{}' not in override allow list",
						operation
					))
				};
			},
		}
	}

	// Step 6: role restriction for the backend.
	match role.restrictions.get(backend) {
		Some(ToolRestriction::All) => Decision::allow("role restriction all"),
		Some(ToolRestriction::Allow { patterns }) => {
			if pattern::matches_any(patterns, operation) {
				Decision::allow("role allow list matches")
			} else {
				Decision::deny(format!("operation '{}' not in role allow list", operation))
			}
		},
		Some(ToolRestriction::Deny { patterns }) => {
			if pattern::matches_any(patterns, operation) {
				Decision::deny(format!("operation '{}' in role deny list", operation))
			} else {
				Decision::allow("role deny list does not match")
			}
		},
		Some(ToolRestriction::None) => Decision::deny("role blocks this backend's tools"),
		// Step 7: no restriction descriptor at the leaf.
		None => Decision::allow("no restriction configured"),
	}
}
