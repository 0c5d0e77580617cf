// Gateway error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the gateway call path and admin surface.
///
/// External/network failures are ordinary typed outcomes, never panics.
/// `Internal` is reserved for unrecoverable state corruption (a record
/// vanishing mid-operation due to a bug) and should alert, not be handled.
#[derive(Error, Debug)]
pub enum GatewayError {
	#[error("permission denied: {reason}")]
	PermissionDenied { reason: String },

	#[error("circuit open for backend '{backend}'")]
	CircuitOpen {
		backend: String,
		/// Hint for when the breaker will admit a trial call, if known.
		retry_after: Option<Duration>,
	},

	#[error("backend '{backend}' timed out after {timeout:?}")]
	BackendTimeout { backend: String, timeout: Duration },

	#[error("backend '{backend}' unreachable: {reason}")]
	BackendUnreachable { backend: String, reason: String },

	#[error("backend '{backend}' returned an error: {message}")]
	BackendError { backend: String, message: String },

	#[error("unknown backend '{0}'")]
	BackendNotFound(String),

	#[error("unknown operation '{operation}' on backend '{backend}'")]
	OperationNotFound { backend: String, operation: String },

	#[error("duplicate backend name '{0}'")]
	DuplicateBackend(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	pub fn denied(reason: impl Into<String>) -> Self {
		Self::PermissionDenied {
			reason: reason.into(),
		}
	}

	pub fn unreachable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::BackendUnreachable {
			backend: backend.into(),
			reason: reason.into(),
		}
	}

	pub fn backend_error(backend: impl Into<String>, message: impl Into<String>) -> Self {
		Self::BackendError {
			backend: backend.into(),
			message: message.into(),
		}
	}

	pub fn operation_not_found(backend: impl Into<String>, operation: impl Into<String>) -> Self {
		Self::OperationNotFound {
			backend: backend.into(),
			operation: operation.into(),
		}
	}

	/// Whether this outcome counts as a breaker failure for the backend.
	pub fn is_invocation_failure(&self) -> bool {
		matches!(
			self,
			Self::BackendTimeout { .. } | Self::BackendUnreachable { .. } | Self::BackendError { .. }
		)
	}
}
