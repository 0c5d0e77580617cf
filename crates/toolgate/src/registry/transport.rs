// Outbound transport to a backend.
//
// The core treats each backend as a black box reachable through this trait:
// invoke an operation, or list the operations it exposes. The HTTP
// implementation is the production default; tests plug in scripted mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Distinguishable failure modes of one invocation attempt. Each maps onto
/// the caller-facing taxonomy and counts as a breaker failure.
#[derive(Error, Debug)]
pub enum TransportError {
	#[error("request timed out")]
	Timeout,

	#[error("backend unreachable: {0}")]
	Unreachable(String),

	#[error("backend failure: {0}")]
	Failed(String),
}

/// One operation in a backend's capability catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	/// Declared input shape, passed through opaquely.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input_schema: Option<Value>,
}

impl ToolSpec {
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			description: None,
			input_schema: None,
		}
	}
}

/// Request/response access to one backend.
#[async_trait]
pub trait BackendTransport: Send + Sync + 'static {
	/// Invoke a single operation with its arguments.
	async fn invoke(&self, operation: &str, arguments: &Value) -> Result<Value, TransportError>;

	/// List the backend's operations. Doubles as the lightweight health
	/// probe: a backend that can answer this is considered healthy.
	async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError>;
}

#[derive(Serialize)]
struct InvokeRequest<'a> {
	operation: &'a str,
	arguments: &'a Value,
}

/// HTTP transport: `POST {endpoint}/invoke` for operations,
/// `GET {endpoint}/tools` for the catalog.
pub struct HttpTransport {
	client: reqwest::Client,
	endpoint: String,
}

impl HttpTransport {
	pub fn new(endpoint: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			endpoint: endpoint.into().trim_end_matches('/').to_string(),
		}
	}

	fn classify(err: reqwest::Error) -> TransportError {
		if err.is_timeout() {
			TransportError::Timeout
		} else if err.is_connect() {
			TransportError::Unreachable(err.to_string())
		} else {
			TransportError::Failed(err.to_string())
		}
	}
}

#[async_trait]
impl BackendTransport for HttpTransport {
	async fn invoke(&self, operation: &str, arguments: &Value) -> Result<Value, TransportError> {
		let url = format!("{}/invoke", self.endpoint);
		debug!(target: "transport", %url, operation, "invoking backend operation");

		let response = self
			.client
			.post(&url)
			.json(&InvokeRequest {
				operation,
				arguments,
			})
			.send()
			.await
			.map_err(Self::classify)?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(TransportError::Failed(format!(
				"status {}: {}",
				status,
				body.chars().take(200).collect::<String>()
			)));
		}

		response.json().await.map_err(Self::classify)
	}

	async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
		let url = format!("{}/tools", self.endpoint);
		debug!(target: "transport", %url, "listing backend tools");

		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(Self::classify)?;

		let status = response.status();
		if !status.is_success() {
			return Err(TransportError::Failed(format!("status {}", status)));
		}

		response.json().await.map_err(Self::classify)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_endpoint_trailing_slash_stripped() {
		let transport = HttpTransport::new("http://tools.internal:9000/");
		assert_eq!(transport.endpoint, "http://tools.internal:9000");
	}

	#[test]
	fn test_tool_spec_deserializes_minimal() {
		let spec: ToolSpec = serde_json::from_str(r#"{"name": "get_health"}"#).unwrap();
		assert_eq!(spec.name, "get_health");
		assert!(spec.description.is_none());
		assert!(spec.input_schema.is_none());
	}
}
