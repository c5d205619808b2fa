//! Crate-wide error taxonomy and its mapping onto HTTP responses.
//!
//! One `thiserror` enum implementing `IntoResponse`: client-caused
//! conditions map to 4xx with a descriptive body, upstream/internal
//! failures map to 5xx with a static body so upstream detail never reaches
//! the caller (the detail still goes to `tracing::error!`).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("unknown destination")]
	UnknownDestination,
	#[error("unknown session")]
	UnknownSession,
	#[error("invalid session id")]
	InvalidSessionId,
	#[error("destination does not support this transport")]
	WrongKind,
	#[error("endpoint is deprecated for this destination")]
	Deprecated,
	#[error("malformed request")]
	Malformed,
	#[error("missing or unsupported accept header")]
	BadAccept,
	#[error("missing or unsupported content-type header")]
	BadContentType,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("registry error: {0}")]
	Config(#[from] anyhow::Error),
	#[error(transparent)]
	Client(#[from] ClientError),
	#[error("upstream request failed")]
	Upstream(#[source] anyhow::Error),
	#[error("stdio bridge unavailable")]
	Bridge,
	#[error("request blocked")]
	ScannerBlock(Value),
	#[error("upstream response timed out")]
	Timeout,
	#[error("destination at capacity")]
	Capacity,
	#[error("internal error")]
	Internal(#[source] anyhow::Error),
}

impl ProxyError {
	fn status(&self) -> StatusCode {
		match self {
			ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Client(ClientError::UnknownDestination) => StatusCode::NOT_FOUND,
			ProxyError::Client(ClientError::UnknownSession) => StatusCode::NOT_FOUND,
			ProxyError::Client(ClientError::InvalidSessionId) => StatusCode::BAD_REQUEST,
			ProxyError::Client(ClientError::WrongKind) => StatusCode::BAD_REQUEST,
			ProxyError::Client(ClientError::Malformed) => StatusCode::BAD_REQUEST,
			ProxyError::Client(ClientError::BadAccept) => StatusCode::BAD_REQUEST,
			ProxyError::Client(ClientError::BadContentType) => StatusCode::BAD_REQUEST,
			ProxyError::Client(ClientError::Deprecated) => StatusCode::GONE,
			ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Bridge => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::ScannerBlock(_) => StatusCode::OK,
			ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::Capacity => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ProxyError {
	fn into_response(self) -> Response {
		let status = self.status();
		match &self {
			ProxyError::Upstream(detail) => {
				error!(error=%detail, "upstream request failed");
			},
			ProxyError::Internal(detail) => {
				error!(error=%detail, "internal error");
			},
			ProxyError::Config(detail) => {
				error!(error=%detail, "registry error");
			},
			_ => {},
		}
		let body = match self {
			ProxyError::ScannerBlock(v) => v,
			other => json!({ "error": other.to_string() }),
		};
		(status, Json(body)).into_response()
	}
}

/// Builds a JSON-RPC 2.0 error envelope carrying the caller's original id,
/// used both for scanner blocks (§4.7) and for synthesizing responses the
/// bridge itself must fabricate (e.g. a pending call that never resolves).
pub fn jsonrpc_error(id: Value, code: i64, message: &str) -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": id,
		"error": { "code": code, "message": message },
	})
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn unknown_destination_is_404() {
		let err = ProxyError::Client(ClientError::UnknownDestination);
		assert_matches!(err.status(), StatusCode::NOT_FOUND);
	}

	#[test]
	fn deprecated_legacy_route_is_410() {
		let err = ProxyError::Client(ClientError::Deprecated);
		assert_matches!(err.status(), StatusCode::GONE);
	}

	#[test]
	fn scanner_block_carries_its_own_body_with_200_status() {
		let err = ProxyError::ScannerBlock(json!({"jsonrpc": "2.0"}));
		assert_matches!(err.status(), StatusCode::OK);
	}

	#[test]
	fn bridge_unavailable_is_503() {
		assert_matches!(ProxyError::Bridge.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_matches!(ProxyError::Capacity.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
