//! JSON-RPC 2.0 envelope helpers shared by every transport handler.
//!
//! This crate never interprets MCP method semantics, only routes and audits
//! them, so every envelope is handled as a loosely-typed `serde_json::Value`
//! rather than a fixed request/response schema.

use axum::http::HeaderName;
use serde_json::Value;

use crate::prelude::*;

/// `Mcp-Session-Id`, used as a response header on session creation and a
/// request header on every subsequent Streamable HTTP call (§6.3).
pub static SESSION_ID_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// A JSON-RPC id is a string, a number, or absent/null (notification).
pub fn extract_method(body: &Value) -> Option<String> {
	body.get("method").and_then(Value::as_str).map(str::to_string)
}

pub fn extract_id(body: &Value) -> Option<Value> {
	match body.get("id") {
		None | Some(Value::Null) => None,
		Some(v) => Some(v.clone()),
	}
}

/// A JSON-RPC object with no `id` field (or a `null` one) is a notification:
/// fire-and-forget, no response is ever written back (§4.6 step 3).
pub fn is_notification(body: &Value) -> bool {
	extract_id(body).is_none()
}

/// Batch requests (JSON arrays) are out of scope (§4.6 step 5).
pub fn is_batch(body: &Value) -> bool {
	body.is_array()
}

/// Replaces the `id` field in place, returning the value that was there
/// before. Used by the stdio bridge to swap the client's id for an internal
/// monotone one before writing to the child's stdin, and back again when
/// the response line comes back (§4.6 "Internal ID rewriting").
pub fn rewrite_id(body: &mut Value, new_id: Value) -> Option<Value> {
	let Value::Object(map) = body else {
		return None;
	};
	map.insert("id".to_string(), new_id)
}

/// Validates a `Mcp-Session-Id` against the UUIDv4 format required by
/// §4.6 step 2 ("validate against UUIDv4 regex").
pub fn is_valid_mcp_session_id(id: &str) -> bool {
	uuid::Uuid::parse_str(id)
		.map(|u| u.get_version() == Some(uuid::Version::Random))
		.unwrap_or(false)
}

pub fn new_mcp_session_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

/// Builds the synthesized JSON-RPC error envelope a scanner block or a
/// bridge-side failure must fabricate, carrying the caller's original id
/// unchanged (§4.7, §7 "Exception text is never placed in client-visible
/// bodies").
pub fn error_envelope(id: Option<Value>, code: i64, message: &str) -> Value {
	serde_json::json!({
		"jsonrpc": "2.0",
		"id": id.unwrap_or(Value::Null),
		"error": { "code": code, "message": message },
	})
}

/// Code used when a request is blocked before reaching the server.
pub const SCANNER_BLOCK_REQUEST_CODE: i64 = -32600;
/// Code used when a response is blocked before reaching the client.
pub const SCANNER_BLOCK_RESPONSE_CODE: i64 = -32603;

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn detects_notifications() {
		assert!(is_notification(&json!({"jsonrpc": "2.0", "method": "progress"})));
		assert!(!is_notification(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})));
		assert!(is_notification(&json!({"jsonrpc": "2.0", "id": null, "method": "ping"})));
	}

	#[test]
	fn rewrites_id_and_returns_old() {
		let mut body = json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"});
		let old = rewrite_id(&mut body, json!(1));
		assert_eq!(old, Some(json!("init")));
		assert_eq!(body["id"], json!(1));
	}

	#[test]
	fn validates_uuidv4_only() {
		assert!(is_valid_mcp_session_id(&new_mcp_session_id()));
		assert!(!is_valid_mcp_session_id("not-a-uuid"));
		// UUID v1 (time-based) should not pass a v4-only check.
		assert!(!is_valid_mcp_session_id("6ba7b810-9dad-11d1-80b4-00c04fd430c8"));
	}
}
