//! Audit Log Sink (§4.2): one newline-delimited JSON record per request,
//! with size-bounded body capture. Writes happen on a dedicated OS thread
//! so a slow disk never steals time from the async event loop, kept
//! distinct from ambient `tracing` calls used for operational logging. A
//! plain `std::sync::mpsc` + `std::thread::spawn` writer keeps the record
//! log buffered off the hot path while staying synchronous on the writer
//! side.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::prelude::*;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
	pub timestamp: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_ip: Option<String>,
	pub destination: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mcp_method: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rpc_id: Option<Value>,
	pub status_code: u16,
	pub latency_ms: u128,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_body: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_body: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub truncated: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub decode_error: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stderr_line: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detection_action: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detection_engine: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detection_detail: Option<String>,
}

impl AuditRecord {
	pub fn new(destination: impl Into<String>) -> AuditRecord {
		AuditRecord {
			timestamp: Utc::now().to_rfc3339(),
			user: None,
			source_ip: None,
			destination: destination.into(),
			mcp_method: None,
			rpc_id: None,
			status_code: 0,
			latency_ms: 0,
			error: None,
			request_body: None,
			response_body: None,
			truncated: None,
			decode_error: None,
			stderr_line: None,
			detection_action: None,
			detection_engine: None,
			detection_detail: None,
		}
	}
}

/// Outcome of applying the body capture policy (§4.2) to one raw body.
pub struct CapturedBody {
	pub value: Option<Value>,
	pub truncated: bool,
	pub decode_error: bool,
}

/// Applies the body capture policy in the order §4.2 specifies it:
/// disabled → omit; over size → omit + truncated; invalid UTF-8 → null +
/// decode_error; not JSON → null; else the raw text.
pub fn capture_body(raw: &[u8], enabled: bool, max_bytes: usize) -> CapturedBody {
	if !enabled {
		return CapturedBody { value: None, truncated: false, decode_error: false };
	}
	if raw.len() > max_bytes {
		return CapturedBody { value: None, truncated: true, decode_error: false };
	}
	let Ok(text) = std::str::from_utf8(raw) else {
		return CapturedBody { value: Some(Value::Null), truncated: false, decode_error: true };
	};
	if serde_json::from_str::<Value>(text).is_err() {
		return CapturedBody { value: Some(Value::Null), truncated: false, decode_error: false };
	}
	CapturedBody { value: Some(Value::String(text.to_string())), truncated: false, decode_error: false }
}

/// Merges the request-side and response-side capture outcomes into the
/// record's single `truncated`/`decode_error` flags (true if either body
/// tripped that condition).
pub fn apply_capture(record: &mut AuditRecord, request: CapturedBody, response: CapturedBody) {
	record.request_body = request.value;
	record.response_body = response.value;
	let truncated = request.truncated || response.truncated;
	let decode_error = request.decode_error || response.decode_error;
	if truncated {
		record.truncated = Some(true);
	}
	if decode_error {
		record.decode_error = Some(true);
	}
}

enum SinkMessage {
	Record(String),
	Shutdown,
}

/// The single writer abstraction from §4.2. `log_request` never blocks on
/// disk I/O; it hands a pre-serialized line to a dedicated writer thread
/// over an unbounded channel. A send or serialize failure is downgraded to
/// a `tracing::warn!` rather than affecting the caller's request.
pub struct AuditSink {
	tx: std_mpsc::Sender<SinkMessage>,
	writer: Option<std::thread::JoinHandle<()>>,
}

impl AuditSink {
	pub fn new(log_file: Option<PathBuf>) -> anyhow::Result<AuditSink> {
		let mut file = match &log_file {
			Some(path) => Some(
				OpenOptions::new()
					.create(true)
					.append(true)
					.open(path)
					.map_err(|e| anyhow::anyhow!("opening audit log file {path:?}: {e}"))?,
			),
			None => None,
		};

		let (tx, rx) = std_mpsc::channel::<SinkMessage>();
		let writer = std::thread::Builder::new()
			.name("audit-sink-writer".to_string())
			.spawn(move || {
				for msg in rx {
					let line = match msg {
						SinkMessage::Record(line) => line,
						SinkMessage::Shutdown => break,
					};
					let result = match &mut file {
						Some(f) => writeln!(f, "{line}"),
						None => writeln!(std::io::stderr(), "{line}"),
					};
					if let Err(e) = result {
						tracing::warn!(error = %e, "audit sink write failed");
					}
				}
			})
			.map_err(|e| anyhow::anyhow!("spawning audit sink writer thread: {e}"))?;

		Ok(AuditSink { tx, writer: Some(writer) })
	}

	pub fn log_request(&self, record: AuditRecord) {
		match serde_json::to_string(&record) {
			Ok(line) => {
				if self.tx.send(SinkMessage::Record(line)).is_err() {
					warn!("audit sink writer thread is gone, dropping record");
				}
			},
			Err(e) => warn!(error = %e, "failed to serialize audit record"),
		}
	}

	pub fn shutdown(&mut self) {
		let _ = self.tx.send(SinkMessage::Shutdown);
		if let Some(handle) = self.writer.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for AuditSink {
	fn drop(&mut self) {
		self.shutdown();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disabled_capture_omits_field() {
		let c = capture_body(b"{\"a\":1}", false, 1024);
		assert!(c.value.is_none());
		assert!(!c.truncated);
	}

	#[test]
	fn oversized_capture_is_truncated() {
		let c = capture_body(&vec![b'a'; 100], true, 10);
		assert!(c.value.is_none());
		assert!(c.truncated);
	}

	#[test]
	fn invalid_utf8_sets_decode_error() {
		let c = capture_body(&[0xff, 0xfe], true, 1024);
		assert_eq!(c.value, Some(Value::Null));
		assert!(c.decode_error);
	}

	#[test]
	fn non_json_text_is_null() {
		let c = capture_body(b"not json", true, 1024);
		assert_eq!(c.value, Some(Value::Null));
		assert!(!c.decode_error);
	}

	#[test]
	fn valid_json_is_captured_as_text() {
		let c = capture_body(b"{\"jsonrpc\":\"2.0\"}", true, 1024);
		assert_eq!(c.value, Some(Value::String("{\"jsonrpc\":\"2.0\"}".to_string())));
	}

	#[test]
	fn writes_one_line_per_record_to_file() {
		let dir = std::env::temp_dir().join(format!("mcp-relay-audit-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("audit.ndjson");
		{
			let mut sink = AuditSink::new(Some(path.clone())).unwrap();
			sink.log_request(AuditRecord::new("dst1"));
			sink.log_request(AuditRecord::new("dst2"));
			sink.shutdown();
		}
		let contents = std::fs::read_to_string(&path).unwrap();
		assert_eq!(contents.lines().count(), 2);
		std::fs::remove_dir_all(&dir).ok();
	}
}
