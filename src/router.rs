//! Core assembly and the HTTP surface (§6.1).
//!
//! `Core` is the single value assembled at startup and threaded through
//! every handler as `axum::extract::State`, replacing the "global mutable
//! state" the original design implied (§9): the registry, session map,
//! upstream client, audit sink, scanner hook, and per-destination bridges
//! all live here, with no process-wide singletons.

use std::collections::HashMap;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::audit::{apply_capture, capture_body, AuditRecord, AuditSink};
use crate::bridge::{CallError, PendingOutcome, SubprocessBridge};
use crate::client::{filter_request_headers, filter_response_headers, UpstreamClient};
use crate::config::Config;
use crate::error::{ClientError, ProxyError};
use crate::mcp;
use crate::prelude::*;
use crate::registry::{DestinationKind, Registry};
use crate::scanner::{Direction, ScanAction, ScannerHook};
use crate::session::{is_valid_session_id, mint_session_id, LegacySession, LegacySessionMap};
use crate::sse::{forward_sse, LineOutcome, SseLineKind};

pub struct Core {
	pub registry: Registry,
	pub sessions: LegacySessionMap,
	pub client: UpstreamClient,
	pub sink: AuditSink,
	pub scanner: Arc<dyn ScannerHook>,
	pub bridges: HashMap<String, Arc<SubprocessBridge>>,
	/// `MaxConnPerDestination` semaphores for non-stdio destinations
	/// (§4.5). stdio destinations enforce the same invariant inside their
	/// `SubprocessBridge` instead, since there the cap is on live sessions
	/// rather than in-flight requests.
	streamable_semaphores: HashMap<String, Arc<Semaphore>>,
	pub config: Config,
}

impl Core {
	pub fn new(registry: Registry, sink: AuditSink, scanner: Arc<dyn ScannerHook>, config: Config) -> anyhow::Result<Arc<Core>> {
		let client = UpstreamClient::new()?;
		let sessions = LegacySessionMap::new(config.max_sessions);
		let mut bridges = HashMap::new();
		let mut streamable_semaphores = HashMap::new();
		for dest in registry.iter() {
			match &dest.kind {
				DestinationKind::Stdio { .. } => {
					let bridge = SubprocessBridge::new(dest, config.max_stdio_connections, config.notification_queue_capacity, config.stdio_restart_budget);
					bridge.start();
					bridges.insert(dest.name.clone(), bridge);
				},
				DestinationKind::StreamableHttp { .. } => {
					streamable_semaphores.insert(dest.name.clone(), Arc::new(Semaphore::new(config.max_stdio_connections)));
				},
				DestinationKind::Sse { .. } => {},
			}
		}
		Ok(Arc::new(Core { registry, sessions, client, sink, scanner, bridges, streamable_semaphores, config }))
	}

	pub fn shutdown(&self) {
		for bridge in self.bridges.values() {
			bridge.shutdown();
		}
	}
}

pub fn build_router(core: Arc<Core>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/{dest}/sse", get(legacy_sse_get))
		.route("/{dest}/message", post(legacy_message_post))
		.route(
			"/{dest}/mcp",
			get(mcp_get).post(mcp_post).delete(mcp_delete),
		)
		.with_state(core)
}

pub fn build_admin_router(core: Arc<Core>) -> Router {
	Router::new()
		.route("/admin/reload-patterns", post(admin_reload_patterns))
		.with_state(core)
}

async fn health() -> impl IntoResponse {
	(StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn admin_reload_patterns(State(core): State<Arc<Core>>) -> Result<impl IntoResponse, ProxyError> {
	let loaded = core.scanner.reload_patterns().await.map_err(ProxyError::Internal)?;
	Ok(Json(json!({ "loaded": loaded })))
}

fn source_ip(addr: Option<ConnectInfo<std::net::SocketAddr>>) -> Option<String> {
	addr.map(|ConnectInfo(a)| a.ip().to_string())
}

fn static_upstream_error() -> Response {
	(StatusCode::BAD_GATEWAY, Json(json!({ "error": crate::client::STATIC_UPSTREAM_ERROR_BODY }))).into_response()
}

/// Runs the scanner hook for one direction of one body, if the destination
/// has it turned on (§4.7). Returns the (possibly redacted) body to forward
/// on `pass`/`monitor`/`redact`, or a pre-built synthesized JSON-RPC error
/// response on `block`.
async fn run_scanner(
	core: &Arc<Core>,
	destination: &crate::registry::Destination,
	direction: Direction,
	id: Option<Value>,
	body: Value,
	record: &mut AuditRecord,
) -> Result<Value, Response> {
	if destination.scanner.is_off() {
		return Ok(body);
	}
	let outcome = core.scanner.scan(body, &destination.name, direction, &destination.scanner).await;
	record.detection_engine = outcome.engine.map(str::to_string);
	record.detection_detail = outcome.detail.clone();
	match outcome.action {
		ScanAction::Pass => Ok(outcome.body),
		ScanAction::Monitor => {
			record.detection_action = Some("monitor".to_string());
			Ok(outcome.body)
		},
		ScanAction::Redact => {
			record.detection_action = Some("redact".to_string());
			Ok(outcome.body)
		},
		ScanAction::Block => {
			record.detection_action = Some("block".to_string());
			let code = match direction {
				Direction::Request => mcp::SCANNER_BLOCK_REQUEST_CODE,
				Direction::Response => mcp::SCANNER_BLOCK_RESPONSE_CODE,
			};
			let envelope = mcp::error_envelope(id, code, "request blocked by scanner hook");
			Err((StatusCode::OK, Json(envelope)).into_response())
		},
	}
}

fn deprecated_response() -> Response {
	(
		StatusCode::GONE,
		Json(json!({ "error": "this endpoint is deprecated for stdio destinations; use /mcp" })),
	)
		.into_response()
}

// ---------------------------------------------------------------------
// Legacy SSE transport (§4.3, §4.4)
// ---------------------------------------------------------------------

async fn legacy_sse_get(
	State(core): State<Arc<Core>>,
	Path(dest): Path<String>,
	connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
	headers: HeaderMap,
) -> Response {
	let started = std::time::Instant::now();
	let mut record = AuditRecord::new(&dest);
	record.source_ip = source_ip(connect_info);

	let destination = match core.registry.lookup(&dest) {
		Some(d) => d,
		None => {
			record.status_code = 404;
			record.error = Some("unknown destination".into());
			core.sink.log_request(record);
			return ProxyError::Client(ClientError::UnknownDestination).into_response();
		},
	};
	let upstream_url = match &destination.kind {
		DestinationKind::Sse { upstream_url } => upstream_url.clone(),
		DestinationKind::Stdio { .. } => {
			record.status_code = 410;
			core.sink.log_request(record);
			return deprecated_response();
		},
		DestinationKind::StreamableHttp { .. } => {
			record.status_code = 400;
			record.error = Some("destination does not support the legacy SSE transport".into());
			core.sink.log_request(record);
			return ProxyError::Client(ClientError::WrongKind).into_response();
		},
	};

	let filtered = filter_request_headers(&headers);
	let resp = match core.client.send_with_retry(Method::GET, upstream_url.clone(), filtered, None).await {
		Ok(resp) if resp.status().is_success() => resp,
		Ok(resp) => {
			record.status_code = 502;
			record.error = Some(format!("upstream returned {}", resp.status()));
			core.sink.log_request(record);
			return static_upstream_error();
		},
		Err(e) => {
			error!(destination = %dest, error = %e, "legacy sse upstream connect failed");
			record.status_code = 502;
			record.error = Some(e.to_string());
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};

	record.status_code = 200;
	record.latency_ms = started.elapsed().as_millis();
	core.sink.log_request(record);

	let response_headers = filter_response_headers(resp.headers());
	let byte_stream = resp.bytes_stream();

	let core_for_stream = core.clone();
	let dest_name = dest.clone();
	let minted_session: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
	let minted_for_closure = minted_session.clone();
	let mut current_event: Option<String> = None;
	let body_stream = forward_sse(byte_stream, move |kind, value| match kind {
		SseLineKind::Event => {
			current_event = Some(value.to_string());
			LineOutcome::Keep
		},
		SseLineKind::Data if current_event.as_deref() == Some("endpoint") => {
			match rewrite_endpoint_line(value, &upstream_url, &dest_name, &core_for_stream.sessions) {
				Ok((replacement, id)) => {
					current_event = None;
					*minted_for_closure.lock().expect("minted session lock poisoned") = Some(id);
					LineOutcome::Replace(replacement)
				},
				Err(msg) => LineOutcome::Abort(msg),
			}
		},
		_ => LineOutcome::Keep,
	});

	let guarded_stream = SessionCleanupGuard { inner: body_stream, core: core.clone(), minted: minted_session };
	let mut response = Response::new(axum::body::Body::from_stream(guarded_stream));
	*response.headers_mut() = response_headers;
	response
		.headers_mut()
		.insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("text/event-stream"));
	response
}

/// Resolves and validates an `event: endpoint` frame's `data:` URL, mints a
/// fresh proxy session id, stores the mapping, and returns the replacement
/// line value the client should see along with the minted id, so the caller
/// can remove the mapping again on stream teardown (§4.3 "Cleanup").
fn rewrite_endpoint_line(
	value: &str,
	upstream_url: &Url,
	dest: &str,
	sessions: &LegacySessionMap,
) -> Result<(String, String), String> {
	let resolved = if let Ok(abs) = Url::parse(value) {
		let same_origin = abs.scheme() == upstream_url.scheme()
			&& abs.host_str() == upstream_url.host_str()
			&& abs.port_or_known_default() == upstream_url.port_or_known_default();
		if !same_origin {
			return Err(format!("endpoint url {value:?} is not same-origin as upstream"));
		}
		abs
	} else {
		upstream_url.join(value).map_err(|e| format!("invalid endpoint url {value:?}: {e}"))?
	};

	let id = mint_session_id();
	sessions
		.insert(id.clone(), LegacySession { destination: dest.to_string(), upstream_message_url: resolved })
		.map_err(|_| "session map at capacity".to_string())?;
	Ok((format!("/{dest}/message?session_id={id}"), id))
}

/// Wraps the client-facing SSE body stream so the Session Map entry minted
/// for it is removed exactly once the stream stops being polled, whether
/// that's client disconnect, upstream disconnect, or normal completion
/// (§4.3 "Cleanup": "the Session Map entry is removed").
struct SessionCleanupGuard<S> {
	inner: S,
	core: Arc<Core>,
	minted: Arc<std::sync::Mutex<Option<String>>>,
}

impl<S: Stream + Unpin> Stream for SessionCleanupGuard<S> {
	type Item = S::Item;

	fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
		let this = self.get_mut();
		std::pin::Pin::new(&mut this.inner).poll_next(cx)
	}
}

impl<S> Drop for SessionCleanupGuard<S> {
	fn drop(&mut self) {
		if let Some(id) = self.minted.lock().expect("minted session lock poisoned").take() {
			self.core.sessions.remove(&id);
		}
	}
}

/// Wraps a streamed response body together with the `MaxConnPerDestination`
/// permit that admitted it, so the permit — and the capacity slot it
/// represents — is only released once the stream is fully drained or
/// dropped, not when the handler's `async fn` returns after sending headers
/// (§4.5: "The upstream client and its connection are acquired and released
/// over the full request lifetime (including on the streaming path)").
struct PermitGuardStream<S> {
	inner: S,
	_permit: tokio::sync::OwnedSemaphorePermit,
}

impl<S: Stream + Unpin> Stream for PermitGuardStream<S> {
	type Item = S::Item;

	fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
		let this = self.get_mut();
		std::pin::Pin::new(&mut this.inner).poll_next(cx)
	}
}

#[derive(serde::Deserialize)]
struct MessageQuery {
	session_id: String,
}

async fn legacy_message_post(
	State(core): State<Arc<Core>>,
	Path(dest): Path<String>,
	Query(query): Query<MessageQuery>,
	connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
	headers: HeaderMap,
	body: axum::body::Bytes,
) -> Response {
	let started = std::time::Instant::now();
	let mut record = AuditRecord::new(&dest);
	record.source_ip = source_ip(connect_info);

	let destination = match core.registry.lookup(&dest) {
		Some(d) => d,
		None => {
			record.status_code = 404;
			core.sink.log_request(record);
			return ProxyError::Client(ClientError::UnknownDestination).into_response();
		},
	};
	if destination.kind.is_stdio() {
		record.status_code = 410;
		core.sink.log_request(record);
		return deprecated_response();
	}
	if !matches!(destination.kind, DestinationKind::Sse { .. }) {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::WrongKind).into_response();
	}

	if !is_valid_session_id(&query.session_id) {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::InvalidSessionId).into_response();
	}
	let Some(session) = core.sessions.get(&query.session_id) else {
		record.status_code = 404;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::UnknownSession).into_response();
	};

	let parsed: Option<Value> = serde_json::from_slice(&body).ok();
	record.mcp_method = parsed.as_ref().and_then(mcp::extract_method);
	record.rpc_id = parsed.as_ref().and_then(mcp::extract_id);

	let mut outgoing_body = body.clone();
	if let Some(value) = parsed.clone() {
		let id = mcp::extract_id(&value);
		match run_scanner(&core, &destination, Direction::Request, id, value, &mut record).await {
			Ok(replaced) => outgoing_body = bytes::Bytes::from(serde_json::to_vec(&replaced).unwrap_or_default()),
			Err(resp) => {
				record.status_code = 200;
				record.latency_ms = started.elapsed().as_millis();
				core.sink.log_request(record);
				return resp;
			},
		}
	}

	let filtered = filter_request_headers(&headers);
	let resp = match core
		.client
		.send_with_retry(Method::POST, session.upstream_message_url.clone(), filtered, Some(outgoing_body.clone()))
		.await
	{
		Ok(resp) => resp,
		Err(e) => {
			error!(destination = %dest, error = %e, "legacy message upstream failed");
			record.status_code = 502;
			record.error = Some(e.to_string());
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};

	let status = resp.status();
	let response_headers = filter_response_headers(resp.headers());
	let response_bytes = match UpstreamClient::read_body_with_timeout(resp).await {
		Ok(b) => b,
		Err(e) => {
			record.status_code = 502;
			record.error = Some(e.to_string());
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};

	let response_id = parsed.as_ref().and_then(mcp::extract_id);
	let mut outgoing_response = response_bytes.clone();
	if let Ok(value) = serde_json::from_slice::<Value>(&response_bytes) {
		match run_scanner(&core, &destination, Direction::Response, response_id, value, &mut record).await {
			Ok(replaced) => outgoing_response = bytes::Bytes::from(serde_json::to_vec(&replaced).unwrap_or_default()),
			Err(resp) => {
				record.status_code = 200;
				record.latency_ms = started.elapsed().as_millis();
				core.sink.log_request(record);
				return resp;
			},
		}
	}

	let req_capture = capture_body(&outgoing_body, core.config.audit_log_bodies, core.config.max_body_bytes);
	let resp_capture = capture_body(&outgoing_response, core.config.audit_log_bodies, core.config.max_body_bytes);
	apply_capture(&mut record, req_capture, resp_capture);
	record.status_code = status.as_u16();
	record.latency_ms = started.elapsed().as_millis();
	core.sink.log_request(record);

	let mut response = Response::new(axum::body::Body::from(outgoing_response));
	*response.status_mut() = status;
	*response.headers_mut() = response_headers;
	response
}

// ---------------------------------------------------------------------
// Streamable HTTP transport (§4.5) for sse/streamable_http destinations.
// stdio destinations are dispatched to the bridge handlers below.
// ---------------------------------------------------------------------

fn mcp_content_type_is(headers: &reqwest::header::HeaderMap, prefix: &str) -> bool {
	headers
		.get(reqwest::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.starts_with(prefix))
		.unwrap_or(false)
}

async fn mcp_post(
	State(core): State<Arc<Core>>,
	Path(dest): Path<String>,
	connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
	headers: HeaderMap,
	body: axum::body::Bytes,
) -> Response {
	let started = std::time::Instant::now();
	let mut record = AuditRecord::new(&dest);
	record.source_ip = source_ip(connect_info);

	let destination = match core.registry.lookup(&dest) {
		Some(d) => d,
		None => {
			record.status_code = 404;
			core.sink.log_request(record);
			return ProxyError::Client(ClientError::UnknownDestination).into_response();
		},
	};

	if destination.kind.is_stdio() {
		return bridge_post(&core, &destination, &dest, headers, body, record, started).await;
	}
	let DestinationKind::StreamableHttp { upstream_url } = &destination.kind else {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::WrongKind).into_response();
	};

	let Some(semaphore) = core.streamable_semaphores.get(&dest).cloned() else {
		record.status_code = 500;
		core.sink.log_request(record);
		return ProxyError::Internal(anyhow::anyhow!("missing semaphore for streamable_http destination")).into_response();
	};
	let Ok(_permit) = semaphore.try_acquire_owned() else {
		record.status_code = 503;
		core.sink.log_request(record);
		return ProxyError::Capacity.into_response();
	};

	let parsed: Option<Value> = serde_json::from_slice(&body).ok();
	record.mcp_method = parsed.as_ref().and_then(mcp::extract_method);
	record.rpc_id = parsed.as_ref().and_then(mcp::extract_id);

	let mut outgoing_body = body.clone();
	if let Some(value) = parsed.clone() {
		let id = mcp::extract_id(&value);
		match run_scanner(&core, &destination, Direction::Request, id, value, &mut record).await {
			Ok(replaced) => outgoing_body = bytes::Bytes::from(serde_json::to_vec(&replaced).unwrap_or_default()),
			Err(resp) => {
				record.status_code = 200;
				record.latency_ms = started.elapsed().as_millis();
				core.sink.log_request(record);
				return resp;
			},
		}
	}

	let filtered = filter_request_headers(&headers);
	let resp = match core.client.send_with_retry(Method::POST, upstream_url.clone(), filtered, Some(outgoing_body.clone())).await {
		Ok(resp) => resp,
		Err(e) => {
			error!(destination = %dest, error = %e, "streamable http upstream failed");
			record.status_code = 502;
			record.error = Some(e.to_string());
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};

	if mcp_content_type_is(resp.headers(), "text/event-stream") {
		let response_headers = filter_response_headers(resp.headers());
		record.status_code = 200;
		record.latency_ms = started.elapsed().as_millis();
		core.sink.log_request(record);
		let byte_stream = resp.bytes_stream();
		let body_stream = forward_sse(byte_stream, |_, _| LineOutcome::Keep);
		let guarded_stream = PermitGuardStream { inner: body_stream, _permit };
		let mut response = Response::new(axum::body::Body::from_stream(guarded_stream));
		*response.headers_mut() = response_headers;
		response
			.headers_mut()
			.insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("text/event-stream"));
		return response;
	}

	let status = resp.status();
	let response_headers = filter_response_headers(resp.headers());
	let response_bytes = match UpstreamClient::read_body_with_timeout(resp).await {
		Ok(b) => b,
		Err(e) => {
			record.status_code = 502;
			record.error = Some(e.to_string());
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};
	let response_id = parsed.as_ref().and_then(mcp::extract_id);
	let mut outgoing_response = response_bytes.clone();
	if let Ok(value) = serde_json::from_slice::<Value>(&response_bytes) {
		match run_scanner(&core, &destination, Direction::Response, response_id, value, &mut record).await {
			Ok(replaced) => outgoing_response = bytes::Bytes::from(serde_json::to_vec(&replaced).unwrap_or_default()),
			Err(resp) => {
				record.status_code = 200;
				record.latency_ms = started.elapsed().as_millis();
				core.sink.log_request(record);
				return resp;
			},
		}
	}

	let req_capture = capture_body(&outgoing_body, core.config.audit_log_bodies, core.config.max_body_bytes);
	let resp_capture = capture_body(&outgoing_response, core.config.audit_log_bodies, core.config.max_body_bytes);
	apply_capture(&mut record, req_capture, resp_capture);
	record.status_code = status.as_u16();
	record.latency_ms = started.elapsed().as_millis();
	core.sink.log_request(record);

	let mut response = Response::new(axum::body::Body::from(outgoing_response));
	*response.status_mut() = status;
	*response.headers_mut() = response_headers;
	response
}

async fn mcp_get(
	State(core): State<Arc<Core>>,
	Path(dest): Path<String>,
	connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
	headers: HeaderMap,
) -> Response {
	let mut record = AuditRecord::new(&dest);
	record.source_ip = source_ip(connect_info);

	let destination = match core.registry.lookup(&dest) {
		Some(d) => d,
		None => {
			record.status_code = 404;
			core.sink.log_request(record);
			return ProxyError::Client(ClientError::UnknownDestination).into_response();
		},
	};
	if destination.kind.is_stdio() {
		return bridge_get(&core, &dest, headers, record).await;
	}
	let DestinationKind::StreamableHttp { upstream_url } = &destination.kind else {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::WrongKind).into_response();
	};

	let Some(semaphore) = core.streamable_semaphores.get(&dest).cloned() else {
		record.status_code = 500;
		core.sink.log_request(record);
		return ProxyError::Internal(anyhow::anyhow!("missing semaphore for streamable_http destination")).into_response();
	};
	let Ok(_permit) = semaphore.try_acquire_owned() else {
		record.status_code = 503;
		core.sink.log_request(record);
		return ProxyError::Capacity.into_response();
	};

	let filtered = filter_request_headers(&headers);
	let resp = match core.client.send_with_retry(Method::GET, upstream_url.clone(), filtered, None).await {
		Ok(resp) if resp.status().is_success() => resp,
		Ok(resp) => {
			record.status_code = 502;
			record.error = Some(format!("upstream returned {}", resp.status()));
			core.sink.log_request(record);
			return static_upstream_error();
		},
		Err(e) => {
			error!(destination = %dest, error = %e, "streamable http get upstream failed");
			record.status_code = 502;
			record.error = Some(e.to_string());
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};

	record.status_code = 200;
	core.sink.log_request(record);
	let response_headers = filter_response_headers(resp.headers());
	let byte_stream = resp.bytes_stream();
	let body_stream = forward_sse(byte_stream, |_, _| LineOutcome::Keep);
	let guarded_stream = PermitGuardStream { inner: body_stream, _permit };
	let mut response = Response::new(axum::body::Body::from_stream(guarded_stream));
	*response.headers_mut() = response_headers;
	response
		.headers_mut()
		.insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("text/event-stream"));
	response
}

async fn mcp_delete(
	State(core): State<Arc<Core>>,
	Path(dest): Path<String>,
	connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
	headers: HeaderMap,
) -> Response {
	let started = std::time::Instant::now();
	let mut record = AuditRecord::new(&dest);
	record.source_ip = source_ip(connect_info);

	let destination = match core.registry.lookup(&dest) {
		Some(d) => d,
		None => {
			record.status_code = 404;
			core.sink.log_request(record);
			return ProxyError::Client(ClientError::UnknownDestination).into_response();
		},
	};
	if destination.kind.is_stdio() {
		return bridge_delete(&core, &dest, headers, record).await;
	}
	let DestinationKind::StreamableHttp { upstream_url } = &destination.kind else {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::WrongKind).into_response();
	};

	let filtered = filter_request_headers(&headers);
	let resp = match core.client.send_with_retry(Method::DELETE, upstream_url.clone(), filtered, None).await {
		Ok(resp) => resp,
		Err(e) => {
			error!(destination = %dest, error = %e, "streamable http delete upstream failed");
			record.status_code = 502;
			record.error = Some(e.to_string());
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			return static_upstream_error();
		},
	};
	let status = resp.status();
	let response_headers = filter_response_headers(resp.headers());
	let response_bytes = UpstreamClient::read_body_with_timeout(resp).await.unwrap_or_default();
	record.status_code = status.as_u16();
	record.latency_ms = started.elapsed().as_millis();
	core.sink.log_request(record);

	let mut response = Response::new(axum::body::Body::from(response_bytes));
	*response.status_mut() = status;
	*response.headers_mut() = response_headers;
	response
}

// ---------------------------------------------------------------------
// stdio bridge dispatch (§4.6)
// ---------------------------------------------------------------------

fn session_header(headers: &HeaderMap) -> Option<String> {
	headers.get(&mcp::SESSION_ID_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn bridge_post(
	core: &Arc<Core>,
	destination: &crate::registry::Destination,
	dest: &str,
	headers: HeaderMap,
	body: axum::body::Bytes,
	mut record: AuditRecord,
	started: std::time::Instant,
) -> Response {
	let Some(bridge) = core.bridges.get(dest).cloned() else {
		record.status_code = 500;
		core.sink.log_request(record);
		return ProxyError::Internal(anyhow::anyhow!("stdio destination has no bridge")).into_response();
	};
	if !bridge.is_available() {
		record.status_code = 503;
		core.sink.log_request(record);
		return ProxyError::Bridge.into_response();
	}

	let (session_id, created) = match session_header(&headers) {
		None => match bridge.create_session().await {
			Some(id) => (id, true),
			None => {
				record.status_code = 503;
				core.sink.log_request(record);
				return ProxyError::Capacity.into_response();
			},
		},
		Some(id) => {
			if !mcp::is_valid_mcp_session_id(&id) {
				record.status_code = 400;
				core.sink.log_request(record);
				return ProxyError::Client(ClientError::InvalidSessionId).into_response();
			}
			if !bridge.has_session(&id).await {
				record.status_code = 404;
				core.sink.log_request(record);
				return ProxyError::Client(ClientError::UnknownSession).into_response();
			}
			(id, false)
		},
	};

	let Ok(value) = serde_json::from_slice::<Value>(&body) else {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::Malformed).into_response();
	};
	if mcp::is_batch(&value) {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::Malformed).into_response();
	}
	record.mcp_method = mcp::extract_method(&value);
	let call_id = mcp::extract_id(&value);
	record.rpc_id = call_id.clone();

	let value = match run_scanner(core, destination, Direction::Request, call_id.clone(), value, &mut record).await {
		Ok(replaced) => replaced,
		Err(resp) => {
			record.status_code = 200;
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			return resp;
		},
	};
	let req_bytes = serde_json::to_vec(&value).unwrap_or_default();
	let req_capture = capture_body(&req_bytes, core.config.audit_log_bodies, core.config.max_body_bytes);

	if mcp::is_notification(&value) {
		let status = if bridge.send_notification(&value).is_ok() { 202 } else { 503 };
		record.status_code = status;
		record.latency_ms = started.elapsed().as_millis();
		apply_capture(&mut record, req_capture, crate::audit::CapturedBody { value: None, truncated: false, decode_error: false });
		core.sink.log_request(record);
		let mut resp = StatusCode::from_u16(status).unwrap().into_response();
		if created {
			resp.headers_mut().insert(mcp::SESSION_ID_HEADER.clone(), session_id.parse().expect("uuid is a valid header value"));
		}
		return resp;
	}

	match bridge.call(value, core.config.rpc_response_timeout).await {
		Ok(PendingOutcome::Resolved(response_value)) => {
			let response_value = match run_scanner(core, destination, Direction::Response, call_id.clone(), response_value, &mut record).await {
				Ok(replaced) => replaced,
				Err(resp) => {
					record.status_code = 200;
					record.latency_ms = started.elapsed().as_millis();
					apply_capture(
						&mut record,
						req_capture,
						crate::audit::CapturedBody { value: None, truncated: false, decode_error: false },
					);
					core.sink.log_request(record);
					return resp;
				},
			};
			let response_bytes = serde_json::to_vec(&response_value).unwrap_or_default();
			let resp_capture = capture_body(&response_bytes, core.config.audit_log_bodies, core.config.max_body_bytes);
			apply_capture(&mut record, req_capture, resp_capture);
			record.status_code = 200;
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			let mut resp = Json(response_value).into_response();
			resp.headers_mut().insert(mcp::SESSION_ID_HEADER.clone(), session_id.parse().expect("uuid is a valid header value"));
			resp
		},
		Ok(PendingOutcome::BridgeDown) => {
			record.status_code = 503;
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			ProxyError::Bridge.into_response()
		},
		Err(CallError::Timeout) => {
			record.status_code = 504;
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			ProxyError::Timeout.into_response()
		},
		Err(CallError::Bridge) => {
			record.status_code = 503;
			record.latency_ms = started.elapsed().as_millis();
			core.sink.log_request(record);
			ProxyError::Bridge.into_response()
		},
	}
}

async fn bridge_get(core: &Arc<Core>, dest: &str, headers: HeaderMap, mut record: AuditRecord) -> Response {
	let Some(bridge) = core.bridges.get(dest).cloned() else {
		record.status_code = 500;
		core.sink.log_request(record);
		return ProxyError::Internal(anyhow::anyhow!("stdio destination has no bridge")).into_response();
	};
	let Some(session_id) = session_header(&headers) else {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::InvalidSessionId).into_response();
	};
	if !mcp::is_valid_mcp_session_id(&session_id) {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::InvalidSessionId).into_response();
	}
	let Some(queue) = bridge.new_notification_queue(&session_id).await else {
		record.status_code = 404;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::UnknownSession).into_response();
	};
	record.status_code = 200;
	core.sink.log_request(record);

	let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, std::convert::Infallible>> + Send>> =
		Box::pin(stream::unfold(queue, |queue| async move {
			let value = queue.pop().await?;
			let event = Event::default().data(value.to_string());
			Some((Ok(event), queue))
		}));
	Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn bridge_delete(core: &Arc<Core>, dest: &str, headers: HeaderMap, mut record: AuditRecord) -> Response {
	let Some(bridge) = core.bridges.get(dest).cloned() else {
		record.status_code = 500;
		core.sink.log_request(record);
		return ProxyError::Internal(anyhow::anyhow!("stdio destination has no bridge")).into_response();
	};
	let Some(session_id) = session_header(&headers) else {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::InvalidSessionId).into_response();
	};
	if !mcp::is_valid_mcp_session_id(&session_id) {
		record.status_code = 400;
		core.sink.log_request(record);
		return ProxyError::Client(ClientError::InvalidSessionId).into_response();
	}
	if bridge.remove_session(&session_id).await {
		record.status_code = 204;
		core.sink.log_request(record);
		StatusCode::NO_CONTENT.into_response()
	} else {
		record.status_code = 404;
		core.sink.log_request(record);
		ProxyError::Client(ClientError::UnknownSession).into_response()
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::Semaphore;

	use super::*;

	/// §4.5: the `MaxConnPerDestination` permit must stay held for the full
	/// streaming response lifetime, not just until the handler's `async fn`
	/// returns after sending headers.
	#[tokio::test]
	async fn permit_guard_stream_holds_permit_until_dropped() {
		let semaphore = Arc::new(Semaphore::new(1));
		let permit = semaphore.clone().try_acquire_owned().unwrap();
		assert_eq!(semaphore.available_permits(), 0);

		let inner = futures_util::stream::pending::<Result<bytes::Bytes, std::io::Error>>();
		let guarded = PermitGuardStream { inner, _permit: permit };
		assert_eq!(semaphore.available_permits(), 0, "permit must still be held while the stream is alive");

		drop(guarded);
		assert_eq!(semaphore.available_permits(), 1, "permit must be released once the stream is dropped");
	}
}
