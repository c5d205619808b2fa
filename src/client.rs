//! Upstream HTTP Client (§2.4): a single pooled `reqwest::Client` shared by
//! every transport handler, plus the header filtering and connect-retry
//! policy that all three upstream-facing paths (legacy SSE, legacy message,
//! Streamable HTTP) apply identically, wrapped so a bare `reqwest::Error`
//! never leaks into a handler.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode, Url};

use crate::prelude::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_DELAYS: [Duration; 3] = [
	Duration::from_millis(500),
	Duration::from_millis(1_000),
	Duration::from_millis(2_000),
];

/// Headers stripped before forwarding a client request upstream (§6.2).
const REQUEST_STRIP: &[&str] = &[
	"host",
	"content-length",
	"transfer-encoding",
	"connection",
	"keep-alive",
	"x-forwarded-for",
	"x-real-ip",
	"x-forwarded-host",
	"x-forwarded-proto",
];

/// Headers stripped before returning an upstream response to the client
/// (§6.2, and repeated verbatim for the legacy SSE path in §4.3).
const RESPONSE_STRIP: &[&str] = &[
	"transfer-encoding",
	"connection",
	"keep-alive",
	"set-cookie",
	"www-authenticate",
	"proxy-authenticate",
];

#[derive(Clone)]
pub struct UpstreamClient {
	http: reqwest::Client,
}

impl UpstreamClient {
	pub fn new() -> anyhow::Result<UpstreamClient> {
		let http = reqwest::Client::builder()
			.connect_timeout(CONNECT_TIMEOUT)
			.pool_idle_timeout(Duration::from_secs(90))
			.build()?;
		Ok(UpstreamClient { http })
	}

	pub fn inner(&self) -> &reqwest::Client {
		&self.http
	}

	/// Connects with the retry policy shared by all upstream-facing paths
	/// (§4.3 "Connect retry"): up to 3 retries with delays `[0.5s, 1.0s,
	/// 2.0s]` on connect errors, timeouts, and 5xx status, no sleep after
	/// the final attempt. `build_request` is called fresh on every attempt
	/// since a `reqwest::RequestBuilder` can't be cloned after a streaming
	/// body has been attached.
	pub async fn send_with_retry(
		&self,
		method: Method,
		url: Url,
		headers: HeaderMap,
		body: Option<bytes::Bytes>,
	) -> anyhow::Result<Response> {
		let mut last_err = None;
		for (attempt, delay) in std::iter::once(None)
			.chain(RETRY_DELAYS.into_iter().map(Some))
			.enumerate()
		{
			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}
			let mut req = self.http.request(method.clone(), url.clone()).headers(headers.clone());
			if let Some(b) = &body {
				req = req.body(b.clone());
			}
			match req.send().await {
				Ok(resp) if resp.status().is_server_error() => {
					warn!(attempt, status = %resp.status(), %url, "upstream returned 5xx, retrying");
					last_err = Some(anyhow::anyhow!("upstream status {}", resp.status()));
					continue;
				},
				Ok(resp) => return Ok(resp),
				Err(e) if e.is_connect() || e.is_timeout() => {
					warn!(attempt, error = %e, %url, "upstream connect failed, retrying");
					last_err = Some(e.into());
					continue;
				},
				Err(e) => return Err(e.into()),
			}
		}
		Err(last_err.unwrap_or_else(|| anyhow::anyhow!("upstream connect failed with no attempts")))
	}

	/// Reads a non-streaming response body under the §5 60s read timeout.
	pub async fn read_body_with_timeout(resp: Response) -> anyhow::Result<bytes::Bytes> {
		tokio::time::timeout(READ_TIMEOUT, resp.bytes())
			.await
			.map_err(|_| anyhow::anyhow!("upstream read timed out"))?
			.map_err(Into::into)
	}
}

/// Filters an incoming client `http::HeaderMap` down to what's forwarded
/// upstream, per §6.2. `Authorization` is deliberately never in the strip
/// list: it is forwarded verbatim, proxy-style, since this crate owns no
/// credential store (§1).
pub fn filter_request_headers(headers: &axum::http::HeaderMap) -> HeaderMap {
	filter(headers, REQUEST_STRIP)
}

/// Filters an upstream response's headers down to what's returned to the
/// client, per §6.2 / §4.3.
pub fn filter_response_headers(headers: &reqwest::header::HeaderMap) -> axum::http::HeaderMap {
	let filtered = filter(headers, RESPONSE_STRIP);
	let mut out = axum::http::HeaderMap::with_capacity(filtered.len());
	for (name, value) in filtered.iter() {
		out.insert(name.clone(), value.clone());
	}
	out
}

fn filter(headers: &HeaderMap, strip: &[&str]) -> HeaderMap {
	let mut out = HeaderMap::with_capacity(headers.len());
	for (name, value) in headers.iter() {
		if strip.iter().any(|s| name.as_str().eq_ignore_ascii_case(s)) {
			continue;
		}
		out.append(name.clone(), value.clone());
	}
	out
}

/// Rejects a static message to the client while the real detail stays in
/// `tracing::error!` (§7 "Exception text is never placed in client-visible
/// bodies").
pub const STATIC_UPSTREAM_ERROR_BODY: &str = "upstream request failed";

pub fn header_value(v: &str) -> Option<HeaderValue> {
	HeaderValue::from_str(v).ok()
}

pub fn is_retryable_status(status: StatusCode) -> bool {
	status.is_server_error()
}

pub fn header_name(s: &str) -> Option<HeaderName> {
	HeaderName::from_bytes(s.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
	use reqwest::header::{HeaderMap, HeaderValue};

	use super::*;

	#[test]
	fn strips_hop_by_hop_request_headers() {
		let mut headers = HeaderMap::new();
		headers.insert("host", HeaderValue::from_static("example.com"));
		headers.insert("authorization", HeaderValue::from_static("Bearer xyz"));
		headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
		let filtered = filter(&headers, REQUEST_STRIP);
		assert!(filtered.get("host").is_none());
		assert!(filtered.get("x-forwarded-for").is_none());
		assert_eq!(filtered.get("authorization").unwrap(), "Bearer xyz");
	}

	#[test]
	fn strips_hop_by_hop_response_headers() {
		let mut headers = HeaderMap::new();
		headers.insert("set-cookie", HeaderValue::from_static("a=b"));
		headers.insert("content-type", HeaderValue::from_static("application/json"));
		let filtered = filter(&headers, RESPONSE_STRIP);
		assert!(filtered.get("set-cookie").is_none());
		assert!(filtered.get("content-type").is_some());
	}
}
