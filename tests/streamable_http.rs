//! End-to-end coverage of the Streamable HTTP transport against a
//! `streamable_http` destination (§4.5, scenarios S2/S3/S6).

mod common;

use std::time::Duration;

use common::TestProxy;
use mcp_relay::Config;
use mcp_relay::registry::{Destination, DestinationKind};
use mcp_relay::scanner::ScannerSettings;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn streamable_destination(name: &str, upstream: &MockServer) -> Destination {
	Destination {
		name: name.into(),
		kind: DestinationKind::StreamableHttp { upstream_url: format!("{}/mcp", upstream.uri()).parse().unwrap() },
		scanner: ScannerSettings::default(),
	}
}

#[tokio::test]
async fn json_reply_is_buffered_and_returned() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/mcp"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"jsonrpc": "2.0", "id": 7, "result": {"tools": []}
		})))
		.mount(&upstream)
		.await;

	let proxy = TestProxy::start(vec![streamable_destination("dst2", &upstream)], Config::default()).await;
	let resp = proxy
		.client
		.post(proxy.url("/dst2/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list", "params": {}}))
		.send()
		.await
		.unwrap();

	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get("content-type").unwrap().to_str().unwrap(),
		"application/json"
	);
	let json: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(json["id"], serde_json::json!(7));
	assert_eq!(json["result"]["tools"], serde_json::json!([]));
}

#[tokio::test]
async fn sse_reply_is_relayed_and_session_header_preserved() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/mcp"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("mcp-session-id", "11111111-1111-4111-8111-111111111111")
				.set_body_raw("data: one\n\ndata: two\n\ndata: three\n\n", "text/event-stream"),
		)
		.mount(&upstream)
		.await;

	let proxy = TestProxy::start(vec![streamable_destination("dst3", &upstream)], Config::default()).await;
	let resp = proxy
		.client
		.post(proxy.url("/dst3/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
		.send()
		.await
		.unwrap();

	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get("mcp-session-id").unwrap().to_str().unwrap(),
		"11111111-1111-4111-8111-111111111111"
	);
	let body = resp.text().await.unwrap();
	assert_eq!(body, "data: one\n\ndata: two\n\ndata: three\n\n");
}

#[tokio::test]
async fn capacity_cap_refuses_the_nth_plus_one_request() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/mcp"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_delay(Duration::from_millis(300))
				.set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
		)
		.mount(&upstream)
		.await;

	let mut config = Config::default();
	config.max_stdio_connections = 1;
	let proxy = TestProxy::start(vec![streamable_destination("dst4", &upstream)], config).await;

	let client = proxy.client.clone();
	let url = proxy.url("/dst4/mcp");
	let first = tokio::spawn(async move {
		client
			.post(url)
			.json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
			.send()
			.await
			.unwrap()
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	let second = proxy
		.client
		.post(proxy.url("/dst4/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
		.send()
		.await
		.unwrap();
	assert_eq!(second.status(), 503);

	let first = first.await.unwrap();
	assert_eq!(first.status(), 200);
}

#[tokio::test]
async fn wrong_destination_kind_is_400() {
	let upstream = MockServer::start().await;
	let destination = Destination {
		name: "dst5".into(),
		kind: DestinationKind::Sse { upstream_url: format!("{}/sse", upstream.uri()).parse().unwrap() },
		scanner: ScannerSettings::default(),
	};
	let proxy = TestProxy::start(vec![destination], Config::default()).await;

	let resp = proxy
		.client
		.post(proxy.url("/dst5/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 400);
}
