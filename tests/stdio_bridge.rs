//! End-to-end coverage of the stdio bridge (§4.6) against a real `cat`
//! child process, covering session init with id restoration (S4),
//! notification fan-out to a GET listen stream (S5), the per-destination
//! capacity cap (S6), and DELETE lifecycle (S7).

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::TestProxy;
use futures_util::StreamExt;
use mcp_relay::Config;
use mcp_relay::registry::{Destination, DestinationKind};
use mcp_relay::scanner::ScannerSettings;

fn cat_destination(name: &str) -> Destination {
	Destination {
		name: name.into(),
		kind: DestinationKind::Stdio { command: "cat".into(), args: vec![], env: HashMap::new() },
		scanner: ScannerSettings::default(),
	}
}

#[tokio::test]
async fn session_init_restores_client_id_and_sets_session_header() {
	let proxy = TestProxy::start(vec![cat_destination("ctx")], Config::default()).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let resp = proxy
		.client
		.post(proxy.url("/ctx/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let session_id = resp.headers().get("mcp-session-id").unwrap().to_str().unwrap().to_string();
	assert!(uuid::Uuid::parse_str(&session_id).is_ok());

	let json: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(json["id"], serde_json::json!("init"));
	assert_eq!(json["method"], serde_json::json!("initialize"));
}

#[tokio::test]
async fn invalid_session_header_is_400_and_unknown_session_is_404() {
	let proxy = TestProxy::start(vec![cat_destination("ctx-bad")], Config::default()).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let resp = proxy
		.client
		.post(proxy.url("/ctx-bad/mcp"))
		.header("mcp-session-id", "not-a-uuid")
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 400);

	let resp = proxy
		.client
		.post(proxy.url("/ctx-bad/mcp"))
		.header("mcp-session-id", "11111111-1111-4111-8111-111111111111")
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn notification_fanout_reaches_get_listen_stream() {
	let proxy = TestProxy::start(vec![cat_destination("ctx2")], Config::default()).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let init = proxy
		.client
		.post(proxy.url("/ctx2/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"}))
		.send()
		.await
		.unwrap();
	let session_id = init.headers().get("mcp-session-id").unwrap().to_str().unwrap().to_string();

	let get_resp = proxy
		.client
		.get(proxy.url("/ctx2/mcp"))
		.header("mcp-session-id", session_id.clone())
		.send()
		.await
		.unwrap();
	assert_eq!(get_resp.status(), 200);
	let mut stream = get_resp.bytes_stream();

	// `cat` echoes raw stdin lines back to stdout unchanged; a notification
	// has no `id`, so the dispatcher fans it out to every active
	// notification queue instead of resolving a pending call (§4.6).
	proxy
		.client
		.post(proxy.url("/ctx2/mcp"))
		.header("mcp-session-id", session_id)
		.json(&serde_json::json!({"jsonrpc": "2.0", "method": "progress", "params": {"p": 1}}))
		.send()
		.await
		.unwrap();

	let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
		.await
		.expect("notification frame arrived before timeout")
		.expect("stream stayed open")
		.expect("no io error reading sse frame");
	let text = String::from_utf8(chunk.to_vec()).unwrap();
	assert!(text.contains("\"method\":\"progress\""), "unexpected frame: {text}");
	assert!(text.starts_with("data:"), "expected a bare data: frame per §4.6, got: {text}");
}

#[tokio::test]
async fn capacity_cap_refuses_the_nth_plus_one_session() {
	let mut config = Config::default();
	config.max_stdio_connections = 2;
	let proxy = TestProxy::start(vec![cat_destination("ctx3")], config).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	for id in ["a", "b"] {
		let resp = proxy
			.client
			.post(proxy.url("/ctx3/mcp"))
			.json(&serde_json::json!({"jsonrpc": "2.0", "id": id, "method": "initialize"}))
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), 200, "session {id} should be accepted");
	}

	let third = proxy
		.client
		.post(proxy.url("/ctx3/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": "c", "method": "initialize"}))
		.send()
		.await
		.unwrap();
	assert_eq!(third.status(), 503);
}

#[tokio::test]
async fn delete_then_post_on_same_session_is_404() {
	let proxy = TestProxy::start(vec![cat_destination("ctx4")], Config::default()).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let init = proxy
		.client
		.post(proxy.url("/ctx4/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"}))
		.send()
		.await
		.unwrap();
	let session_id = init.headers().get("mcp-session-id").unwrap().to_str().unwrap().to_string();

	let del = proxy
		.client
		.delete(proxy.url("/ctx4/mcp"))
		.header("mcp-session-id", session_id.clone())
		.send()
		.await
		.unwrap();
	assert_eq!(del.status(), 204);

	let post_after = proxy
		.client
		.post(proxy.url("/ctx4/mcp"))
		.header("mcp-session-id", session_id)
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": "again", "method": "ping"}))
		.send()
		.await
		.unwrap();
	assert_eq!(post_after.status(), 404);
}

#[tokio::test]
async fn notification_post_returns_202_without_waiting() {
	let proxy = TestProxy::start(vec![cat_destination("ctx5")], Config::default()).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let init = proxy
		.client
		.post(proxy.url("/ctx5/mcp"))
		.json(&serde_json::json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"}))
		.send()
		.await
		.unwrap();
	let session_id = init.headers().get("mcp-session-id").unwrap().to_str().unwrap().to_string();

	let resp = proxy
		.client
		.post(proxy.url("/ctx5/mcp"))
		.header("mcp-session-id", session_id)
		.json(&serde_json::json!({"jsonrpc": "2.0", "method": "progress", "params": {}}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 202);
}
