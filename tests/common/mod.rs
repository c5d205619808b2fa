//! Shared integration-test harness: spawns the public router on a real
//! loopback listener backed by a fully assembled `Core`, so tests exercise
//! the same axum `Router` `main.rs` serves rather than calling handlers
//! directly.

use std::sync::Arc;

use mcp_relay::Config;
use mcp_relay::audit::AuditSink;
use mcp_relay::registry::{Destination, Registry};
use mcp_relay::router::{Core, build_router};
use mcp_relay::scanner::NoopScanner;

pub struct TestProxy {
	pub port: u16,
	pub client: reqwest::Client,
	core: Arc<Core>,
	task: tokio::task::JoinHandle<()>,
}

impl TestProxy {
	pub async fn start(destinations: Vec<Destination>, config: Config) -> TestProxy {
		let registry = Registry::from_destinations(destinations).expect("valid destination set");
		let sink = AuditSink::new(None).expect("audit sink");
		let core = Core::new(registry, sink, Arc::new(NoopScanner), config).expect("core assembly");
		let app = build_router(core.clone());

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
		let port = listener.local_addr().expect("local addr").port();
		let task = tokio::spawn(async move {
			axum::serve(listener, app.into_make_service()).await.expect("test server crashed");
		});

		TestProxy { port, client: reqwest::Client::new(), core, task }
	}

	pub fn url(&self, path: &str) -> String {
		format!("http://127.0.0.1:{}{}", self.port, path)
	}
}

impl Drop for TestProxy {
	fn drop(&mut self) {
		self.core.shutdown();
		self.task.abort();
	}
}
