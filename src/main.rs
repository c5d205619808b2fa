//! Process entry point: loads configuration and the destination registry,
//! assembles [`mcp_relay::router::Core`], and serves the public and admin
//! listeners side by side until shutdown is requested.
//!
//! YAML parsing, secrets loading, the installer, and the systemd unit are
//! all out of scope (§1); the destination registry here is loaded from a
//! plain JSON file instead, read from the path named by the
//! `DESTINATIONS_FILE` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use mcp_relay::registry::{Destination, RawDestination, Registry};
use mcp_relay::router::{Core, build_admin_router, build_router};
use mcp_relay::scanner::NoopScanner;
use mcp_relay::{Config, audit::AuditSink};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::from_env()?;
	let _log_guard = mcp_relay::telemetry::init(config.log_file.as_deref())?;

	let registry = load_registry()?;
	let sink = AuditSink::new(config.log_file.as_ref().map(|p| with_suffix(p, "audit")))?;
	let scanner = Arc::new(NoopScanner);
	let core = Core::new(registry, sink, scanner, config.clone())?;

	let shutdown = CancellationToken::new();

	let public_app = build_router(core.clone());
	let admin_app = build_admin_router(core.clone());

	let public_listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
	tracing::info!(addr = %config.bind_addr, "public listener bound");
	let admin_listener = tokio::net::TcpListener::bind(config.admin_addr).await?;
	tracing::info!(addr = %config.admin_addr, "admin listener bound");

	let public_shutdown = shutdown.clone();
	let public_task = tokio::spawn(async move {
		axum::serve(public_listener, public_app.into_make_service_with_connect_info::<SocketAddr>())
			.with_graceful_shutdown(async move { public_shutdown.cancelled().await })
			.await
	});

	let admin_shutdown = shutdown.clone();
	let admin_task = tokio::spawn(async move {
		axum::serve(admin_listener, admin_app.into_make_service_with_connect_info::<SocketAddr>())
			.with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
			.await
	});

	wait_for_shutdown_signal().await;
	tracing::info!("shutdown signal received, draining");
	shutdown.cancel();
	core.shutdown();

	let _ = tokio::join!(public_task, admin_task);
	Ok(())
}

/// Builds the audit log path next to the tracing log path when both are
/// configured, so `LOG_FILE=/var/log/mcp-relay.log` yields
/// `/var/log/mcp-relay.audit.log` for the structured request trail.
fn with_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
	let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("mcp-relay");
	let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("log");
	path.with_file_name(format!("{stem}.{suffix}.{ext}"))
}

fn load_registry() -> anyhow::Result<Registry> {
	let path = std::env::var("DESTINATIONS_FILE").map_err(|_| anyhow::anyhow!("DESTINATIONS_FILE environment variable is required"))?;
	let raw = std::fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("reading destinations file {path:?}: {e}"))?;
	let entries: Vec<RawDestination> = serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing destinations file {path:?}: {e}"))?;
	let destinations = entries
		.into_iter()
		.map(Destination::from_raw)
		.collect::<anyhow::Result<Vec<_>>>()?;
	Registry::from_destinations(destinations)
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("installing Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("installing SIGTERM handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
