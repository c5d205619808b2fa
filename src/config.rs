//! Process configuration, read once at startup from the environment.
//!
//! Env parsing is intentionally flat (no YAML, no CLI flags — both out of
//! scope) but still lands in a typed struct with defaults baked in, not a
//! loose string lookup scattered through the handlers.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::prelude::*;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_MAX_STDIO_CONNECTIONS: usize = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024;
const DEFAULT_RPC_RESPONSE_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_AI_INJECTION_THRESHOLD: f64 = 0.85;
const DEFAULT_MAX_SESSIONS: usize = 10_000;
const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 256;
const DEFAULT_STDIO_RESTART_BUDGET: u32 = 3;

#[derive(Debug, Clone)]
pub struct Config {
	/// Address the public listener binds to. Not part of the documented
	/// environment-variable table (which only specifies ports for
	/// logging/admin concerns); a runnable binary still needs one, so it
	/// defaults to all interfaces and can be overridden for local testing.
	pub bind_addr: SocketAddr,
	/// Admin surface (`POST /admin/reload-patterns`) is always loopback-bound,
	/// only the port is configurable.
	pub admin_addr: SocketAddr,
	/// If unset, the audit log and tracing output both go to stderr.
	pub log_file: Option<PathBuf>,
	pub audit_log_bodies: bool,
	pub max_stdio_connections: usize,
	pub max_body_bytes: usize,
	pub rpc_response_timeout: Duration,
	pub ai_injection_threshold: f64,
	pub patterns_dir: Option<PathBuf>,
	/// Not env-configurable (no name reserved for it in §6.5); a sensible
	/// internal default for the legacy SSE session map's capacity cap.
	pub max_sessions: usize,
	pub notification_queue_capacity: usize,
	pub stdio_restart_budget: u32,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			bind_addr: DEFAULT_BIND_ADDR.parse().expect("valid default bind addr"),
			admin_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_ADMIN_PORT),
			log_file: None,
			audit_log_bodies: true,
			max_stdio_connections: DEFAULT_MAX_STDIO_CONNECTIONS,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
			rpc_response_timeout: Duration::from_secs(DEFAULT_RPC_RESPONSE_TIMEOUT_SECONDS),
			ai_injection_threshold: DEFAULT_AI_INJECTION_THRESHOLD,
			patterns_dir: None,
			max_sessions: DEFAULT_MAX_SESSIONS,
			notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
			stdio_restart_budget: DEFAULT_STDIO_RESTART_BUDGET,
		}
	}
}

impl Config {
	pub fn from_env() -> anyhow::Result<Config> {
		let mut cfg = Config::default();

		if let Some(v) = env_var("LOG_FILE")? {
			cfg.log_file = Some(PathBuf::from(v));
		}
		if let Some(v) = env_var("BIND_ADDR")? {
			cfg.bind_addr = v.parse().map_err(|e| anyhow::anyhow!("BIND_ADDR: {e}"))?;
		}
		if let Some(v) = env_bool("AUDIT_LOG_BODIES")? {
			cfg.audit_log_bodies = v;
		}
		if let Some(v) = env_usize("MAX_STDIO_CONNECTIONS")? {
			cfg.max_stdio_connections = v;
		}
		if let Some(v) = env_usize("MAX_BODY_BYTES")? {
			cfg.max_body_bytes = v;
		}
		if let Some(v) = env_var("RPC_RESPONSE_TIMEOUT_SECONDS")? {
			let secs: u64 = v.parse().map_err(|e| anyhow::anyhow!("RPC_RESPONSE_TIMEOUT_SECONDS: {e}"))?;
			cfg.rpc_response_timeout = Duration::from_secs(secs);
		}
		if let Some(v) = env_var("AI_INJECTION_THRESHOLD")? {
			cfg.ai_injection_threshold = v
				.parse()
				.map_err(|e| anyhow::anyhow!("AI_INJECTION_THRESHOLD: {e}"))?;
		}
		if let Some(v) = env_var("ADMIN_PORT")? {
			let port: u16 = v.parse().map_err(|e| anyhow::anyhow!("ADMIN_PORT: {e}"))?;
			cfg.admin_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
		}
		if let Some(v) = env_var("PATTERNS_DIR")? {
			cfg.patterns_dir = Some(PathBuf::from(v));
		}

		Ok(cfg)
	}
}

fn env_var(name: &str) -> anyhow::Result<Option<String>> {
	match env::var(name) {
		Ok(v) if v.is_empty() => Ok(None),
		Ok(v) => Ok(Some(v)),
		Err(env::VarError::NotPresent) => Ok(None),
		Err(e) => Err(anyhow::anyhow!("{name}: {e}")),
	}
}

fn env_bool(name: &str) -> anyhow::Result<Option<bool>> {
	Ok(match env_var(name)? {
		Some(v) => Some(match v.to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => true,
			"0" | "false" | "no" | "off" => false,
			other => return Err(anyhow::anyhow!("{name}: invalid boolean {other:?}")),
		}),
		None => None,
	})
}

fn env_usize(name: &str) -> anyhow::Result<Option<usize>> {
	Ok(match env_var(name)? {
		Some(v) => Some(v.parse().map_err(|e| anyhow::anyhow!("{name}: {e}"))?),
		None => None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let cfg = Config::default();
		assert!(cfg.audit_log_bodies);
		assert_eq!(cfg.max_stdio_connections, 10);
		assert_eq!(cfg.max_body_bytes, 32 * 1024);
		assert_eq!(cfg.rpc_response_timeout, Duration::from_secs(30));
		assert_eq!(cfg.admin_addr.port(), 3001);
		assert!(cfg.admin_addr.ip().is_loopback());
	}
}
