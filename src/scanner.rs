//! Scanner Hook (§4.7): a pluggable request/response inspector. The regex
//! and AI detection engines themselves are out of scope here — this module
//! only ships the trait boundary plus a default passthrough engine,
//! permissive by default rather than baking in one fixed policy.

use async_trait::async_trait;
use serde_json::Value;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
	#[default]
	Off,
	Monitor,
	Redact,
	Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Request,
	Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
	Pass,
	Monitor,
	Redact,
	Block,
}

/// Per-destination scanner configuration (§4.7). Defaults to fully off, so
/// a destination that never opts in pays no cost and sees no behavior
/// change.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ScannerSettings {
	#[serde(default)]
	pub regex_mode: ScanMode,
	#[serde(default)]
	pub ai_mode: ScanMode,
	#[serde(default)]
	pub ai_threshold: Option<f64>,
	#[serde(default)]
	pub ai_max_chars: Option<usize>,
}

impl ScannerSettings {
	pub fn is_off(&self) -> bool {
		self.regex_mode == ScanMode::Off && self.ai_mode == ScanMode::Off
	}
}

pub struct ScanOutcome {
	pub action: ScanAction,
	pub engine: Option<&'static str>,
	pub detail: Option<String>,
	/// The body to forward: unchanged on `Pass`/`Monitor`, substituted on
	/// `Redact`. Ignored on `Block`.
	pub body: Value,
}

impl ScanOutcome {
	fn pass(body: Value) -> ScanOutcome {
		ScanOutcome { action: ScanAction::Pass, engine: None, detail: None, body }
	}
}

/// The pluggable inspection boundary called by every handler that can see a
/// JSON-RPC body (§4.7). `scan` never blocks the event loop for more than a
/// few milliseconds (§5): a real AI engine implementing this trait must hop
/// to a worker thread internally before returning.
#[async_trait]
pub trait ScannerHook: Send + Sync {
	async fn scan(
		&self,
		body: Value,
		destination: &str,
		direction: Direction,
		settings: &ScannerSettings,
	) -> ScanOutcome;

	/// Triggered by `POST /admin/reload-patterns` (§6.1); returns the
	/// number of patterns now loaded. The default engine has none.
	async fn reload_patterns(&self) -> anyhow::Result<usize> {
		Ok(0)
	}
}

/// Default engine: always passes through unchanged, regardless of the
/// destination's configured mode, since no regex/AI engine is implemented
/// here. Kept distinct from "mode is Off" so a future real engine can be
/// swapped in without changing call sites.
pub struct NoopScanner;

#[async_trait]
impl ScannerHook for NoopScanner {
	async fn scan(
		&self,
		body: Value,
		_destination: &str,
		_direction: Direction,
		_settings: &ScannerSettings,
	) -> ScanOutcome {
		ScanOutcome::pass(body)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn noop_scanner_always_passes() {
		let scanner = NoopScanner;
		let settings = ScannerSettings { regex_mode: ScanMode::Block, ..Default::default() };
		let outcome = scanner
			.scan(serde_json::json!({"id": 1}), "dst", Direction::Request, &settings)
			.await;
		assert_eq!(outcome.action, ScanAction::Pass);
	}
}
