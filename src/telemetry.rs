//! Operational logging setup, kept distinct from the newline-delimited-JSON
//! audit trail in [`crate::audit`].
//!
//! An `EnvFilter` driven by `RUST_LOG`, a `fmt` layer, and a
//! `tracing_appender::non_blocking` writer so logging never blocks the
//! async runtime on disk I/O. The returned guard must be held for the
//! lifetime of the process; dropping it early truncates buffered output.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes the global `tracing` subscriber. `log_file` selects a rolling
/// append-mode file sink in place of stderr; either way writes happen on a
/// background worker thread.
pub fn init(log_file: Option<&Path>) -> anyhow::Result<WorkerGuard> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	let (non_blocking, guard) = match log_file {
		Some(path) => {
			let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
			let file_name = path
				.file_name()
				.ok_or_else(|| anyhow::anyhow!("log file path {path:?} has no file name"))?;
			let appender = tracing_appender::rolling::never(dir, file_name);
			tracing_appender::non_blocking(appender)
		},
		None => tracing_appender::non_blocking(std::io::stderr()),
	};

	let fmt_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_target(true);

	tracing_subscriber::registry().with(filter).with(fmt_layer).try_init().map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;

	std::panic::set_hook(Box::new(|info| {
		tracing::error!(panic = %info, "panicked");
	}));

	Ok(guard)
}
