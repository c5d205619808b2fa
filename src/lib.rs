//! Reverse proxy for the Model Context Protocol (MCP).
//!
//! Multiplexes three transports onto a per-destination URL prefix: legacy
//! MCP-over-SSE, modern MCP Streamable HTTP, and a stdio bridge that
//! surfaces a local subprocess as Streamable HTTP.

pub mod prelude {
	pub use std::collections::HashMap;
	pub use std::net::SocketAddr;
	pub use std::sync::Arc;
	pub use std::time::Duration;

	pub use tracing::{debug, error, info, trace, warn};
}

use crate::prelude::*;

pub mod audit;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod mcp;
pub mod registry;
pub mod router;
pub mod scanner;
pub mod session;
pub mod sse;
pub mod telemetry;

pub use config::Config;
pub use error::ProxyError;
pub use registry::{Destination, DestinationKind, Registry};
pub use router::Core;
