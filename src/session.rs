//! Legacy SSE session map (§4.3/§5): tracks the per-client message-posting
//! URL minted from an upstream `event: endpoint` frame.
//!
//! An `RwLock<HashMap<SessionId, Session>>` guards session state shared
//! between the GET stream task and POST handlers.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::RngCore;
use reqwest::Url;

use crate::error::ClientError;
use crate::prelude::*;

pub const SESSION_ID_MIN_LEN: usize = 8;
pub const SESSION_ID_MAX_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct LegacySession {
	pub destination: String,
	pub upstream_message_url: Url,
}

pub fn is_valid_session_id(id: &str) -> bool {
	(SESSION_ID_MIN_LEN..=SESSION_ID_MAX_LEN).contains(&id.len())
		&& id
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Mints a session id satisfying `[A-Za-z0-9_-]{8,128}`: the URL-safe,
/// unpadded base64 encoding of 24 random bytes yields exactly 32 characters
/// drawn from that alphabet.
pub fn mint_session_id() -> String {
	use base64::Engine;
	let mut bytes = [0u8; 24];
	rand::rng().fill_bytes(&mut bytes);
	base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug)]
pub struct LegacySessionMap {
	sessions: RwLock<HashMap<String, LegacySession>>,
	max_sessions: usize,
}

impl LegacySessionMap {
	pub fn new(max_sessions: usize) -> LegacySessionMap {
		LegacySessionMap {
			sessions: RwLock::new(HashMap::new()),
			max_sessions,
		}
	}

	pub fn insert(&self, id: String, session: LegacySession) -> Result<(), ClientError> {
		let mut sessions = self.sessions.write().expect("session map lock poisoned");
		if sessions.len() >= self.max_sessions && !sessions.contains_key(&id) {
			// The map is full enough that we treat this as an internal
			// capacity condition rather than a client error; callers map
			// this the same way as any other server-side overload.
			warn!(len = sessions.len(), "legacy session map at capacity");
			return Err(ClientError::Malformed);
		}
		sessions.insert(id, session);
		Ok(())
	}

	pub fn get(&self, id: &str) -> Option<LegacySession> {
		self.sessions.read().expect("session map lock poisoned").get(id).cloned()
	}

	pub fn remove(&self, id: &str) {
		self.sessions.write().expect("session map lock poisoned").remove(id);
	}
}
