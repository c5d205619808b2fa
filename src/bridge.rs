//! stdio Bridge (§4.6): turns a locally spawned subprocess's
//! newline-delimited JSON-RPC stdio into the Streamable HTTP transport.
//!
//! Three long-lived tasks per child: a stdin writer, a stdout dispatcher
//! that resolves pending calls or fans out notifications, and a stderr
//! tail that only logs. Internal request ids are rewritten to a monotone
//! counter so a pending-call table keyed by that counter can restore the
//! client's original id on resolution, and each session's notification
//! queue is bounded and drop-oldest on overflow.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::mcp;
use crate::prelude::*;
use crate::registry::Destination;

const RESTART_DELAYS: [Duration; 3] = [
	Duration::from_millis(500),
	Duration::from_millis(1_000),
	Duration::from_millis(2_000),
];
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG", "TMPDIR", "NPM_CONFIG_CACHE"];

/// What a `PendingCall`'s resolver is ultimately given.
pub enum PendingOutcome {
	Resolved(Value),
	/// The subprocess exited (or the bridge was torn down) before a
	/// matching stdout line arrived.
	BridgeDown,
}

struct PendingCall {
	original_id: Value,
	resolver: oneshot::Sender<PendingOutcome>,
}

/// A bounded FIFO that drops the oldest entry on overflow rather than
/// blocking the stdout dispatcher (§3 invariant, §5 "Notification fan-out
/// is lossy under overflow but never blocks the stdout dispatcher").
///
/// `tokio::sync::mpsc` has no drop-oldest mode, so this is a small
/// hand-rolled ring buffer behind a `Notify`; `notify_one` is sufficient
/// since each queue has exactly one consumer (one `GET` stream).
pub struct NotificationQueue {
	items: StdMutex<VecDeque<Value>>,
	notify: Notify,
	closed: AtomicBool,
	capacity: usize,
}

impl NotificationQueue {
	fn new(capacity: usize) -> Arc<NotificationQueue> {
		Arc::new(NotificationQueue {
			items: StdMutex::new(VecDeque::with_capacity(capacity.min(64))),
			notify: Notify::new(),
			closed: AtomicBool::new(false),
			capacity,
		})
	}

	fn push(&self, value: Value) {
		let mut items = self.items.lock().expect("notification queue lock poisoned");
		if items.len() >= self.capacity {
			items.pop_front();
		}
		items.push_back(value);
		drop(items);
		self.notify.notify_one();
	}

	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}

	/// Dequeues the next notification, or `None` once the queue has been
	/// closed and drained.
	pub async fn pop(&self) -> Option<Value> {
		loop {
			{
				let mut items = self.items.lock().expect("notification queue lock poisoned");
				if let Some(v) = items.pop_front() {
					return Some(v);
				}
				if self.closed.load(Ordering::SeqCst) {
					return None;
				}
			}
			self.notify.notified().await;
		}
	}
}

struct SessionSlot {
	_permit: tokio::sync::OwnedSemaphorePermit,
	queues: Vec<Arc<NotificationQueue>>,
}

struct BridgeState {
	pending: HashMap<u64, PendingCall>,
	sessions: HashMap<String, SessionSlot>,
}

/// One per stdio destination, shared across all of that destination's
/// sessions (§4.6). Owns the pending-call and notification-queue tables by
/// value; handlers only ever see borrowed references for the duration of a
/// request (§9 "Cyclic references... become explicit ownership").
pub struct SubprocessBridge {
	destination: String,
	command: String,
	args: Vec<String>,
	env: HashMap<String, String>,
	notification_queue_capacity: usize,
	restart_budget: u32,
	state: Mutex<BridgeState>,
	stdin_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
	next_internal_id: AtomicU64,
	restart_count: AtomicU32,
	unavailable: AtomicBool,
	child_pid: StdMutex<Option<u32>>,
	shutdown: CancellationToken,
	/// Bounds concurrent sessions to `MaxConnPerDestination` (§3
	/// invariant). Each session holds an owned permit in its
	/// `SessionSlot`, released automatically when the session is removed.
	semaphore: Arc<Semaphore>,
}

impl SubprocessBridge {
	pub fn new(dest: &Destination, max_sessions: usize, notification_queue_capacity: usize, restart_budget: u32) -> Arc<SubprocessBridge> {
		let crate::registry::DestinationKind::Stdio { command, args, env } = &dest.kind else {
			unreachable!("SubprocessBridge::new called with a non-stdio destination");
		};
		Arc::new(SubprocessBridge {
			destination: dest.name.clone(),
			command: command.clone(),
			args: args.clone(),
			env: env.clone(),
			notification_queue_capacity,
			restart_budget,
			state: Mutex::new(BridgeState { pending: HashMap::new(), sessions: HashMap::new() }),
			stdin_tx: StdMutex::new(None),
			next_internal_id: AtomicU64::new(1),
			restart_count: AtomicU32::new(0),
			unavailable: AtomicBool::new(false),
			child_pid: StdMutex::new(None),
			shutdown: CancellationToken::new(),
			semaphore: Arc::new(Semaphore::new(max_sessions)),
		})
	}

	pub fn is_available(&self) -> bool {
		!self.unavailable.load(Ordering::SeqCst)
	}

	/// Spawns the long-lived supervisor task. Must be called once, after
	/// the bridge has been placed behind its final `Arc`.
	pub fn start(self: &Arc<Self>) {
		let bridge = self.clone();
		tokio::spawn(async move { bridge.supervisor_loop().await });
	}

	async fn supervisor_loop(self: Arc<Self>) {
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.spawn_once().await {
				Ok(mut child) => {
					tokio::select! {
						_ = self.shutdown.cancelled() => {
							self.graceful_stop(&mut child).await;
							self.on_exit().await;
							return;
						},
						status = child.wait() => {
							match status {
								Ok(s) => warn!(destination = %self.destination, status = %s, "stdio subprocess exited"),
								Err(e) => warn!(destination = %self.destination, error = %e, "stdio subprocess wait failed"),
							}
						}
					}
				},
				Err(e) => {
					error!(destination = %self.destination, error = %e, "failed to spawn stdio subprocess");
				},
			}
			self.on_exit().await;
			if self.shutdown.is_cancelled() {
				return;
			}
			let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst);
			if attempt >= self.restart_budget {
				error!(destination = %self.destination, "stdio subprocess restart budget exhausted, marking bridge unavailable");
				self.unavailable.store(true, Ordering::SeqCst);
				return;
			}
			let delay = RESTART_DELAYS.get(attempt as usize).copied().unwrap_or(*RESTART_DELAYS.last().unwrap());
			tokio::time::sleep(delay).await;
		}
	}

	async fn spawn_once(self: &Arc<Self>) -> anyhow::Result<Child> {
		let mut cmd = Command::new(&self.command);
		cmd.args(&self.args);
		cmd.stdin(Stdio::piped());
		cmd.stdout(Stdio::piped());
		cmd.stderr(Stdio::piped());
		cmd.kill_on_drop(true);
		cmd.env_clear();
		for key in ENV_ALLOWLIST {
			if let Ok(v) = std::env::var(key) {
				cmd.env(key, v);
			}
		}
		cmd.envs(&self.env);

		let mut child = cmd.spawn().map_err(|e| {
			anyhow::anyhow!("spawning stdio destination {:?} ({} {:?}): {e}", self.destination, self.command, self.args)
		})?;

		*self.child_pid.lock().expect("child pid lock poisoned") = child.id();

		let stdin = child.stdin.take().expect("piped stdin present after spawn");
		let stdout = child.stdout.take().expect("piped stdout present after spawn");
		let stderr = child.stderr.take().expect("piped stderr present after spawn");

		let (tx, mut rx) = mpsc::unbounded_channel::<String>();
		*self.stdin_tx.lock().expect("stdin sender lock poisoned") = Some(tx);
		tokio::spawn(async move {
			let mut stdin = stdin;
			while let Some(line) = rx.recv().await {
				if let Err(e) = stdin.write_all(line.as_bytes()).await {
					tracing::warn!(error = %e, "writing to stdio subprocess stdin failed");
					break;
				}
			}
		});

		let destination = self.destination.clone();
		tokio::spawn(async move {
			let mut lines = BufReader::new(stderr).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				tracing::warn!(destination = %destination, stderr = %line, "stdio subprocess stderr");
			}
		});

		let dispatcher_self = self.clone();
		tokio::spawn(async move {
			let mut lines = BufReader::new(stdout).lines();
			loop {
				match lines.next_line().await {
					Ok(Some(line)) => dispatcher_self.dispatch_stdout_line(&line).await,
					Ok(None) => break,
					Err(e) => {
						tracing::warn!(error = %e, "reading stdio subprocess stdout failed");
						break;
					},
				}
			}
		});

		Ok(child)
	}

	async fn dispatch_stdout_line(&self, line: &str) {
		let Ok(value) = serde_json::from_str::<Value>(line) else {
			tracing::warn!(destination = %self.destination, line, "discarding unparseable stdout line");
			return;
		};
		let id = value.get("id").cloned();
		let internal_id = id.as_ref().and_then(Value::as_u64);
		if let Some(internal_id) = internal_id {
			let entry = {
				let mut state = self.state.lock().await;
				state.pending.remove(&internal_id)
			};
			if let Some(PendingCall { original_id, resolver }) = entry {
				let mut value = value;
				mcp::rewrite_id(&mut value, original_id);
				let _ = resolver.send(PendingOutcome::Resolved(value));
				return;
			}
			tracing::warn!(destination = %self.destination, internal_id, "stdout line matched no pending call, discarding");
			return;
		}
		// Missing or null id: a notification, fanned out to every active
		// notification queue (§4.6 stdout dispatcher).
		let state = self.state.lock().await;
		for slot in state.sessions.values() {
			for queue in &slot.queues {
				queue.push(value.clone());
			}
		}
	}

	async fn on_exit(&self) {
		*self.stdin_tx.lock().expect("stdin sender lock poisoned") = None;
		let mut state = self.state.lock().await;
		for (_, pending) in state.pending.drain() {
			let _ = pending.resolver.send(PendingOutcome::BridgeDown);
		}
		for (_, slot) in state.sessions.drain() {
			for queue in &slot.queues {
				queue.close();
			}
		}
	}

	async fn graceful_stop(&self, child: &mut Child) {
		if let Some(pid) = *self.child_pid.lock().expect("child pid lock poisoned") {
			send_sigterm(pid);
		}
		if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await.is_err() {
			let _ = child.start_kill();
			let _ = child.wait().await;
		}
	}

	/// Signals shutdown; the supervisor loop sends SIGTERM, waits up to 5s,
	/// then SIGKILL (§4.6 "Shutdown").
	pub fn shutdown(&self) {
		self.shutdown.cancel();
	}

	fn write_line(&self, line: String) -> Result<(), ()> {
		let guard = self.stdin_tx.lock().expect("stdin sender lock poisoned");
		match &*guard {
			Some(tx) => tx.send(line).map_err(|_| ()),
			None => Err(()),
		}
	}

	/// `POST /{dest}/mcp` with no `Mcp-Session-Id` header: mints a session,
	/// respecting `MaxConnPerDestination` (§4.6 step 1, §3 invariant).
	pub async fn create_session(self: &Arc<Self>) -> Option<String> {
		let permit = self.semaphore.clone().try_acquire_owned().ok()?;
		let id = mcp::new_mcp_session_id();
		let mut state = self.state.lock().await;
		state.sessions.insert(id.clone(), SessionSlot { _permit: permit, queues: Vec::new() });
		Some(id)
	}

	pub async fn has_session(&self, id: &str) -> bool {
		self.state.lock().await.sessions.contains_key(id)
	}

	/// `DELETE /{dest}/mcp` (§4.6): removes the session and closes its
	/// queues; the permit is released when `SessionSlot` is dropped.
	pub async fn remove_session(&self, id: &str) -> bool {
		let mut state = self.state.lock().await;
		match state.sessions.remove(id) {
			Some(slot) => {
				for queue in &slot.queues {
					queue.close();
				}
				true
			},
			None => false,
		}
	}

	/// `GET /{dest}/mcp` (§4.6): registers a fresh queue for this session
	/// and returns it. Multiple concurrent GET streams on the same session
	/// each get their own queue and receive every notification (§9 open
	/// question: broadcast, not multiplexed).
	pub async fn new_notification_queue(&self, session_id: &str) -> Option<Arc<NotificationQueue>> {
		let mut state = self.state.lock().await;
		let slot = state.sessions.get_mut(session_id)?;
		let queue = NotificationQueue::new(self.notification_queue_capacity);
		slot.queues.push(queue.clone());
		Some(queue)
	}

	/// Writes a fire-and-forget notification to stdin; never waits for a
	/// response (§4.6 step 3).
	pub fn send_notification(&self, body: &Value) -> Result<(), ()> {
		let mut line = serde_json::to_string(body).map_err(|_| ())?;
		line.push('\n');
		self.write_line(line)
	}

	/// Writes a JSON-RPC request to stdin with its id rewritten to a fresh
	/// internal id, and awaits the matching stdout line (§4.6 steps 3-4).
	pub async fn call(&self, mut body: Value, timeout: Duration) -> Result<PendingOutcome, CallError> {
		let original_id = mcp::extract_id(&body).unwrap_or(Value::Null);
		let internal_id = self.next_internal_id.fetch_add(1, Ordering::SeqCst);
		mcp::rewrite_id(&mut body, Value::from(internal_id));

		let (tx, rx) = oneshot::channel();
		{
			let mut state = self.state.lock().await;
			state.pending.insert(internal_id, PendingCall { original_id, resolver: tx });
		}

		let mut line = serde_json::to_string(&body).map_err(|_| CallError::Bridge)?;
		line.push('\n');
		if self.write_line(line).is_err() {
			self.state.lock().await.pending.remove(&internal_id);
			return Err(CallError::Bridge);
		}

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(outcome)) => Ok(outcome),
			Ok(Err(_)) => Err(CallError::Bridge),
			Err(_) => {
				self.state.lock().await.pending.remove(&internal_id);
				Err(CallError::Timeout)
			},
		}
	}
}

#[derive(Debug)]
pub enum CallError {
	Bridge,
	Timeout,
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
	// Best-effort: the child may have already exited.
	unsafe {
		libc::kill(pid as libc::pid_t, libc::SIGTERM);
	}
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{Destination, DestinationKind};
	use crate::scanner::ScannerSettings;

	fn cat_destination() -> Destination {
		Destination {
			name: "cat-dest".into(),
			kind: DestinationKind::Stdio { command: "cat".into(), args: vec![], env: HashMap::new() },
			scanner: ScannerSettings::default(),
		}
	}

	fn build(dest: &Destination) -> Arc<SubprocessBridge> {
		let bridge = SubprocessBridge::new(dest, 10, 256, 3);
		bridge.start();
		bridge
	}

	#[tokio::test]
	async fn echoes_a_call_through_cat_with_id_restored() {
		let dest = cat_destination();
		let bridge = build(&dest);
		// Give `cat` a moment to spawn.
		tokio::time::sleep(Duration::from_millis(50)).await;
		let body = serde_json::json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"});
		let outcome = bridge.call(body, Duration::from_secs(2)).await.unwrap();
		match outcome {
			PendingOutcome::Resolved(v) => assert_eq!(v["id"], serde_json::json!("init")),
			PendingOutcome::BridgeDown => panic!("expected a resolved call"),
		}
		bridge.shutdown();
	}

	#[tokio::test]
	async fn session_capacity_is_enforced() {
		let dest = cat_destination();
		let bridge = SubprocessBridge::new(&dest, 1, 256, 3);
		bridge.start();
		let first = bridge.create_session().await;
		assert!(first.is_some());
		let second = bridge.create_session().await;
		assert!(second.is_none());
		bridge.shutdown();
	}

	#[tokio::test]
	async fn notification_queue_drops_oldest_on_overflow() {
		let queue = NotificationQueue::new(2);
		queue.push(serde_json::json!(1));
		queue.push(serde_json::json!(2));
		queue.push(serde_json::json!(3));
		assert_eq!(queue.pop().await, Some(serde_json::json!(2)));
		assert_eq!(queue.pop().await, Some(serde_json::json!(3)));
	}

	#[tokio::test]
	async fn notification_queue_closes_and_drains() {
		let queue = NotificationQueue::new(4);
		queue.push(serde_json::json!("a"));
		queue.close();
		assert_eq!(queue.pop().await, Some(serde_json::json!("a")));
		assert_eq!(queue.pop().await, None);
	}
}
