//! Line-level SSE forwarding shared by the legacy SSE handler and the
//! Streamable HTTP SSE passthrough path (§6.3).
//!
//! This relays someone else's byte stream rather than originating events,
//! so framing has to be preserved exactly; decoding happens at the line
//! level via `tokio_util`'s `LinesCodec` rather than through a typed event
//! stream.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::prelude::*;

/// What to do with one field line of an SSE frame being relayed.
pub enum LineOutcome {
	/// Forward the line unmodified.
	Keep,
	/// Forward a replacement line's value instead (field name unchanged).
	Replace(String),
	/// Stop relaying and surface an error record; no more lines are sent.
	Abort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseLineKind {
	Data,
	Event,
	Id,
	Retry,
}

fn classify(line: &str) -> Option<(SseLineKind, &str)> {
	if let Some(rest) = line.strip_prefix("data:") {
		Some((SseLineKind::Data, rest.strip_prefix(' ').unwrap_or(rest)))
	} else if let Some(rest) = line.strip_prefix("event:") {
		Some((SseLineKind::Event, rest.strip_prefix(' ').unwrap_or(rest)))
	} else if let Some(rest) = line.strip_prefix("id:") {
		Some((SseLineKind::Id, rest.strip_prefix(' ').unwrap_or(rest)))
	} else if let Some(rest) = line.strip_prefix("retry:") {
		Some((SseLineKind::Retry, rest.strip_prefix(' ').unwrap_or(rest)))
	} else {
		None
	}
}

/// Relays an upstream byte stream as an SSE body, calling `on_line` for
/// every recognized field line. Comment lines (`:...`) are forwarded
/// verbatim, untouched by `on_line` — upstreams use them as keepalives and
/// the client needs to see them to avoid a spurious idle timeout. Anything
/// that doesn't match the SSE field grammar at all is dropped silently,
/// matching how permissive real SSE consumers treat unknown lines. Blank
/// lines (event terminators) are always forwarded as-is.
pub fn forward_sse<S, E>(
	upstream: S,
	mut on_line: impl FnMut(SseLineKind, &str) -> LineOutcome + Send + 'static,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
	S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
	E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
	let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);

	tokio::spawn(async move {
		let mapped = upstream.map(|r| r.map_err(|e| std::io::Error::other(e.into())));
		let reader = StreamReader::new(mapped);
		let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(1 << 20));

		loop {
			match lines.next().await {
				None => break,
				Some(Err(e)) => {
					let _ = tx.send(Err(std::io::Error::other(e))).await;
					break;
				},
				Some(Ok(line)) => {
					if line.is_empty() {
						if tx.send(Ok(Bytes::from_static(b"\n"))).await.is_err() {
							break;
						}
						continue;
					}
					if line.starts_with(':') {
						if tx.send(Ok(Bytes::from(format!("{line}\n")))).await.is_err() {
							break;
						}
						continue;
					}
					let Some((kind, value)) = classify(&line) else {
						continue;
					};
					let (prefix, out_value) = match on_line(kind, value) {
						LineOutcome::Keep => (field_prefix(kind), value.to_string()),
						LineOutcome::Replace(v) => (field_prefix(kind), v),
						LineOutcome::Abort(msg) => {
							warn!(error = %msg, "aborting sse relay");
							let _ = tx.send(Err(std::io::Error::other(msg))).await;
							break;
						},
					};
					let out = format!("{prefix}: {out_value}\n");
					if tx.send(Ok(Bytes::from(out))).await.is_err() {
						break;
					}
				},
			}
		}
	});

	ReceiverStream::new(rx)
}

fn field_prefix(kind: SseLineKind) -> &'static str {
	match kind {
		SseLineKind::Data => "data",
		SseLineKind::Event => "event",
		SseLineKind::Id => "id",
		SseLineKind::Retry => "retry",
	}
}

#[cfg(test)]
mod tests {
	use futures_util::stream;

	use super::*;

	#[tokio::test]
	async fn passes_through_unmodified_lines() {
		let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
			Ok(Bytes::from_static(b"event: message\ndata: hello\n\n")),
		];
		let out = forward_sse(stream::iter(chunks), |_, _| LineOutcome::Keep);
		let collected: Vec<_> = out.collect().await;
		let text: String = collected
			.into_iter()
			.map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
			.collect();
		assert_eq!(text, "event: message\ndata: hello\n\n");
	}

	#[tokio::test]
	async fn rewrites_targeted_data_lines() {
		let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
			Ok(Bytes::from_static(b"event: endpoint\ndata: /message?sid=abc\n\n")),
		];
		let mut saw_event = false;
		let out = forward_sse(stream::iter(chunks), move |kind, value| {
			if kind == SseLineKind::Event && value == "endpoint" {
				saw_event = true;
			}
			if kind == SseLineKind::Data && saw_event {
				LineOutcome::Replace("/rewritten".to_string())
			} else {
				LineOutcome::Keep
			}
		});
		let collected: Vec<_> = out.collect().await;
		let text: String = collected
			.into_iter()
			.map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
			.collect();
		assert_eq!(text, "event: endpoint\ndata: /rewritten\n\n");
	}

	#[tokio::test]
	async fn forwards_comments_and_drops_unknown_lines() {
		let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
			Ok(Bytes::from_static(b": comment\nbogus line\ndata: x\n\n")),
		];
		let out = forward_sse(stream::iter(chunks), |_, _| LineOutcome::Keep);
		let collected: Vec<_> = out.collect().await;
		let text: String = collected
			.into_iter()
			.map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
			.collect();
		assert_eq!(text, ": comment\ndata: x\n\n");
	}
}
