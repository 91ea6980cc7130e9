//! Shared streaming machinery used by every adapter.
//!
//! An adapter turns its HTTP response into a stream of raw payloads (SSE
//! `data:` values or NDJSON lines) and hands them, together with its
//! [`StreamDecoder`], to [`pump`]. The pump forwards decoded events through an
//! [`Emitter`], which owns the `start`/`metrics`/`done`/`error` framing and
//! the timing bookkeeping.

use crate::error::ProviderError;
use crate::metrics::MetricsTracker;
use crate::traits::EventSink;
use crate::types::{StreamEvent, Usage};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tokio_util::sync::CancellationToken;

/// Decodes one provider's raw payloads into [`StreamEvent`]s.
pub(crate) trait StreamDecoder: Send {
    /// Decode one payload.
    ///
    /// A malformed payload yields no events. `Err` is reserved for errors the
    /// provider reports inside the stream, which end the invocation.
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamEvent>, ProviderError>;

    /// Flush anything still pending once the stream ends.
    fn finish(&mut self) -> Vec<StreamEvent>;

    /// Whether the provider signalled the end of the response.
    fn is_complete(&self) -> bool;

    /// Usage reported by the provider so far.
    fn usage(&self) -> Option<Usage>;
}

/// Frames the events of one adapter invocation.
pub(crate) struct Emitter<'a> {
    sink: &'a mut EventSink<'a>,
    tracker: MetricsTracker,
    input_chars: usize,
    output_chars: usize,
}

impl<'a> Emitter<'a> {
    /// Emit `start` and begin timing.
    pub(crate) fn start(sink: &'a mut EventSink<'a>, input_chars: usize) -> Self {
        sink(StreamEvent::Start);
        Self {
            sink,
            tracker: MetricsTracker::start(),
            input_chars,
            output_chars: 0,
        }
    }

    /// Forward decoded events, updating first-byte and output accounting.
    pub(crate) fn forward(&mut self, events: Vec<StreamEvent>) {
        for event in events {
            if event.is_content() {
                self.tracker.mark_first_byte();
            }
            self.output_chars += match &event {
                StreamEvent::Delta { text } | StreamEvent::Thinking { text } => text.len(),
                StreamEvent::ToolDelta { delta, .. } => delta.len(),
                _ => 0,
            };
            (self.sink)(event);
        }
    }

    /// Emit the terminal `metrics` + `done` pair.
    pub(crate) fn finish(self, usage: Option<Usage>) {
        let metrics = self
            .tracker
            .finish(usage, self.input_chars, self.output_chars);
        (self.sink)(StreamEvent::Metrics(metrics));
        (self.sink)(StreamEvent::Done);
    }

    /// Emit a terminal `error` and hand the error back. Cancellation is silent.
    pub(crate) fn fail(self, err: ProviderError) -> ProviderError {
        if !err.is_cancelled() {
            (self.sink)(StreamEvent::Error {
                message: err.to_string(),
            });
        }
        err
    }
}

/// Run `future` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = future => result,
    }
}

/// Drive `payloads` through `decoder` until the stream ends, the provider
/// signals completion, or `cancel` fires.
pub(crate) async fn pump<S, D>(
    mut payloads: S,
    mut decoder: D,
    mut emitter: Emitter<'_>,
    cancel: &CancellationToken,
) -> Result<(), ProviderError>
where
    S: Stream<Item = Result<String, ProviderError>> + Unpin,
    D: StreamDecoder,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(emitter.fail(ProviderError::Cancelled)),
            next = payloads.next() => next,
        };

        match next {
            None => break,
            Some(Ok(payload)) => match decoder.decode(&payload) {
                Ok(events) => emitter.forward(events),
                Err(err) => return Err(emitter.fail(err)),
            },
            Some(Err(err)) => return Err(emitter.fail(err)),
        }

        if decoder.is_complete() {
            break;
        }
    }

    let trailing = decoder.finish();
    emitter.forward(trailing);
    emitter.finish(decoder.usage());
    Ok(())
}

/// Turn an [`EventSource`] into a stream of `data:` payloads.
///
/// The event source is closed on the first error so it never reconnects.
pub(crate) fn sse_payloads(
    mut source: EventSource,
) -> BoxStream<'static, Result<String, ProviderError>> {
    source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));
    stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        loop {
            match source.next().await {
                None => return None,
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => {
                    return Some((Ok(message.data), Some(source)));
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    source.close();
                    return None;
                }
                Some(Err(err)) => {
                    source.close();
                    return Some((Err(eventsource_error(err).await), None));
                }
            }
        }
    })
    .boxed()
}

async fn eventsource_error(err: reqwest_eventsource::Error) -> ProviderError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            if status.as_u16() == 401 || status.as_u16() == 403 {
                ProviderError::Auth(format!("HTTP {status}: {body}"))
            } else {
                ProviderError::ApiError {
                    status: status.as_u16(),
                    body,
                }
            }
        }
        reqwest_eventsource::Error::InvalidContentType(content_type, response) => {
            let body = response.text().await.unwrap_or_default();
            ProviderError::StreamError(format!(
                "unexpected content type {content_type:?}: {body}"
            ))
        }
        reqwest_eventsource::Error::Transport(err) => ProviderError::Http(err),
        other => ProviderError::StreamError(other.to_string()),
    }
}

/// Turn a newline-delimited JSON response body into a stream of lines.
pub(crate) fn ndjson_payloads(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String, ProviderError>> {
    let bytes = response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
        .boxed();
    lines_from_chunks(bytes)
}

struct LineState {
    chunks: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    lines: LineBuffer,
    ready: VecDeque<String>,
    exhausted: bool,
}

fn lines_from_chunks(
    chunks: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
) -> BoxStream<'static, Result<String, ProviderError>> {
    let state = LineState {
        chunks,
        lines: LineBuffer::default(),
        ready: VecDeque::new(),
        exhausted: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.exhausted {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.lines.push(&chunk)),
                Some(Err(err)) => {
                    state.exhausted = true;
                    return Some((Err(ProviderError::Http(err)), state));
                }
                None => {
                    state.exhausted = true;
                    state.ready.extend(state.lines.flush());
                }
            }
        }
    })
    .boxed()
}

/// Splits a byte stream into non-empty lines without breaking UTF-8
/// sequences that straddle chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every complete line it finished.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Return the trailing line, if the body did not end with a newline.
    pub(crate) fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Reconstructs incremental reasoning text from backends that resend the
/// whole reasoning value on every chunk.
///
/// When the incoming value extends everything seen so far, only the new
/// suffix is emitted; otherwise it is treated as a plain delta and emitted
/// verbatim. A snapshot that rewrites earlier text is emitted in full.
#[derive(Debug, Default)]
pub struct SnapshotDiff {
    seen: String,
}

impl SnapshotDiff {
    /// Feed the next value and get the text to emit, if any.
    pub fn next(&mut self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let delta = match value.strip_prefix(self.seen.as_str()) {
            Some(suffix) if !self.seen.is_empty() => {
                let suffix = suffix.to_string();
                self.seen = value.to_string();
                suffix
            }
            _ => {
                self.seen.push_str(value);
                value.to_string()
            }
        };
        (!delta.is_empty()).then_some(delta)
    }
}

/// Parse accumulated argument text. Empty text means "no arguments".
pub fn parse_arguments(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Value::Object(Default::default()));
    }
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(error = %err, arguments = raw, "unparsable tool arguments");
            None
        }
    }
}

/// Fresh tool-call id for backends that do not send one.
pub fn synthesize_call_id() -> String {
    format!("call_{}", ulid::Ulid::new().to_string().to_lowercase())
}

/// Events for a tool call that arrived in one piece.
pub(crate) fn complete_tool_call(
    id: String,
    name: String,
    arguments: Option<Value>,
) -> Vec<StreamEvent> {
    vec![
        StreamEvent::ToolStart {
            id: id.clone(),
            name: name.clone(),
        },
        StreamEvent::ToolComplete {
            id,
            name,
            arguments,
        },
    ]
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl ToolCallBuilder {
    fn complete(self) -> StreamEvent {
        StreamEvent::ToolComplete {
            arguments: parse_arguments(&self.arguments),
            id: self.id,
            name: self.name,
        }
    }
}

/// Accumulates index-addressed tool-call fragments.
///
/// `ToolStart` is emitted once the call's name is known, argument fragments
/// are forwarded as `ToolDelta`, and `ToolComplete` is produced when the
/// caller finalizes the call.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, ToolCallBuilder>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment for the call at `index`.
    pub fn push(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Vec<StreamEvent> {
        let call = self.calls.entry(index).or_default();
        let mut events = Vec::new();

        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if !call.started {
                call.id = id.to_string();
            }
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            if !call.started {
                call.name.push_str(name);
            }
        }
        let fragment = arguments.unwrap_or_default();

        if !call.started && !call.name.is_empty() {
            call.started = true;
            if call.id.is_empty() {
                call.id = synthesize_call_id();
            }
            events.push(StreamEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
            });
            // Fragments that arrived before the name.
            if !call.arguments.is_empty() {
                events.push(StreamEvent::ToolDelta {
                    id: call.id.clone(),
                    delta: call.arguments.clone(),
                });
            }
        }

        if !fragment.is_empty() {
            call.arguments.push_str(fragment);
            if call.started {
                events.push(StreamEvent::ToolDelta {
                    id: call.id.clone(),
                    delta: fragment.to_string(),
                });
            }
        }

        events
    }

    /// Finalize the call at `index`, if it was started.
    pub fn finish_index(&mut self, index: u64) -> Option<StreamEvent> {
        let call = self.calls.remove(&index)?;
        call.started.then(|| call.complete())
    }

    /// Finalize every started call in index order.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter(|call| call.started)
            .map(ToolCallBuilder::complete)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_diff_strips_common_prefix() {
        let mut diff = SnapshotDiff::default();
        let emitted: Vec<String> = ["Let", "Let me", "Let me think"]
            .iter()
            .filter_map(|s| diff.next(s))
            .collect();
        assert_eq!(emitted, vec!["Let", " me", " think"]);
        assert_eq!(emitted.concat(), "Let me think");
    }

    #[test]
    fn test_snapshot_diff_passes_plain_deltas_through() {
        let mut diff = SnapshotDiff::default();
        let emitted: Vec<String> = ["Let", " me", " think"]
            .iter()
            .filter_map(|s| diff.next(s))
            .collect();
        assert_eq!(emitted.concat(), "Let me think");
    }

    #[test]
    fn test_snapshot_diff_ignores_repeated_snapshot() {
        let mut diff = SnapshotDiff::default();
        assert_eq!(diff.next("abc").as_deref(), Some("abc"));
        assert_eq!(diff.next("abc"), None);
        assert_eq!(diff.next(""), None);
    }

    #[test]
    fn test_accumulator_joins_fragments() {
        let mut acc = ToolCallAccumulator::new();
        let start = acc.push(0, Some("call_1"), Some("calc"), Some("{\"a\":"));
        assert_eq!(
            start,
            vec![
                StreamEvent::ToolStart {
                    id: "call_1".to_string(),
                    name: "calc".to_string()
                },
                StreamEvent::ToolDelta {
                    id: "call_1".to_string(),
                    delta: "{\"a\":".to_string()
                },
            ]
        );
        acc.push(0, None, None, Some("1}"));
        let done = acc.finish();
        assert_eq!(
            done,
            vec![StreamEvent::ToolComplete {
                id: "call_1".to_string(),
                name: "calc".to_string(),
                arguments: Some(json!({"a": 1})),
            }]
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn test_accumulator_malformed_arguments_complete_without_arguments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_1"), Some("calc"), Some("{\"a\":"));
        acc.push(0, None, None, Some("oops"));
        match acc.finish_index(0) {
            Some(StreamEvent::ToolComplete { arguments, .. }) => assert!(arguments.is_none()),
            other => panic!("expected ToolComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_interleaved_indices_and_synthesized_id() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(1, None, Some("second"), None);
        acc.push(0, Some("first_id"), Some("first"), Some("{}"));
        acc.push(1, None, None, Some("{\"x\":true}"));
        let done = acc.finish();
        assert_eq!(done.len(), 2);
        match (&done[0], &done[1]) {
            (
                StreamEvent::ToolComplete { id: a, name: na, .. },
                StreamEvent::ToolComplete {
                    id: b,
                    name: nb,
                    arguments,
                },
            ) => {
                assert_eq!(a, "first_id");
                assert_eq!(na, "first");
                assert!(b.starts_with("call_"));
                assert_eq!(nb, "second");
                assert_eq!(arguments, &Some(json!({"x": true})));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_empty_arguments_become_empty_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("c"), Some("now"), Some(""));
        match acc.finish_index(0) {
            Some(StreamEvent::ToolComplete { arguments, .. }) => {
                assert_eq!(arguments, Some(json!({})))
            }
            other => panic!("expected ToolComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_line_buffer_handles_split_utf8_and_trailing_line() {
        let mut lines = LineBuffer::default();
        let text = "{\"a\":\"é\"}\n{\"b\":1}";
        let bytes = text.as_bytes();
        // Split inside the two-byte 'é'.
        let split = text.find('é').unwrap() + 1;
        assert!(lines.push(&bytes[..split]).is_empty());
        assert_eq!(lines.push(&bytes[split..]), vec!["{\"a\":\"é\"}".to_string()]);
        assert_eq!(lines.flush().as_deref(), Some("{\"b\":1}"));
        assert_eq!(lines.flush(), None);
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancel_without_error_event() {
        struct Never;
        impl StreamDecoder for Never {
            fn decode(&mut self, _: &str) -> Result<Vec<StreamEvent>, ProviderError> {
                Ok(vec![])
            }
            fn finish(&mut self) -> Vec<StreamEvent> {
                vec![]
            }
            fn is_complete(&self) -> bool {
                false
            }
            fn usage(&self) -> Option<Usage> {
                None
            }
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut events = Vec::new();
        let result = {
            let mut sink = |event: StreamEvent| events.push(event);
            let emitter = Emitter::start(&mut sink, 0);
            pump(
                stream::pending::<Result<String, ProviderError>>(),
                Never,
                emitter,
                &cancel,
            )
            .await
        };
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert_eq!(events, vec![StreamEvent::Start]);
    }
}
