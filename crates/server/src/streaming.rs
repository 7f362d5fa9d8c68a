use ai_proxy_core::error::ProxyError;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::StreamExt;
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;

/// Build an SSE response from a stream of data strings.
///
/// Each string in the stream can be:
/// - Plain JSON data (will be wrapped in `data: ...\n\n`)
/// - `"[DONE]"` sentinel (emitted as `data: [DONE]\n\n`)
/// - Multi-line with `event:` prefix for Claude SSE (e.g. `"event: message_start\ndata: {...}"`)
/// - Empty string (skipped)
pub fn build_sse_response(
    data_stream: impl Stream<Item = Result<String, ProxyError>> + Send + 'static,
    keepalive_seconds: u64,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = data_stream
        .filter_map(|result| async move {
            match result {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some(Ok(data)),
                Err(e) => Some(Err(e)),
            }
        })
        .flat_map(|result| {
            let items: Vec<Result<Event, Infallible>> = match result {
                Ok(data) => parse_chunk(&data),
                Err(e) => {
                    let error_json =
                        serde_json::json!({"error": {"message": e.to_string()}});
                    vec![Ok(Event::default().data(error_json.to_string()))]
                }
            };
            futures::stream::iter(items)
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(keepalive_seconds))
            .text(""),
    )
}

/// Parse one chunk string into one or more SSE events.
///
/// A chunk in the single `"event: TYPE\ndata: PAYLOAD"` shape (native
/// Claude/Codex passthrough, built by pairing a [`StreamChunk`]'s
/// `event_type` with its `data`) must become exactly one [`Event`] with
/// both fields set — splitting it line-by-line would emit a bare
/// `event:` frame with no data and a bare `data:` frame with no type,
/// which is not how a client interprets it. Anything else (translated
/// output, raw JSON, `[DONE]`) is one independent `data:`-only frame per
/// line, the historical behavior for those paths.
fn parse_chunk(data: &str) -> Vec<Result<Event, Infallible>> {
    let mut lines = data.split('\n').map(str::trim).filter(|l| !l.is_empty());
    if let (Some(first), Some(second), None) = (lines.next(), lines.next(), lines.next())
        && let Some(event_type) = first.strip_prefix("event: ")
        && let Some(payload) = second.strip_prefix("data: ")
    {
        return vec![Ok(Event::default().event(event_type).data(payload))];
    }

    let mut events = Vec::new();
    for line in data.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "[DONE]" {
            events.push(Ok(Event::default().data("[DONE]")));
        } else if let Some(rest) = line.strip_prefix("data: ") {
            events.push(Ok(Event::default().data(rest)));
        } else if let Some(rest) = line.strip_prefix("event: ") {
            events.push(Ok(Event::default().event(rest)));
        } else {
            events.push(Ok(Event::default().data(line)));
        }
    }
    events
}
