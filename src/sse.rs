//! Decoding of the Flowise prediction event stream.
//!
//! Flowise answers a streaming prediction with server-sent events whose data
//! is `{"event":"token","data":"He"}` and closes with `data: [DONE]`.
//! Only `token` events carry reply text, everything else is ignored.

use std::{collections::VecDeque, fmt::Display, pin::Pin};

use eventsource_stream::{EventStream, EventStreamError, Eventsource};
use futures::{Stream, StreamExt, stream};
use pipeline_plugin::TokenStream;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

pub const DONE_MARKER: &str = "[DONE]";

/// One decoded `data:` payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    /// The text carried by a `token` event.
    pub fn token(&self) -> Option<&str> {
        if self.event == "token" {
            self.data.as_str()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// Blank, or an event without text.
    Skip,
    Done,
    Token(String),
    /// Not a valid JSON event.
    Malformed { raw: String, reason: String },
}

/// Classify one line of an SSE event's data.
pub fn parse_data(data: &str) -> EventData {
    let payload = data.trim();
    if payload.is_empty() {
        return EventData::Skip;
    }
    if payload == DONE_MARKER {
        return EventData::Done;
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => match event.token() {
            Some(token) => EventData::Token(token.to_string()),
            None => EventData::Skip,
        },
        Err(e) => EventData::Malformed {
            raw: payload.to_string(),
            reason: e.to_string(),
        },
    }
}

struct TokenState<S> {
    events: Pin<Box<EventStream<S>>>,
    // data lines of events already received but not yet handed out
    pending: VecDeque<String>,
    finished: bool,
    debug: bool,
}

/// Turn a raw event-stream body into the reply tokens.
///
/// Reading is pull-driven: the body is only polled when the consumer asks for
/// the next token. A transport or framing error ends the stream after one
/// `"Error: ..."` chunk.
pub fn token_stream<S, B, E>(body: S, debug: bool) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = TokenState {
        events: Box::pin(body.eventsource()),
        pending: VecDeque::new(),
        finished: false,
        debug,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            while let Some(data) = state.pending.pop_front() {
                match parse_data(&data) {
                    EventData::Token(token) => return Some((token, state)),
                    EventData::Done => return None,
                    EventData::Malformed { raw, reason } => {
                        if state.debug {
                            warn!("skipping malformed stream event {:?}: {}", raw, reason);
                        }
                    }
                    EventData::Skip => {}
                }
            }
            if state.finished {
                return None;
            }
            match state.events.next().await {
                // consecutive data lines arrive joined by '\n', each is its own event
                Some(Ok(event)) => state
                    .pending
                    .extend(event.data.lines().map(str::to_string)),
                Some(Err(e)) => {
                    state.pending.clear();
                    state.finished = true;
                    let message = match e {
                        EventStreamError::Transport(e) => format!("Error: {e}"),
                        other => format!("Error: {other}"),
                    };
                    return Some((message, state));
                }
                None => return None,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> Vec<Result<Vec<u8>, String>> {
        parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_parse_data_variants() {
        assert_eq!(parse_data(""), EventData::Skip);
        assert_eq!(parse_data("[DONE]"), EventData::Done);
        assert_eq!(
            parse_data(r#"{"event":"token","data":"He"}"#),
            EventData::Token("He".into())
        );
        assert_eq!(parse_data(r#"{"event":"start","data":""}"#), EventData::Skip);
        assert_eq!(parse_data(r#"{"event":"token","data":42}"#), EventData::Skip);
        assert!(matches!(parse_data("not-json"), EventData::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_token_stream_yields_tokens_in_order() {
        let body = stream::iter(chunks(&[
            "data: {\"event\":\"start\",\"data\":\"\"}\n\n",
            "data: {\"event\":\"token\",\"data\":\"He\"}\n\n",
            "data: not-json\n\n",
            "data: {\"event\":\"tok",
            "en\",\"data\":\"llo\"}\n\n",
            "data: [DONE]\n\n",
            "data: {\"event\":\"token\",\"data\":\"after done\"}\n\n",
        ]));
        let tokens: Vec<String> = token_stream(body, true).collect().await;
        assert_eq!(tokens, vec!["He", "llo"]);
    }

    #[tokio::test]
    async fn test_token_stream_accepts_cr_and_crlf_terminators() {
        let body = stream::iter(chunks(&[
            "data: {\"event\":\"token\",\"data\":\"He\"}\r\r",
            "data: {\"event\":\"token\",\"data\":\"llo\"}\r\n\r\n",
            "data: [DONE]\r\r",
        ]));
        let tokens: Vec<String> = token_stream(body, false).collect().await;
        assert_eq!(tokens, vec!["He", "llo"]);
    }

    #[tokio::test]
    async fn test_token_stream_splits_multi_line_events() {
        let body = stream::iter(chunks(&[
            "event: message\n",
            "data: {\"event\":\"token\",\"data\":\"He\"}\n",
            "data: {\"event\":\"token\",\"data\":\"llo\"}\n",
            "data: [DONE]\n\n",
        ]));
        let tokens: Vec<String> = token_stream(body, false).collect().await;
        assert_eq!(tokens, vec!["He", "llo"]);
    }

    #[tokio::test]
    async fn test_token_stream_reports_transport_error() {
        let body = stream::iter(vec![
            Ok(b"data: {\"event\":\"token\",\"data\":\"par\"}\n\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"data: {\"event\":\"token\",\"data\":\"never\"}\n\n".to_vec()),
        ]);
        let tokens: Vec<String> = token_stream(body, false).collect().await;
        assert_eq!(tokens, vec!["par", "Error: connection reset"]);
    }
}
