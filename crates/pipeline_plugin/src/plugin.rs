use std::{fmt, pin::Pin};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::message::{ConversationMessage, PipelineState};

/// Lazily produced chunks of a reply. Pulling the next item drives the
/// underlying read, and once exhausted it cannot be restarted.
pub type TokenStream = Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

/// What `pipe` hands back to the host: either the whole reply at once or a
/// stream of chunks. Failures are already folded into the text.
pub enum PipeOutput {
    Text(String),
    Stream(TokenStream),
}

impl PipeOutput {
    pub fn text(text: impl Into<String>) -> Self {
        PipeOutput::Text(text.into())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, PipeOutput::Stream(_))
    }

    /// Drain the output into its chunks. A `Text` output is a single chunk.
    pub async fn into_chunks(self) -> Vec<String> {
        match self {
            PipeOutput::Text(text) => vec![text],
            PipeOutput::Stream(stream) => stream.collect().await,
        }
    }

    /// Drain the output and concatenate every chunk.
    pub async fn collect_text(self) -> String {
        self.into_chunks().await.concat()
    }
}

impl fmt::Debug for PipeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeOutput::Text(text) => f.debug_tuple("Text").field(text).finish(),
            PipeOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The one trait pipeline authors implement.
///
/// The host owns the pipeline, calls `on_startup` once, then for every chat
/// request runs `inlet`, `pipe` and `outlet` in that order, and finally calls
/// `on_shutdown`.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// The name shown to users in the host's model list.
    fn name(&self) -> String;

    /// What state are we in?
    fn state(&self) -> PipelineState;

    /// Called once before the first request.
    async fn on_startup(&mut self) -> Result<(), PipelineError>;

    /// Called once when the host goes down.
    async fn on_shutdown(&mut self) -> Result<(), PipelineError>;

    /// Pre-processing filter for the incoming request body.
    async fn inlet(&self, body: Value, _user: Option<Value>) -> Result<Value, PipelineError> {
        Ok(body)
    }

    /// Post-processing filter for the outgoing response body.
    async fn outlet(&self, body: Value, _user: Option<Value>) -> Result<Value, PipelineError> {
        Ok(body)
    }

    /// Answer `user_message`. `messages` is the full conversation including
    /// the current message as its last entry. Never fails: errors come back
    /// as text.
    async fn pipe(
        &self,
        user_message: &str,
        model_id: &str,
        messages: &[ConversationMessage],
        body: &Value,
    ) -> PipeOutput;
}

/// Does the host want a streamed reply? Reads `body.stream` with the host's
/// truthiness rules and defaults to `true` when the key is absent.
pub fn wants_stream(body: &Value) -> bool {
    match body.get("stream") {
        None => true,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Errors that a Pipeline implementation can return from its hooks.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The configuration was rejected.
    #[error("configuration error: {0}")]
    Config(String),
}
