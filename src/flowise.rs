use std::sync::Arc;

use async_trait::async_trait;
use pipeline_plugin::{
    ConversationMessage, PipeOutput, Pipeline, PipelineError, PipelineState, wants_stream,
};
use reqwest::{
    Client,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, Valves};
use crate::payload::{RequestPayload, build_history};
use crate::sse::token_stream;

pub const PIPELINE_NAME: &str = "Flowise Pipeline";

#[derive(Debug, Error)]
pub enum FlowiseError {
    #[error("Flowise request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Flowise request failed with status code: {status}")]
    Status { status: u16, body: String },

    #[error("invalid JSON in Flowise response: {0}")]
    InvalidResponse(String),
}

/// Forwards chat turns to a Flowise chatflow and relays the answer.
pub struct FlowisePipeline {
    name: String,
    valves: Arc<Valves>,
    client: Client,
    state: PipelineState,
}

impl FlowisePipeline {
    pub fn new(valves: Valves) -> Result<Self, ConfigError> {
        valves.validate()?;
        Ok(Self {
            name: PIPELINE_NAME.to_string(),
            valves: Arc::new(valves),
            client: Client::new(),
            state: PipelineState::Stopped,
        })
    }

    pub fn valves(&self) -> &Valves {
        &self.valves
    }

    /// Swap in new settings. Requests already running keep the old ones.
    pub fn update_valves(&mut self, valves: Valves) -> Result<(), ConfigError> {
        valves.validate()?;
        if valves.debug {
            info!("{}: valves updated {:?}", self.name, valves);
        }
        self.valves = Arc::new(valves);
        Ok(())
    }

    async fn predict(
        &self,
        valves: &Valves,
        payload: &RequestPayload,
        stream: bool,
    ) -> Result<PipeOutput, FlowiseError> {
        let url = valves.prediction_url();
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(payload);
        if let Some(api_key) = &valves.api_key {
            request = request.bearer_auth(api_key);
        }
        if stream {
            request = request.header(ACCEPT, "text/event-stream");
        }

        let response = request.send().await?;
        let status = response.status();
        if valves.debug {
            info!("pipe: {} answered {}", url, status);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("Flowise error {}: {}", status, body);
            return Err(FlowiseError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if stream {
            Ok(PipeOutput::Stream(token_stream(
                response.bytes_stream(),
                valves.debug,
            )))
        } else {
            let raw = response.text().await?;
            Ok(PipeOutput::Text(extract_answer(&raw)?))
        }
    }
}

/// Build the prediction body for `user_message`. An override config that no
/// longer parses is dropped rather than failing the request.
pub fn build_payload(
    valves: &Valves,
    user_message: &str,
    messages: &[ConversationMessage],
) -> RequestPayload {
    let mut payload = RequestPayload::new(user_message);
    payload.override_config = match valves.parsed_override_config() {
        Some(Ok(config)) => Some(config),
        Some(Err(e)) => {
            if valves.debug {
                warn!("pipe: not attaching overrideConfig: {}", e);
            }
            None
        }
        None => None,
    };
    payload.history = build_history(messages);
    payload
}

/// `text`, else `answer`, else an empty string.
pub fn extract_answer(raw: &str) -> Result<String, FlowiseError> {
    let json: Value =
        serde_json::from_str(raw).map_err(|e| FlowiseError::InvalidResponse(e.to_string()))?;
    let answer = json
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| json.get("answer").and_then(Value::as_str))
        .unwrap_or_default();
    Ok(answer.to_string())
}

#[async_trait]
impl Pipeline for FlowisePipeline {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    async fn on_startup(&mut self) -> Result<(), PipelineError> {
        info!("on_startup: {}", self.name);
        self.state = PipelineState::Starting;
        if let Err(e) = self.valves.ready() {
            error!("on_startup: {} not started: {}", self.name, e);
            self.state = PipelineState::Stopped;
            return Err(e.into());
        }
        self.state = PipelineState::Running;
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<(), PipelineError> {
        info!("on_shutdown: {}", self.name);
        self.state = PipelineState::Stopped;
        Ok(())
    }

    async fn inlet(&self, body: Value, user: Option<Value>) -> Result<Value, PipelineError> {
        info!("inlet: {}", self.name);
        if self.valves.debug {
            info!("inlet: {} - body: {:#}", self.name, body);
            info!("inlet: {} - user: {:?}", self.name, user);
        }
        Ok(body)
    }

    async fn outlet(&self, body: Value, user: Option<Value>) -> Result<Value, PipelineError> {
        info!("outlet: {}", self.name);
        if self.valves.debug {
            info!("outlet: {} - body: {:#}", self.name, body);
            info!("outlet: {} - user: {:?}", self.name, user);
        }
        Ok(body)
    }

    #[tracing::instrument(name = "flowise_pipe", skip_all, fields(model_id = %model_id))]
    async fn pipe(
        &self,
        user_message: &str,
        model_id: &str,
        messages: &[ConversationMessage],
        body: &Value,
    ) -> PipeOutput {
        info!("pipe: {}", self.name);
        // snapshot, so a concurrent update can't change this request midway
        let valves = Arc::clone(&self.valves);
        if valves.debug {
            info!("pipe: {} - received message from user: {}", self.name, user_message);
        }

        let payload = build_payload(&valves, user_message, messages);
        if valves.debug {
            info!(
                "pipe: payload {}",
                serde_json::to_string(&payload).unwrap_or_default()
            );
        }

        match self.predict(&valves, &payload, wants_stream(body)).await {
            Ok(output) => output,
            Err(e) => {
                error!("pipe: {} failed: {}", self.name, e);
                PipeOutput::Text(format!("Error: {e}"))
            }
        }
    }
}
