use std::{env, fmt};

use pipeline_plugin::PipelineError;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_API_ENDPOINT: &str = "http://flowise:3030";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("overrideConfig is not valid JSON: {0}")]
    InvalidOverrideJson(String),

    #[error("overrideConfig must be a JSON object, got {0}")]
    OverrideNotObject(&'static str),

    #[error("apiEndpoint is not a valid URL ({url}): {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("chatflowId is not set")]
    MissingChatflowId,
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> PipelineError {
        PipelineError::Config(err.to_string())
    }
}

/// Settings the host can change between requests.
#[derive(Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Valves {
    /// Base URL of the Flowise server, e.g. `http://flowise:3030`.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Id of the chatflow to run.
    #[serde(default)]
    pub chatflow_id: String,
    /// Sent as a bearer token when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// JSON object forwarded as `overrideConfig` on every prediction.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_override_config"
    )]
    #[schemars(with = "Option<String>")]
    override_config: Option<String>,
    /// Log request and response details.
    #[serde(default)]
    pub debug: bool,
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

impl Default for Valves {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            chatflow_id: String::new(),
            api_key: None,
            override_config: None,
            debug: false,
        }
    }
}

// keep the api key out of logs
impl fmt::Debug for Valves {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Valves")
            .field("api_endpoint", &self.api_endpoint)
            .field("chatflow_id", &self.chatflow_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("override_config", &self.override_config)
            .field("debug", &self.debug)
            .finish()
    }
}

impl Valves {
    pub fn new(api_endpoint: impl Into<String>, chatflow_id: impl Into<String>) -> Self {
        Self {
            api_endpoint: api_endpoint.into(),
            chatflow_id: chatflow_id.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_override_config(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.set_override_config(Some(raw))?;
        Ok(self)
    }

    /// Assign `overrideConfig`. The value must be a JSON object; a blank
    /// string clears it. On error the previous value is kept.
    pub fn set_override_config(&mut self, raw: Option<&str>) -> Result<(), ConfigError> {
        self.override_config = match raw {
            Some(raw) => normalize_override_config(raw)?,
            None => None,
        };
        Ok(())
    }

    pub fn override_config(&self) -> Option<&str> {
        self.override_config.as_deref()
    }

    /// The override config parsed for a request payload.
    pub fn parsed_override_config(&self) -> Option<Result<Map<String, Value>, ConfigError>> {
        self.override_config.as_deref().map(parse_override_object)
    }

    /// Checks what can't be checked field by field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.api_endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            url: self.api_endpoint.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Everything a prediction needs is present.
    pub fn ready(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.chatflow_id.trim().is_empty() {
            return Err(ConfigError::MissingChatflowId);
        }
        Ok(())
    }

    /// `{apiEndpoint}/api/v1/prediction/{chatflowId}`
    pub fn prediction_url(&self) -> String {
        format!(
            "{}/api/v1/prediction/{}",
            self.api_endpoint.trim_end_matches('/'),
            self.chatflow_id
        )
    }

    /// Load from `FLOWISE_*` environment variables, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded .env from {}", path.display()),
            Err(e) => debug!("no .env loaded: {}", e),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut valves = Valves::default();
        if let Some(endpoint) = lookup("FLOWISE_API_ENDPOINT").filter(|s| !s.is_empty()) {
            valves.api_endpoint = endpoint;
        }
        if let Some(chatflow_id) = lookup("FLOWISE_CHATFLOW_ID") {
            valves.chatflow_id = chatflow_id;
        }
        if let Some(api_key) = lookup("FLOWISE_API_KEY") {
            valves = valves.with_api_key(api_key);
        }
        valves.set_override_config(lookup("FLOWISE_OVERRIDE_CONFIG").as_deref())?;
        valves.debug = lookup("FLOWISE_DEBUG").is_some_and(|v| parse_flag(&v));
        valves.validate()?;
        Ok(valves)
    }

    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Valves)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_override_config(raw: &str) -> Result<Option<String>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_override_object(raw)?;
    Ok(Some(raw.to_string()))
}

fn parse_override_object(raw: &str) -> Result<Map<String, Value>, ConfigError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidOverrideJson(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::OverrideNotObject(json_type_name(&other))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn deserialize_override_config<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => normalize_override_config(&raw).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_override_config_accepts_objects() {
        let valves = Valves::default()
            .with_override_config(r#"{"temperature": 0.2, "vars": {"a": 1}}"#)
            .unwrap();
        let parsed = valves.parsed_override_config().unwrap().unwrap();
        assert_eq!(
            Value::Object(parsed),
            json!({"temperature": 0.2, "vars": {"a": 1}})
        );
    }

    #[test]
    fn test_override_config_rejects_non_objects() {
        let mut valves = Valves::default();
        for raw in ["[1,2]", "42", "\"text\"", "null", "true"] {
            assert!(matches!(
                valves.set_override_config(Some(raw)),
                Err(ConfigError::OverrideNotObject(_))
            ));
        }
        assert!(matches!(
            valves.set_override_config(Some("{not json")),
            Err(ConfigError::InvalidOverrideJson(_))
        ));
        assert_eq!(valves.override_config(), None);
    }

    #[test]
    fn test_failed_assignment_keeps_previous_value() {
        let mut valves = Valves::default().with_override_config(r#"{"a":1}"#).unwrap();
        assert!(valves.set_override_config(Some("nope")).is_err());
        assert_eq!(valves.override_config(), Some(r#"{"a":1}"#));

        valves.set_override_config(Some("   ")).unwrap();
        assert_eq!(valves.override_config(), None);
    }

    #[test]
    fn test_deserialize_validates_override_config() {
        let ok: Valves = serde_json::from_value(json!({
            "apiEndpoint": "http://localhost:3000",
            "chatflowId": "abc",
            "overrideConfig": "{\"temperature\": 1}",
            "debug": true
        }))
        .unwrap();
        assert_eq!(ok.chatflow_id, "abc");
        assert!(ok.debug);
        assert_eq!(ok.override_config(), Some("{\"temperature\": 1}"));

        let err = serde_json::from_value::<Valves>(json!({"overrideConfig": "[1]"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_defaults_and_prediction_url() {
        let valves: Valves = serde_json::from_value(json!({})).unwrap();
        assert_eq!(valves.api_endpoint, DEFAULT_API_ENDPOINT);
        assert_eq!(valves.api_key, None);
        assert!(!valves.debug);

        let valves = Valves::new("http://flowise:3030/", "flow-1");
        assert_eq!(
            valves.prediction_url(),
            "http://flowise:3030/api/v1/prediction/flow-1"
        );
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FLOWISE_API_ENDPOINT", "https://flows.example.com"),
            ("FLOWISE_CHATFLOW_ID", "cf-9"),
            ("FLOWISE_API_KEY", "sekret"),
            ("FLOWISE_OVERRIDE_CONFIG", r#"{"sessionId":"s1"}"#),
            ("FLOWISE_DEBUG", "yes"),
        ]);
        let valves = Valves::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(valves.api_endpoint, "https://flows.example.com");
        assert_eq!(valves.chatflow_id, "cf-9");
        assert_eq!(valves.api_key.as_deref(), Some("sekret"));
        assert!(valves.debug);

        let bad = Valves::from_lookup(|k| (k == "FLOWISE_API_ENDPOINT").then(|| "not a url".into()));
        assert!(matches!(bad, Err(ConfigError::InvalidEndpoint { .. })));
    }

    #[test]
    fn test_ready_needs_chatflow_id() {
        assert_eq!(Valves::default().ready(), Err(ConfigError::MissingChatflowId));
        assert_eq!(Valves::new(DEFAULT_API_ENDPOINT, "cf").ready(), Ok(()));
    }

    #[test]
    fn test_debug_output_redacts_api_key() {
        let valves = Valves::default().with_api_key("sekret");
        let printed = format!("{valves:?}");
        assert!(!printed.contains("sekret"));
        assert!(printed.contains("<redacted>"));
    }
}
