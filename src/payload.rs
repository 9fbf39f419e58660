use pipeline_plugin::{ConversationMessage, Role};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /api/v1/prediction/{chatflowId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub question: String,
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_config: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryMessage>>,
}

impl RequestPayload {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            streaming: true,
            override_config: None,
            history: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryRole {
    #[serde(rename = "userMessage")]
    UserMessage,
    #[serde(rename = "apiMessage")]
    ApiMessage,
}

impl From<Role> for HistoryRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => HistoryRole::UserMessage,
            _ => HistoryRole::ApiMessage,
        }
    }
}

/// Everything but the last message, which is the question being asked.
/// `None` when there is no earlier turn.
pub fn build_history(messages: &[ConversationMessage]) -> Option<Vec<HistoryMessage>> {
    if messages.len() <= 1 {
        return None;
    }
    let earlier = &messages[..messages.len() - 1];
    Some(
        earlier
            .iter()
            .map(|m| HistoryMessage {
                role: m.role.into(),
                content: m.content.clone(),
            })
            .collect(),
    )
}
