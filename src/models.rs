use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::CompletionError;

// Inbound Telegram update, only the fields the dispatcher reads
#[derive(Deserialize, Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind == "private"
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

// What the dispatcher asks the completion service for
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

// Generated text, and whether it was served from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub cached: bool,
}

// Upstream conversation API
#[derive(Serialize)]
pub struct NewChatRequest<'a> {
    pub name: &'a str,
}

#[derive(Serialize)]
pub struct QuestionRequest<'a> {
    pub model: &'a str,
    pub question: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Deserialize)]
pub struct QuestionResponse {
    #[serde(default)]
    pub assistant: Option<String>,
}

// Queued completion - holds request + response channel
pub struct CompletionJob {
    pub request: CompletionRequest,
    pub response_tx: oneshot::Sender<Result<Completion, CompletionError>>,
}
