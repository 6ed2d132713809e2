use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Markdown,
}

impl ParseMode {
    fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Markdown => "Markdown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: Option<ParseMode>,
    pub reply_to: Option<i64>,
    pub disable_preview: bool,
}

impl SendOptions {
    pub fn reply_to(message_id: i64) -> Self {
        Self {
            reply_to: Some(message_id),
            ..Self::default()
        }
    }

    // Formatted card replies; their footer links should not unfurl
    pub fn markdown_reply_to(message_id: i64) -> Self {
        Self {
            parse_mode: Some(ParseMode::Markdown),
            reply_to: Some(message_id),
            disable_preview: true,
        }
    }
}

// Outbound side of the messaging platform. send_message returns the new message id.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        options: SendOptions,
    ) -> Result<i64, TransportError>;

    async fn send_typing(&self, chat_id: i64) -> Result<(), TransportError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError>;
}

// Bot API envelope: {"ok": bool, "result": T, "description": "..."}
#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramTransport {
    pub fn new(client: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        debug!(method, "Calling Bot API");
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        match response {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(TransportError::Api {
                method,
                description: description.unwrap_or_else(|| "no result".to_string()),
            }),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        options: SendOptions,
    ) -> Result<i64, TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": options.disable_preview,
        });
        if let Some(mode) = options.parse_mode {
            body["parse_mode"] = json!(mode.as_str());
        }
        if let Some(reply_to) = options.reply_to {
            body["reply_to_message_id"] = json!(reply_to);
        }

        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), TransportError> {
        let _: bool = self
            .call("sendChatAction", json!({ "chat_id": chat_id, "action": "typing" }))
            .await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_keeps_description() {
        let raw = r#"{"ok": false, "error_code": 400, "description": "Bad Request: chat not found"}"#;
        let parsed: ApiResponse<SentMessage> = serde_json::from_str(raw).unwrap();
        assert!(!parsed.ok);
        assert!(parsed.result.is_none());
        assert_eq!(parsed.description.as_deref(), Some("Bad Request: chat not found"));
    }

    #[test]
    fn success_envelope_carries_message_id() {
        let raw = r#"{"ok": true, "result": {"message_id": 5, "date": 1}}"#;
        let parsed: ApiResponse<SentMessage> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.unwrap().message_id, 5);
    }

    #[test]
    fn markdown_replies_disable_previews() {
        let options = SendOptions::markdown_reply_to(9);
        assert_eq!(options.parse_mode.map(|m| m.as_str()), Some("Markdown"));
        assert_eq!(options.reply_to, Some(9));
        assert!(options.disable_preview);
        assert!(!SendOptions::reply_to(9).disable_preview);
    }

    #[test]
    fn base_url_embeds_token() {
        let transport =
            TelegramTransport::new(reqwest::Client::new(), "https://api.telegram.org/", "123:abc");
        assert_eq!(transport.base_url, "https://api.telegram.org/bot123:abc");
    }

    #[tokio::test]
    async fn send_message_carries_formatting_options() {
        use axum::routing::post;
        use axum::{Json, Router};
        use std::sync::{Arc, Mutex};

        let bodies = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&bodies);
        let app = Router::new().route(
            "/bot123:abc/sendMessage",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(body);
                    Json(json!({"ok": true, "result": {"message_id": 31}}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport =
            TelegramTransport::new(reqwest::Client::new(), &format!("http://{}", addr), "123:abc");
        let id = transport
            .send_message(-5, "*card*", SendOptions::markdown_reply_to(4))
            .await
            .unwrap();
        assert_eq!(id, 31);

        let bodies = bodies.lock().unwrap();
        let body = &bodies[0];
        assert_eq!(body["parse_mode"], "Markdown");
        assert_eq!(body["disable_web_page_preview"], true);
        assert_eq!(body["reply_to_message_id"], 4);
    }
}
