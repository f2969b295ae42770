//! OpenAI-compatible chat client.
//!
//! Used for one-off questions and connectivity checks. Bulk evaluation
//! goes through the batch API instead (see [`super::batch`]).

use crate::config::LlmConfig;
use crate::error::{EvalError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One prompt message, as sent both online and in batch rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// First choice's text. A null content is an empty reply.
fn reply_text(body: &str) -> Result<String> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| EvalError::LlmParse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.unwrap_or_default())
        .ok_or_else(|| EvalError::LlmApi("No choices in response".to_string()))
}

/// Chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }

    /// Send `messages` and return the reply text.
    pub async fn chat(&self, messages: &[Message]) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(EvalError::LlmApi(format!("Request failed ({}): {}", status, detail)));
        }

        reply_text(&body)
    }

    /// System instruction plus one user message.
    pub async fn ask(&self, system: &str, user: &str) -> Result<String> {
        self.chat(&[Message::system(system), Message::user(user)])
            .await
    }

    /// Check that the API answers a trivial prompt.
    pub async fn test_connection(&self) -> Result<()> {
        let reply = self
            .chat(&[Message::user("Say 'hello' and nothing else.")])
            .await?;

        if reply.to_lowercase().contains("hello") {
            Ok(())
        } else {
            Err(EvalError::LlmApi(format!("Unexpected response: {}", reply)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(Message::system("rules")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "system", "content": "rules"}));
        assert_eq!(Message::user("q").role, Role::User);
    }

    #[test]
    fn test_reply_text_takes_first_choice() {
        let body = r#"{"choices": [{"message": {"content": "B"}}, {"message": {"content": "C"}}]}"#;
        assert_eq!(reply_text(body).unwrap(), "B");
    }

    #[test]
    fn test_null_content_is_empty_reply() {
        let body = r#"{"choices": [{"message": {"content": null}, "finish_reason": "stop"}]}"#;
        assert_eq!(reply_text(body).unwrap(), "");
    }

    #[test]
    fn test_reply_errors() {
        assert!(matches!(
            reply_text(r#"{"choices": []}"#),
            Err(EvalError::LlmApi(_))
        ));
        assert!(matches!(reply_text("not json"), Err(EvalError::LlmParse(_))));
    }

    #[test]
    fn test_request_shape() {
        let messages = [Message::system("s"), Message::user("u")];
        let request = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: 16,
            temperature: 0.0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["max_tokens"], 16);
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn test_endpoint_construction() {
        for base in ["https://api.example.com/", "https://api.example.com"] {
            let client = LlmClient::new(LlmConfig {
                api_base: base.to_string(),
                ..Default::default()
            });
            assert_eq!(client.endpoint(), "https://api.example.com/v1/chat/completions");
        }
    }
}
