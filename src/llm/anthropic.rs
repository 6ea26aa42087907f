use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{GenerationRequest, LlmError, Role, TextGenerator};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: String, model: String, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }
        body
    }
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let result = super::read_body("Anthropic", response).await?;
        let text: String = result["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();

        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::Empty("Anthropic"));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use mockito::Matcher;

    #[tokio::test]
    async fn system_prompt_is_top_level() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "ak-test")
            .match_header("anthropic-version", API_VERSION)
            .match_body(Matcher::PartialJson(serde_json::json!({
                "system": "Be brief.",
                "messages": [{ "role": "user", "content": "Hello" }]
            })))
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"Hi "},{"type":"text","text":"there."}]}"#)
            .create_async()
            .await;

        let client = AnthropicClient::with_base_url("ak-test".into(), "claude-3-5-haiku-latest".into(), &server.url());
        let reply = client
            .generate(&GenerationRequest {
                system: Some("Be brief.".into()),
                messages: vec![ChatMessage::user("Hello")],
                ..Default::default()
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(reply, "Hi there.");
    }

    #[tokio::test]
    async fn api_errors_carry_the_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body(r#"{"type":"error","error":{"type":"rate_limit_error","message":"Slow down"}}"#)
            .create_async()
            .await;

        let client = AnthropicClient::with_base_url("ak-test".into(), "m".into(), &server.url());
        let err = client
            .generate(&GenerationRequest {
                messages: vec![ChatMessage::user("Hello")],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Anthropic error 429: Slow down");
    }
}
