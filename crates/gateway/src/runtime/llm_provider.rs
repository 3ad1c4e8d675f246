//! A single OpenAI-compatible `LlmProvider` (§1 "the LLM providers
//! themselves" are an external contract; the core needs exactly one
//! concrete chat capability to run end to end).
//!
//! Trimmed to the one non-streaming `chat` call the domain trait defines:
//! no tool-call wire encoding, no streaming, no Azure URL variant, no
//! key-rotation. Works with OpenAI itself and any endpoint that speaks the
//! same `/chat/completions` contract (Ollama, vLLM, LM Studio, Together).

use sa_domain::config::LlmConfig;
use sa_domain::error::{Error, Result};
use sa_domain::message::{Message, MessageContent, Role};
use sa_domain::provider::{ChatRequest, ChatResponse, LlmProvider};
use serde_json::Value;

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: "openai_compat".to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: config.default_model.clone(),
            client,
        })
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_openai).collect();
        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_openai(msg: &Message) -> Value {
    serde_json::json!({
        "role": role_to_str(msg.role),
        "content": msg.content.extract_all_text(),
    })
}

fn parse_chat_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::Provider {
            provider: provider_id.to_string(),
            message: "no choices in response".to_string(),
        })?
        .to_string();

    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(ChatResponse { content, model })
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);

        tracing::debug!(provider = %self.id, url = %url, "llm chat request");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.id, &resp_json)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_body_defaults_to_configured_model() {
        let config = LlmConfig {
            base_url: "https://example.test/v1".into(),
            api_key_env: "NONEXISTENT_TEST_KEY".into(),
            default_model: "gpt-test".into(),
            timeout_seconds: 5,
        };
        let provider = OpenAiCompatProvider::from_config(&config).unwrap();
        let req = ChatRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let body = provider.build_body(&req);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn parse_chat_response_extracts_content_and_model() {
        let body = serde_json::json!({
            "model": "gpt-test",
            "choices": [{"message": {"content": "hello back"}}],
        });
        let resp = parse_chat_response("openai_compat", &body).unwrap();
        assert_eq!(resp.content, "hello back");
        assert_eq!(resp.model, "gpt-test");
    }

    #[test]
    fn parse_chat_response_errors_on_missing_choices() {
        let body = serde_json::json!({"model": "gpt-test"});
        let err = parse_chat_response("openai_compat", &body).unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }
}
