use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::{GenerationParams, LlmClient};
use crate::error::LlmError;

/// OpenAI-compatible chat-completions client.
///
/// `base_url` should NOT include a trailing slash; the standard
/// `/v1/chat/completions` path is appended.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        request_timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        if api_key.is_empty() {
            return Err(LlmError::Unavailable("no API key configured".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url,
            model,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let body = build_request_body(&self.model, system, user, params);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %self.model, "sending request to LLM provider");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(LlmError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "LLM API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = api_resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("response carried no content".to_string()))?;

        Ok(content)
    }
}

pub(crate) fn build_request_body(
    model: &str,
    system: &str,
    user: &str,
    params: &GenerationParams,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ],
        "temperature": params.temperature,
        "max_tokens": params.max_tokens,
    });
    if params.json_object {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }
    body
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_deterministic_settings() {
        let params = GenerationParams::deterministic(512);
        let body = build_request_body("gpt-4o-mini", "sys", "usr", &params);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
    }

    #[test]
    fn response_format_absent_without_json_mode() {
        let params = GenerationParams {
            temperature: 0.0,
            max_tokens: 64,
            json_object: false,
        };
        let body = build_request_body("m", "s", "u", &params);
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn empty_api_key_rejected() {
        assert!(OpenAiClient::new(String::new(), "http://x".into(), "m".into(), 5).is_err());
    }
}
