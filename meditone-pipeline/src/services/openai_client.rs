//! Text generation client (OpenAI Responses API)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{check_status, ScriptWriter, ServiceError};
use crate::config::OpenAiConfig;

/// Request body for `POST /responses`
#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    max_output_tokens: u32,
}

/// Response body for `POST /responses`
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ResponsesResponse {
    /// Concatenated text of every `output_text` part of every message
    pub fn text(&self) -> String {
        self.output
            .iter()
            .filter(|item| item.kind.as_deref().map_or(true, |k| k == "message"))
            .flat_map(|item| item.content.iter())
            .filter(|part| part.kind.as_deref().map_or(true, |k| k == "output_text"))
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Generation stopped because it hit the output token limit
    pub fn is_truncated(&self) -> bool {
        self.status.as_deref() == Some("incomplete")
            && self
                .incomplete_details
                .as_ref()
                .and_then(|d| d.reason.as_deref())
                == Some("max_output_tokens")
    }

    /// Classify the response into script text or a failure
    pub fn into_script(self) -> Result<String, ServiceError> {
        let text = self.text();
        if self.is_truncated() {
            return Err(ServiceError::Truncated { partial: text });
        }
        if text.trim().is_empty() {
            return Err(ServiceError::Decode(
                "response contained no output text".to_string(),
            ));
        }
        Ok(text)
    }
}

/// Text generation client
pub struct OpenAiClient {
    http_client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            config,
        })
    }
}

#[async_trait]
impl ScriptWriter for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("OPENAI_API_KEY".to_string()))?;

        let body = ResponsesRequest {
            model: &self.config.model,
            input: prompt,
            max_output_tokens: self.config.max_output_tokens,
        };

        tracing::debug!(model = %self.config.model, "Requesting script generation");

        let response = self
            .http_client
            .post(format!("{}/responses", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let parsed: ResponsesResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;

        let truncated = parsed.is_truncated();
        tracing::info!(
            status = parsed.status.as_deref().unwrap_or("unknown"),
            truncated,
            "Script generation response received"
        );

        parsed.into_script()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ResponsesResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_completed_response_yields_text() {
        let response = parse(
            r#"{
                "status": "completed",
                "output": [
                    {"type": "reasoning", "content": []},
                    {"type": "message", "content": [
                        {"type": "output_text", "text": "Close your eyes. "},
                        {"type": "output_text", "text": "Breathe slowly."}
                    ]}
                ]
            }"#,
        );
        assert!(!response.is_truncated());
        assert_eq!(
            response.into_script().unwrap(),
            "Close your eyes. Breathe slowly."
        );
    }

    #[test]
    fn test_token_limit_is_truncation() {
        let response = parse(
            r#"{
                "status": "incomplete",
                "incomplete_details": {"reason": "max_output_tokens"},
                "output": [{"type": "message", "content": [
                    {"type": "output_text", "text": "Close your eyes and"}
                ]}]
            }"#,
        );
        match response.into_script() {
            Err(ServiceError::Truncated { partial }) => {
                assert_eq!(partial, "Close your eyes and")
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_output_is_decode_error() {
        let response = parse(r#"{"status": "completed", "output": []}"#);
        assert!(matches!(
            response.into_script(),
            Err(ServiceError::Decode(_))
        ));
    }
}
