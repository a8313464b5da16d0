use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::LlmArgs;
use crate::error::ModelError;

/// Text in, text out. The dispatcher and reconciler only see this trait.
pub trait CompletionService {
    fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    fn model_id(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// OpenAI-compatible chat completions client (OpenRouter by default).
pub struct LlmClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    referer: Option<String>,
    title: Option<String>,
    timeout: Duration,
}

impl LlmClient {
    pub fn from_args(args: &LlmArgs) -> Result<Self> {
        let timeout = Duration::from_secs(args.llm_timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create completion HTTP client")?;

        Ok(Self {
            client,
            base_url: args.llm_base_url.clone(),
            model: args.llm_model.clone(),
            api_key: args.llm_api_key.clone().filter(|key| !key.is_empty()),
            referer: args.llm_referer.clone().filter(|value| !value.is_empty()),
            title: args.llm_title.clone().filter(|value| !value.is_empty()),
            timeout,
        })
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        resolve_endpoint(&self.base_url)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout {
                ceiling: self.timeout,
            }
        } else {
            ModelError::Transport(err.to_string())
        }
    }
}

impl CompletionService for LlmClient {
    fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let messages = [Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(referer) = &self.referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.title {
            req = req.header("X-Title", title);
        }

        let started = Instant::now();
        let resp = req.send().map_err(|err| self.map_transport_error(err))?;
        let status = resp.status();
        let text = resp.text().map_err(|err| self.map_transport_error(err))?;

        debug!(
            model = %self.model,
            status = status.as_u16(),
            prompt_chars = prompt.chars().count(),
            elapsed_ms = started.elapsed().as_millis(),
            "completion response received"
        );

        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        extract_completion_text(&text)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

pub fn resolve_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

/// Pulls `choices[0].message.content` out of a completion body.
///
/// OpenRouter reports some upstream failures as a 200 with an `error`
/// object, so that is checked before the choices.
pub fn extract_completion_text(body: &str) -> Result<String, ModelError> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| ModelError::Malformed(format!("body is not JSON: {err}")))?;

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(|value| value.as_str())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| error.to_string());
        let code = error
            .get("code")
            .and_then(|value| value.as_u64())
            .and_then(|code| u16::try_from(code).ok());
        return Err(match code {
            Some(code) if code == 429 || code >= 500 => ModelError::Status {
                status: code,
                body: message,
            },
            _ => ModelError::Malformed(message),
        });
    }

    let choice = json["choices"]
        .get(0)
        .ok_or_else(|| ModelError::Malformed("response has no choices".to_string()))?;

    let content = choice["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    if content.trim().is_empty() {
        return Err(ModelError::EmptyCompletion);
    }

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_endpoint_handles_common_base_urls() {
        assert_eq!(
            resolve_endpoint("https://openrouter.ai/api/v1"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("http://localhost:1234/"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint("http://host/v1/chat/completions"),
            "http://host/v1/chat/completions"
        );
    }

    #[test]
    fn extract_completion_text_reads_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"[{\"id\":1}]"}}]}"#;
        assert_eq!(
            extract_completion_text(body).expect("content present"),
            r#"[{"id":1}]"#
        );
    }

    #[test]
    fn extract_completion_text_classifies_failures() {
        let empty = r#"{"choices":[{"message":{"content":null}}]}"#;
        assert!(matches!(
            extract_completion_text(empty),
            Err(ModelError::EmptyCompletion)
        ));

        let rate_limited = r#"{"error":{"message":"Rate limit exceeded","code":429}}"#;
        let err = extract_completion_text(rate_limited).expect_err("error object");
        assert!(matches!(err, ModelError::Status { status: 429, .. }));
        assert!(err.is_retryable());

        let bad_request = r#"{"error":{"message":"invalid model","code":400}}"#;
        let err = extract_completion_text(bad_request).expect_err("error object");
        assert!(!err.is_retryable());

        let out_of_range = r#"{"error":{"message":"odd upstream","code":66038}}"#;
        let err = extract_completion_text(out_of_range).expect_err("error object");
        assert!(matches!(err, ModelError::Malformed(_)));

        assert!(matches!(
            extract_completion_text("<html>"),
            Err(ModelError::Malformed(_))
        ));
        assert!(matches!(
            extract_completion_text(r#"{"choices":[]}"#),
            Err(ModelError::Malformed(_))
        ));
    }
}
