//! OpenAI-compatible chat-completions client (Groq, OpenAI, local gateways).
//!
//! One POST to `{base_url}/chat/completions` per call. The body asks for a
//! JSON object response. No retries here: callers decide what a failure means.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

/// HTTP timeout for a single completion round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat-completions provider speaking the OpenAI wire format.
pub struct OpenAiCompatProvider {
    provider: String,
    base_url: String,
    api_key: SecretString,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let provider = provider.into();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout: REQUEST_TIMEOUT,
            client,
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost_or_zero(&self.model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = build_payload(&self.model, &request);

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.provider.clone(),
                reason: if e.is_timeout() {
                    format!("timed out after {:?}", self.timeout)
                } else {
                    e.to_string()
                },
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let detail = resp.text().await.unwrap_or_default();
            return Err(status_error(&self.provider, status, retry_after, &detail));
        }

        let text = resp.text().await.map_err(|e| LlmError::RequestFailed {
            provider: self.provider.clone(),
            reason: format!("Failed to read response body: {e}"),
        })?;

        let response = parse_chat_response(&self.provider, &text)?;
        debug!(
            provider = %self.provider,
            model = %self.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Completion received"
        );
        Ok(response)
    }
}

/// Build the JSON body for a chat-completions call.
fn build_payload(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": request.messages,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if request.json_response {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }
    body
}

/// Map a non-success HTTP status to an `LlmError`.
fn status_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    detail: &str,
) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        _ => {
            let preview: String = detail.chars().take(200).collect();
            LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("status {}: {}", status.as_u16(), preview),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Parse the chat-completions response envelope. Only the envelope is
/// interpreted; the message content is returned as opaque text.
fn parse_chat_response(provider: &str, raw: &str) -> Result<CompletionResponse, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(raw)?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "no choices in response".into(),
        })?;

    let content = choice
        .message
        .content
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "choice has no content".into(),
        })?;

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));

    Ok(CompletionResponse {
        content,
        input_tokens,
        output_tokens,
        finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
        response_id: parsed.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn payload_contains_messages_and_json_mode() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("be precise"),
            ChatMessage::user("EMAIL CONTENT:\nhi"),
        ])
        .with_temperature(0.1)
        .with_json_response();

        let body = build_payload("llama-3.3-70b-versatile", &request);
        assert_eq!(body["model"], "llama-3.3-70b-versatile");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "EMAIL CONTENT:\nhi");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body["temperature"].is_f64());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn payload_without_json_mode_has_no_response_format() {
        let request = CompletionRequest::new(vec![ChatMessage::user("x")]);
        let body = build_payload("m", &request);
        assert!(body.get("response_format").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn parse_response_extracts_content_and_usage() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "{\"action\":\"GENERAL_INFO\"}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 40, "total_tokens": 160}
        }"#;
        let response = parse_chat_response("groq", raw).unwrap();
        assert_eq!(response.content, r#"{"action":"GENERAL_INFO"}"#);
        assert_eq!(response.input_tokens, 120);
        assert_eq!(response.output_tokens, 40);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.response_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn parse_response_without_choices_fails() {
        let err = parse_chat_response("groq", r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn parse_response_invalid_json_fails() {
        let err = parse_chat_response("groq", "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, LlmError::Json(_)));
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error("groq", StatusCode::UNAUTHORIZED, None, ""),
            LlmError::AuthFailed { .. }
        ));
        match status_error(
            "groq",
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "",
        ) {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("Expected RateLimited, got {other:?}"),
        }
        match status_error("groq", StatusCode::BAD_GATEWAY, None, "upstream down") {
            LlmError::RequestFailed { reason, .. } => {
                assert!(reason.contains("502"));
                assert!(reason.contains("upstream down"));
            }
            other => panic!("Expected RequestFailed, got {other:?}"),
        }
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let provider = OpenAiCompatProvider::new(
            "groq",
            "https://api.groq.com/openai/v1/",
            SecretString::from("k"),
            "llama-3.3-70b-versatile",
        )
        .unwrap();
        assert_eq!(
            provider.endpoint(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert!(provider.cost_per_token().0 > Decimal::ZERO);
    }

    #[tokio::test]
    async fn unanswered_request_reports_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let provider = OpenAiCompatProvider::new(
            "groq",
            format!("http://{addr}"),
            SecretString::from("k"),
            "llama-3.3-70b-versatile",
        )
        .unwrap()
        .with_timeout(Duration::from_millis(200));

        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        match provider.complete(request).await {
            Err(LlmError::RequestFailed { reason, .. }) => {
                assert!(reason.contains("timed out"), "reason: {reason}");
            }
            other => panic!("Expected RequestFailed, got {other:?}"),
        }
        server.abort();
    }
}
