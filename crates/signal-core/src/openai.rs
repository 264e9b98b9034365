use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::analyzer::{Completion, CompletionClient};
use crate::error::AnalysisError;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// OpenAI chat completions client.
pub struct OpenAiClient {
    client: Client,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new() -> Result<Self, AnalysisError> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| AnalysisError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().chars().take(200).collect())
}

fn status_error(status: u16, retry_after: Option<Duration>, body: &str) -> AnalysisError {
    match status {
        429 => AnalysisError::RateLimited { retry_after },
        400 => AnalysisError::MalformedPrompt(error_message(body)),
        _ => AnalysisError::Rejected {
            status,
            message: error_message(body),
        },
    }
}

fn parse_completion(body: &str) -> Result<Completion, AnalysisError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| AnalysisError::Rejected {
            status: 200,
            message: format!("unexpected response body: {}", e),
        })?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    let (input_units, output_units) = response
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));

    Ok(Completion {
        text,
        input_units,
        output_units,
    })
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn service(&self, model: &str) -> String {
        format!("openai/{}", model)
    }

    async fn complete(
        &self,
        prompt: &str,
        text: &str,
        model: &str,
        credential: &str,
    ) -> Result<Completion, AnalysisError> {
        let request = ChatRequest {
            model,
            messages: vec![
                Message {
                    role: "system",
                    content: prompt,
                },
                Message {
                    role: "user",
                    content: text,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", credential))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(CLIENT_TIMEOUT)
                } else {
                    AnalysisError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| AnalysisError::Network(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(status_error(status.as_u16(), retry_after, &body));
        }

        parse_completion(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_reads_text_and_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "1. **Title:** A"}}],
            "usage": {"prompt_tokens": 812, "completion_tokens": 95, "total_tokens": 907}
        }"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.text, "1. **Title:** A");
        assert_eq!(completion.input_units, 812);
        assert_eq!(completion.output_units, 95);
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let completion = parse_completion(r#"{"choices": []}"#).unwrap();
        assert_eq!(completion.text, "");
        assert_eq!(completion.input_units, 0);
    }

    #[test]
    fn test_status_mapping() {
        let body = r#"{"error": {"message": "context length exceeded", "type": "invalid_request_error"}}"#;
        assert_eq!(
            status_error(400, None, body),
            AnalysisError::MalformedPrompt("context length exceeded".to_string())
        );
        assert_eq!(
            status_error(429, Some(Duration::from_secs(7)), body),
            AnalysisError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert_eq!(
            status_error(401, None, "nope"),
            AnalysisError::Rejected {
                status: 401,
                message: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_service_id_includes_model() {
        let client = OpenAiClient::new().unwrap();
        assert_eq!(client.service("gpt-4o-mini"), "openai/gpt-4o-mini");
    }
}
