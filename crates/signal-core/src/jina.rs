use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::FetchError;
use crate::fetcher::{Conversion, ConversionClient};
use crate::usage::JINA_READER;

const DEFAULT_ENDPOINT: &str = "https://r.jina.ai/";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
struct ReaderResponse {
    #[serde(default)]
    data: Option<ReaderPage>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "readableMessage")]
    readable_message: Option<String>,
    #[serde(default)]
    meta: Option<ReaderMeta>,
}

#[derive(Debug, Deserialize)]
struct ReaderMeta {
    #[serde(default)]
    usage: Option<ReaderUsage>,
}

#[derive(Debug, Deserialize)]
struct ReaderPage {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    usage: Option<ReaderUsage>,
}

#[derive(Debug, Deserialize)]
struct ReaderUsage {
    #[serde(default)]
    tokens: u64,
}

impl ReaderResponse {
    /// Tokens billed for the call, from the page or the response envelope.
    fn billed_tokens(&self) -> Option<u64> {
        self.data
            .as_ref()
            .and_then(|d| d.usage.as_ref())
            .or_else(|| self.meta.as_ref().and_then(|m| m.usage.as_ref()))
            .map(|u| u.tokens)
    }

    /// A missing page converts to empty text, keeping its billed tokens so
    /// the fetcher records them before reporting empty content.
    fn into_conversion(self) -> Conversion {
        let units = self.billed_tokens().unwrap_or(0);
        match self.data {
            Some(page) => Conversion {
                text: page.content.unwrap_or_default(),
                title: page.title.filter(|t| !t.trim().is_empty()),
                units,
            },
            None => Conversion {
                text: String::new(),
                title: None,
                units,
            },
        }
    }
}

/// Client for the Jina reader, which renders a page and returns markdown.
pub struct JinaReaderClient {
    client: Client,
    endpoint: String,
}

impl JinaReaderClient {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .user_agent("Mozilla/5.0 (compatible; SignalSync/0.1)")
            .build()
            .map_err(|e| FetchError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn request_url(&self, url: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), url)
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(CLIENT_TIMEOUT)
    } else {
        FetchError::Network(e.to_string())
    }
}

fn rejection(status: u16, body: &str) -> FetchError {
    let parsed = serde_json::from_str::<ReaderResponse>(body).ok();
    let billed_units = parsed
        .as_ref()
        .and_then(ReaderResponse::billed_tokens)
        .filter(|tokens| *tokens > 0);
    let message = parsed
        .and_then(|r| r.readable_message.or(r.message))
        .unwrap_or_else(|| body.trim().chars().take(200).collect());

    FetchError::ServiceRejected {
        status,
        message,
        billed_units,
    }
}

#[async_trait]
impl ConversionClient for JinaReaderClient {
    fn service(&self) -> &str {
        JINA_READER
    }

    async fn convert(&self, url: &str, credential: Option<&str>) -> Result<Conversion, FetchError> {
        let mut request = self
            .client
            .get(self.request_url(url))
            .header("Accept", "application/json");
        if let Some(key) = credential {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(rejection(status.as_u16(), &body));
        }

        let parsed: ReaderResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::ServiceRejected {
                status: status.as_u16(),
                message: format!("unexpected response body: {}", e),
                billed_units: None,
            })?;

        Ok(parsed.into_conversion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_prefixes_reader_endpoint() {
        let client = JinaReaderClient::new().unwrap();
        assert_eq!(
            client.request_url("https://example.com/blog?page=2"),
            "https://r.jina.ai/https://example.com/blog?page=2"
        );
    }

    #[test]
    fn test_rejection_reads_message_and_usage() {
        let body = r#"{"data":{"usage":{"tokens":42}},"code":422,"readableMessage":"Failed to render page"}"#;
        assert_eq!(
            rejection(422, body),
            FetchError::ServiceRejected {
                status: 422,
                message: "Failed to render page".to_string(),
                billed_units: Some(42),
            }
        );
    }

    #[test]
    fn test_rejection_with_plain_body() {
        let err = rejection(503, "Service Unavailable\n");
        assert_eq!(
            err,
            FetchError::ServiceRejected {
                status: 503,
                message: "Service Unavailable".to_string(),
                billed_units: None,
            }
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_reader_page_deserializes() {
        let body = r#"{"code":200,"status":20000,"data":{"title":"Blog","url":"https://x.com","content":"Hello","usage":{"tokens":12}}}"#;
        let parsed: ReaderResponse = serde_json::from_str(body).unwrap();
        let page = parsed.data.unwrap();
        assert_eq!(page.title.as_deref(), Some("Blog"));
        assert_eq!(page.content.as_deref(), Some("Hello"));
        assert_eq!(page.usage.unwrap().tokens, 12);
    }

    #[test]
    fn test_null_page_keeps_billed_tokens() {
        let body = r#"{"code":200,"status":20000,"data":null,"meta":{"usage":{"tokens":9}}}"#;
        let parsed: ReaderResponse = serde_json::from_str(body).unwrap();
        let conversion = parsed.into_conversion();
        assert_eq!(conversion.text, "");
        assert_eq!(conversion.title, None);
        assert_eq!(conversion.units, 9);

        let body = r#"{"code":200,"data":null}"#;
        let parsed: ReaderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_conversion().units, 0);
    }

    #[test]
    fn test_page_usage_wins_over_envelope() {
        let body = r#"{"data":{"title":" ","content":"Hi","usage":{"tokens":4}},"meta":{"usage":{"tokens":99}}}"#;
        let parsed: ReaderResponse = serde_json::from_str(body).unwrap();
        let conversion = parsed.into_conversion();
        assert_eq!(conversion.units, 4);
        assert_eq!(conversion.title, None);
        assert_eq!(conversion.text, "Hi");
    }
}
