use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;

use crate::error::FetchError;
use crate::fetcher::{Conversion, ConversionClient};
use crate::usage::DIRECT_HTML;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const TEXT_WIDTH: usize = 100;

/// Fetches pages directly and converts the HTML locally. Nothing is billed.
pub struct DirectHtmlClient {
    client: Client,
}

impl DirectHtmlClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .user_agent("Mozilla/5.0 (compatible; SignalSync/0.1)")
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Title and plain text for an HTML document.
pub fn html_to_text(html: &str) -> (Option<String>, String) {
    let title = extract_title(html);
    let text = html2text::from_read(html.as_bytes(), TEXT_WIDTH);
    (title, text.trim().to_string())
}

#[async_trait]
impl ConversionClient for DirectHtmlClient {
    fn service(&self) -> &str {
        DIRECT_HTML
    }

    async fn convert(&self, url: &str, _credential: Option<&str>) -> Result<Conversion, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(CLIENT_TIMEOUT)
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ServiceRejected {
                status: status.as_u16(),
                message: format!("HTTP error: {}", status),
                billed_units: None,
            });
        }

        let html = response
            .text()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read response body: {}", e)))?;

        let (title, text) = html_to_text(&html);
        Ok(Conversion {
            text,
            title,
            units: 0,
        })
    }
}
