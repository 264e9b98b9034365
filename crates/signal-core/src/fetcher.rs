//! Source retrieval: one conversion call per source, wrapped in timeout,
//! retry, and usage accounting.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::FetchError;
use crate::models::{RawFetchResult, Source};
use crate::retry::with_backoff;
use crate::usage::{TokenUsageLedger, Usage};

/// Normalized text returned by a conversion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub text: String,
    pub title: Option<String>,
    /// Units billed for this call, as reported by the service.
    pub units: u64,
}

#[async_trait]
pub trait ConversionClient: Send + Sync {
    /// Service identifier used for usage pricing.
    fn service(&self) -> &str;

    async fn convert(&self, url: &str, credential: Option<&str>) -> Result<Conversion, FetchError>;
}

pub struct SourceFetcher {
    client: Arc<dyn ConversionClient>,
    ledger: Arc<TokenUsageLedger>,
}

impl SourceFetcher {
    pub fn new(client: Arc<dyn ConversionClient>, ledger: Arc<TokenUsageLedger>) -> Self {
        Self { client, ledger }
    }

    /// Retrieve and normalize one source. Source state is left untouched.
    pub async fn fetch(
        &self,
        source: &Source,
        config: &SyncConfig,
        cancel: &CancellationToken,
    ) -> Result<RawFetchResult, FetchError> {
        let conversion = with_backoff(&config.retry, cancel, "fetch", |attempt| async move {
            tracing::debug!(source = %source.url, attempt, "Converting source");
            self.attempt(source, config).await
        })
        .await?;

        let result = RawFetchResult::new(source.url.clone(), conversion.title, conversion.text);
        tracing::info!(
            source = %source.url,
            title = result.title.as_deref().unwrap_or(""),
            chars = result.length,
            "Fetched source"
        );
        Ok(result)
    }

    async fn attempt(&self, source: &Source, config: &SyncConfig) -> Result<Conversion, FetchError> {
        let call = self
            .client
            .convert(&source.url, config.credentials.conversion.as_deref());

        let outcome = match tokio::time::timeout(config.fetch_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(FetchError::Timeout(config.fetch_timeout)),
        };

        match outcome {
            Ok(conversion) => {
                self.ledger
                    .record_logged(Usage::conversion(self.client.service(), conversion.units));
                if conversion.text.trim().is_empty() {
                    return Err(FetchError::EmptyContent);
                }
                Ok(conversion)
            }
            Err(e) => {
                if let Some(units) = e.billed_units() {
                    self.ledger
                        .record_logged(Usage::conversion(self.client.service(), units));
                }
                Err(e)
            }
        }
    }
}
