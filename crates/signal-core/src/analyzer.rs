use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::AnalysisError;
use crate::parser::RESPONSE_FORMAT;
use crate::retry::with_backoff;
use crate::usage::{TokenUsageLedger, Usage};

/// Raw completion text plus the units the service billed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_units: u64,
    pub output_units: u64,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Service identifier for `model`, used for usage pricing.
    fn service(&self, model: &str) -> String;

    async fn complete(
        &self,
        prompt: &str,
        text: &str,
        model: &str,
        credential: &str,
    ) -> Result<Completion, AnalysisError>;
}

/// Fill the prompt template. `{categories}` becomes a comma separated list;
/// `{format}` becomes the response format instructions, which are appended
/// when the template has no placeholder for them.
pub fn render_prompt(template: &str, categories: &[String]) -> Result<String, AnalysisError> {
    if template.trim().is_empty() {
        return Err(AnalysisError::MalformedPrompt(
            "prompt template is empty".to_string(),
        ));
    }

    let prompt = template.replace("{categories}", &categories.join(", "));
    if prompt.contains("{format}") {
        Ok(prompt.replace("{format}", RESPONSE_FORMAT))
    } else {
        Ok(format!("{}\n\n{}", prompt.trim_end(), RESPONSE_FORMAT))
    }
}

/// Truncate to at most `max_chars` characters, never splitting a character.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

pub struct ContentAnalyzer {
    client: Arc<dyn CompletionClient>,
    ledger: Arc<TokenUsageLedger>,
}

impl ContentAnalyzer {
    pub fn new(client: Arc<dyn CompletionClient>, ledger: Arc<TokenUsageLedger>) -> Self {
        Self { client, ledger }
    }

    /// Ask the completion service to extract items from `text`. The response
    /// is returned uninterpreted.
    pub async fn analyze(
        &self,
        source: &str,
        text: &str,
        config: &SyncConfig,
        cancel: &CancellationToken,
    ) -> Result<String, AnalysisError> {
        let prompt = render_prompt(&config.prompt_template, &config.categories)?;
        let content = truncate_chars(text, config.max_content_chars);
        if content.len() < text.len() {
            tracing::debug!(
                source,
                max_chars = config.max_content_chars,
                "Truncated content for analysis"
            );
        }

        let prompt = prompt.as_str();
        let completion = with_backoff(&config.retry, cancel, "analyze", |attempt| async move {
            tracing::debug!(source, attempt, model = %config.model, "Requesting completion");
            self.attempt(prompt, content, config).await
        })
        .await?;

        tracing::info!(
            source,
            input_units = completion.input_units,
            output_units = completion.output_units,
            "Analyzed source"
        );
        Ok(completion.text)
    }

    async fn attempt(
        &self,
        prompt: &str,
        content: &str,
        config: &SyncConfig,
    ) -> Result<Completion, AnalysisError> {
        let call = self.client.complete(
            prompt,
            content,
            &config.model,
            &config.credentials.completion,
        );
        let completion = tokio::time::timeout(config.analysis_timeout, call)
            .await
            .map_err(|_| AnalysisError::Timeout(config.analysis_timeout))??;

        self.ledger.record_logged(Usage::completion(
            self.client.service(&config.model),
            completion.input_units,
            completion.output_units,
        ));
        Ok(completion)
    }
}
