use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::Thresholds;
use crate::error::ConfigError;
use crate::models::Source;
use crate::retry::RetryPolicy;
use crate::usage::{Operation, Rate, RateTable};

pub const APP_DIR: &str = "signal-sync";

pub const DEFAULT_PROMPT: &str = "You curate reading material for someone interested in: {categories}.
The text below is the content of one web page. Extract the distinct articles, posts, papers, or tools it links to.
Ignore navigation, advertising, and boilerplate. Only use categories from the list above.
Rank each item for how well it fits the categories, how well it fits the reader's interests, and how credible it looks.

{format}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    /// Hosted markdown conversion service.
    #[default]
    Jina,
    /// Fetch the page directly and convert HTML locally.
    Direct,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub jinaai: Option<String>,
    pub openai: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateOverride {
    pub service: String,
    pub operation: Operation,
    pub input_per_1k_micros: u64,
    #[serde(default)]
    pub output_per_1k_micros: u64,
}

/// Raw settings as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sources: Vec<String>,
    pub categories: Vec<String>,
    pub prompt: Option<String>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub quality_threshold: Option<f64>,
    pub concurrency: Option<usize>,
    pub fetch_timeout_secs: Option<u64>,
    pub analysis_timeout_secs: Option<u64>,
    pub model: Option<String>,
    pub max_content_chars: Option<usize>,
    pub converter: ConverterKind,
    pub skip_unchanged: bool,
    pub retry: RetrySettings,
    pub api_keys: ApiKeys,
    pub rates: Vec<RateOverride>,
}

/// Service credentials. Debug output never shows the secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub conversion: Option<String>,
    pub completion: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("conversion", &self.conversion.as_ref().map(|_| "<redacted>"))
            .field("completion", &"<redacted>")
            .finish()
    }
}

/// Immutable, validated configuration for one sync pass.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources: Vec<Source>,
    pub categories: Vec<String>,
    pub prompt_template: String,
    pub thresholds: Thresholds,
    pub credentials: Credentials,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub analysis_timeout: Duration,
    pub model: String,
    pub max_content_chars: usize,
    pub converter: ConverterKind,
    pub skip_unchanged: bool,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub const DEFAULT_CONCURRENCY: usize = 4;
    pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";
    pub const DEFAULT_MAX_CONTENT_CHARS: usize = 30_000;

    /// Configuration with defaults for everything but sources and keys.
    pub fn new(sources: Vec<Source>, credentials: Credentials) -> Self {
        Self {
            sources,
            categories: Vec::new(),
            prompt_template: DEFAULT_PROMPT.to_string(),
            thresholds: Thresholds::default(),
            credentials,
            concurrency: Self::DEFAULT_CONCURRENCY,
            fetch_timeout: Duration::from_secs(Self::DEFAULT_FETCH_TIMEOUT_SECS),
            analysis_timeout: Duration::from_secs(Self::DEFAULT_ANALYSIS_TIMEOUT_SECS),
            model: Self::DEFAULT_MODEL.to_string(),
            max_content_chars: Self::DEFAULT_MAX_CONTENT_CHARS,
            converter: ConverterKind::default(),
            skip_unchanged: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Environment variables take precedence over keys in the file.
    pub fn apply_env_credentials(&mut self) {
        if let Ok(key) = env::var("JINA_API_KEY") {
            self.api_keys.jinaai = Some(key);
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            self.api_keys.openai = Some(key);
        }
    }

    pub fn rate_table(&self) -> RateTable {
        let mut table = RateTable::default();
        for rate in &self.rates {
            table.set(
                rate.service.clone(),
                rate.operation,
                Rate::new(rate.input_per_1k_micros, rate.output_per_1k_micros),
            );
        }
        table
    }

    pub fn validate(&self) -> Result<SyncConfig, ConfigError> {
        let mut sources: Vec<Source> = Vec::new();
        for raw in &self.sources {
            let source = Source::parse(raw)?;
            if !sources.iter().any(|s| s.url == source.url) {
                sources.push(source);
            }
        }
        if sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let completion = non_empty(&self.api_keys.openai)
            .ok_or(ConfigError::MissingCredential("OPENAI_API_KEY"))?;
        let conversion = non_empty(&self.api_keys.jinaai);
        if self.converter == ConverterKind::Jina && conversion.is_none() {
            return Err(ConfigError::MissingCredential("JINA_API_KEY"));
        }

        let thresholds =
            Thresholds::resolve(self.min_threshold, self.max_threshold, self.quality_threshold)?;

        let concurrency = self.concurrency.unwrap_or(SyncConfig::DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }

        let fetch_timeout = positive_secs(
            "fetch_timeout_secs",
            self.fetch_timeout_secs,
            SyncConfig::DEFAULT_FETCH_TIMEOUT_SECS,
        )?;
        let analysis_timeout = positive_secs(
            "analysis_timeout_secs",
            self.analysis_timeout_secs,
            SyncConfig::DEFAULT_ANALYSIS_TIMEOUT_SECS,
        )?;

        let prompt_template = match &self.prompt {
            Some(prompt) if prompt.trim().is_empty() => {
                return Err(ConfigError::InvalidSetting {
                    key: "prompt",
                    reason: "must not be empty".to_string(),
                })
            }
            Some(prompt) => prompt.clone(),
            None => DEFAULT_PROMPT.to_string(),
        };

        let mut retry = RetryPolicy::default();
        if let Some(attempts) = self.retry.max_attempts {
            if attempts == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: "retry.max_attempts",
                    reason: "must be at least 1".to_string(),
                });
            }
            retry.max_attempts = attempts;
        }
        if let Some(ms) = self.retry.base_delay_ms {
            retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry.max_delay_ms {
            retry.max_delay = Duration::from_millis(ms);
        }

        Ok(SyncConfig {
            sources,
            categories: self
                .categories
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            prompt_template,
            thresholds,
            credentials: Credentials {
                conversion,
                completion,
            },
            concurrency,
            fetch_timeout,
            analysis_timeout,
            model: self
                .model
                .clone()
                .unwrap_or_else(|| SyncConfig::DEFAULT_MODEL.to_string()),
            max_content_chars: self
                .max_content_chars
                .unwrap_or(SyncConfig::DEFAULT_MAX_CONTENT_CHARS),
            converter: self.converter,
            skip_unchanged: self.skip_unchanged,
            retry,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn positive_secs(key: &'static str, value: Option<u64>, default: u64) -> Result<Duration, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::InvalidSetting {
            key,
            reason: "must be greater than zero".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

/// Supplies a fresh configuration snapshot at the start of each sync pass.
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Result<SyncConfig, ConfigError>;
}

impl ConfigProvider for SyncConfig {
    fn snapshot(&self) -> Result<SyncConfig, ConfigError> {
        Ok(self.clone())
    }
}

/// Re-reads the configuration file (and environment) on every snapshot, so
/// edits are picked up by the next pass.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::load(&self.path)?;
        settings.apply_env_credentials();
        Ok(settings)
    }
}

impl ConfigProvider for FileConfig {
    fn snapshot(&self) -> Result<SyncConfig, ConfigError> {
        self.settings()?.validate()
    }
}

/// `<config_dir>/signal-sync/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

/// Load a `.env` file from the first location that has one.
pub fn try_load_dotenv() {
    // 1. Current directory (for development)
    if dotenvy::dotenv().is_ok() {
        return;
    }

    // 2. ~/.config/signal-sync/.env
    if let Some(config_dir) = dirs::config_dir() {
        let config_path = config_dir.join(APP_DIR).join(".env");
        if config_path.exists() && dotenvy::from_path(&config_path).is_ok() {
            return;
        }
    }

    // 3. ~/.env
    if let Some(home_dir) = dirs::home_dir() {
        let home_path = home_dir.join(".env");
        if home_path.exists() {
            let _ = dotenvy::from_path(&home_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Settings {
        Settings::from_toml_str(content, Path::new("test.toml")).unwrap()
    }

    const MINIMAL: &str = r#"
sources = ["https://Example.com/blog/", "https://example.com/blog"]
categories = ["AI", " Programming ", ""]

[api_keys]
jinaai = "jina-key"
openai = "openai-key"
"#;

    #[test]
    fn test_minimal_file_gets_defaults() {
        let config = parse(MINIMAL).validate().unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].url, "https://example.com/blog");
        assert_eq!(config.categories, vec!["AI", "Programming"]);
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.concurrency, SyncConfig::DEFAULT_CONCURRENCY);
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.converter, ConverterKind::Jina);
        assert_eq!(config.prompt_template, DEFAULT_PROMPT);
    }

    #[test]
    fn test_legacy_threshold_collapses_band() {
        let settings = parse(&format!("quality_threshold = 0.6\n{}", MINIMAL));
        let config = settings.validate().unwrap();
        assert_eq!(config.thresholds, Thresholds { min: 0.6, max: 0.6 });
    }

    #[test]
    fn test_missing_completion_key_is_fatal() {
        let settings = parse("sources = [\"https://example.com\"]\n[api_keys]\njinaai = \"k\"\n");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingCredential("OPENAI_API_KEY"))
        ));
    }

    #[test]
    fn test_direct_converter_needs_no_conversion_key() {
        let settings = parse(
            "sources = [\"https://example.com\"]\nconverter = \"direct\"\n[api_keys]\nopenai = \"k\"\n",
        );
        let config = settings.validate().unwrap();
        assert_eq!(config.converter, ConverterKind::Direct);
        assert_eq!(config.credentials.conversion, None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_threshold = parse(&format!("min_threshold = 0.9\nmax_threshold = 0.1\n{}", MINIMAL));
        assert!(matches!(bad_threshold.validate(), Err(ConfigError::InvalidThreshold(_))));

        let no_sources = parse("[api_keys]\nopenai = \"k\"\njinaai = \"k\"\n");
        assert!(matches!(no_sources.validate(), Err(ConfigError::NoSources)));

        let bad_source = parse(&MINIMAL.replace("https://Example.com/blog/", "ftp://example.com"));
        assert!(matches!(bad_source.validate(), Err(ConfigError::InvalidSource { .. })));

        let zero_workers = parse(&format!("concurrency = 0\n{}", MINIMAL));
        assert!(matches!(
            zero_workers.validate(),
            Err(ConfigError::InvalidSetting { key: "concurrency", .. })
        ));
    }

    #[test]
    fn test_malformed_toml_reports_path() {
        let err = Settings::from_toml_str("sources = [", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_rate_overrides_extend_defaults() {
        let settings = parse(&format!(
            "{}\n[[rates]]\nservice = \"openai/custom\"\noperation = \"completion\"\ninput_per_1k_micros = 7\noutput_per_1k_micros = 9\n",
            MINIMAL
        ));
        let table = settings.rate_table();
        assert_eq!(
            table.lookup("openai/custom", Operation::Completion),
            Some(Rate::new(7, 9))
        );
        assert!(table.lookup("jina-reader", Operation::Conversion).is_some());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let config = parse(MINIMAL).validate().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("openai-key"));
        assert!(!debug.contains("jina-key"));
    }

    #[test]
    fn test_file_config_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let provider = FileConfig::new(&path);
        assert_eq!(provider.settings().unwrap().sources.len(), 2);

        let missing = FileConfig::new(dir.path().join("missing.toml"));
        assert!(matches!(missing.snapshot(), Err(ConfigError::Io { .. })));
    }
}
