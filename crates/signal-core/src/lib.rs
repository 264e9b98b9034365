//! Content synchronization and curation pipeline.
//!
//! Sources are converted to text, a language model extracts and ranks the
//! items they link to, and the items are deduplicated, classified, and kept
//! in a queryable collection. Every billed call is priced into a usage ledger.

pub mod analyzer;
pub mod classifier;
pub mod collection;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod jina;
pub mod models;
pub mod openai;
pub mod parser;
pub mod retry;
pub mod session;
pub mod store;
pub mod sync;
pub mod testing;
pub mod usage;

// Re-export commonly used types
pub use analyzer::{Completion, CompletionClient, ContentAnalyzer};
pub use classifier::{QualityClassifier, Thresholds};
pub use collection::{ReadStatus, ResourceCollection, ResourceFilter, ResourceQuery, SortOrder};
pub use config::{
    default_config_path, try_load_dotenv, ConfigProvider, ConverterKind, Credentials, FileConfig,
    Settings, SyncConfig,
};
pub use dedup::{DedupOutcome, Deduplicator};
pub use error::{AnalysisError, ConfigError, FetchError, PersistenceError, SyncError};
pub use extractor::DirectHtmlClient;
pub use fetcher::{Conversion, ConversionClient, SourceFetcher};
pub use jina::JinaReaderClient;
pub use models::{CandidateItem, Disposition, Rankings, RawFetchResult, Resource, Source};
pub use openai::OpenAiClient;
pub use parser::{ParseOutcome, ResponseParser};
pub use retry::RetryPolicy;
pub use session::{
    FailureReason, SessionState, SourceFailure, SourceProgress, SourceStatus, SyncCounts,
    SyncEvent, SyncSession,
};
pub use store::{default_database_path, Persistence, SqliteStore};
pub use sync::{SyncHandle, SyncOrchestrator, SyncOrchestratorBuilder};
pub use usage::{TokenUsageLedger, Usage, UsageRecord, UsageSummary, UsageTotals};
