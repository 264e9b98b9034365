//! Drives sync passes across all configured sources.
//!
//! Each source runs the full fetch, analyze, parse, classify, upsert chain
//! on its own; up to `concurrency` sources are in flight at once. A source
//! failure is recorded on the session and never stops the others.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{CompletionClient, ContentAnalyzer};
use crate::classifier::QualityClassifier;
use crate::collection::{ResourceCollection, ResourceQuery};
use crate::config::{ConfigProvider, ConverterKind, SyncConfig};
use crate::dedup::DedupOutcome;
use crate::error::{ConfigError, PersistenceError, SyncError};
use crate::fetcher::{ConversionClient, SourceFetcher};
use crate::models::{Disposition, Resource, Source};
use crate::parser::ResponseParser;
use crate::session::{FailureReason, SourceStatus, SyncCounts, SyncEvent, SyncSession};
use crate::store::Persistence;
use crate::usage::{RateTable, TokenUsageLedger, UsageSummary};

struct Inner {
    config: Arc<dyn ConfigProvider>,
    converters: HashMap<ConverterKind, Arc<dyn ConversionClient>>,
    completer: Arc<dyn CompletionClient>,
    collection: Arc<ResourceCollection>,
    ledger: Arc<TokenUsageLedger>,
    store: Option<Arc<dyn Persistence>>,
    /// Last known state per source URL, carried across passes.
    sources: Mutex<HashMap<String, Source>>,
}

impl Inner {
    fn known_sources(&self) -> MutexGuard<'_, HashMap<String, Source>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SyncOrchestratorBuilder {
    config: Arc<dyn ConfigProvider>,
    completer: Arc<dyn CompletionClient>,
    converters: HashMap<ConverterKind, Arc<dyn ConversionClient>>,
    collection: Option<Arc<ResourceCollection>>,
    ledger: Option<Arc<TokenUsageLedger>>,
    store: Option<Arc<dyn Persistence>>,
}

impl SyncOrchestratorBuilder {
    /// Register the conversion client used when the configuration selects `kind`.
    pub fn converter(mut self, kind: ConverterKind, client: Arc<dyn ConversionClient>) -> Self {
        self.converters.insert(kind, client);
        self
    }

    pub fn collection(mut self, collection: Arc<ResourceCollection>) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn ledger(mut self, ledger: Arc<TokenUsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Without an explicit ledger, one is created with the default rate
    /// table, appending to the store when there is one.
    pub fn build(self) -> SyncOrchestrator {
        let ledger = self.ledger.unwrap_or_else(|| {
            Arc::new(match &self.store {
                Some(store) => TokenUsageLedger::with_store(RateTable::default(), store.clone()),
                None => TokenUsageLedger::new(RateTable::default()),
            })
        });

        SyncOrchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                converters: self.converters,
                completer: self.completer,
                collection: self.collection.unwrap_or_default(),
                ledger,
                store: self.store,
                sources: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Entry point for the presentation layer. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn builder(
        config: Arc<dyn ConfigProvider>,
        completer: Arc<dyn CompletionClient>,
    ) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            config,
            completer,
            converters: HashMap::new(),
            collection: None,
            ledger: None,
            store: None,
        }
    }

    pub fn collection(&self) -> &Arc<ResourceCollection> {
        &self.inner.collection
    }

    pub fn ledger(&self) -> &Arc<TokenUsageLedger> {
        &self.inner.ledger
    }

    /// Hydrate resources and source state from the store. Returns the number
    /// of resources loaded.
    pub fn load_state(&self) -> Result<usize, PersistenceError> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };

        let resources = store.load_resources()?;
        let count = resources.len();
        self.inner.collection.load(resources);

        let sources = store.load_sources()?;
        let mut known = self.inner.known_sources();
        for source in sources {
            known.insert(source.url.clone(), source);
        }

        tracing::info!(resources = count, sources = known.len(), "Loaded stored state");
        Ok(count)
    }

    /// Start a sync pass in the background. The configuration is read once,
    /// here; edits take effect on the next pass. Must be called from within
    /// a tokio runtime.
    pub fn start_sync(&self) -> Result<SyncHandle, ConfigError> {
        let config = self.inner.config.snapshot()?;
        if config.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        let converter = self
            .inner
            .converters
            .get(&config.converter)
            .cloned()
            .ok_or_else(|| ConfigError::InvalidSetting {
                key: "converter",
                reason: format!("no conversion client registered for {:?}", config.converter),
            })?;

        let sources: Vec<Source> = {
            let known = self.inner.known_sources();
            config
                .sources
                .iter()
                .map(|s| known.get(&s.url).cloned().unwrap_or_else(|| s.clone()))
                .collect()
        };

        let session = SyncSession::new(&sources);
        let id = session.id;
        let session = Arc::new(Mutex::new(session));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tracing::info!(
            session_id = %id,
            sources = sources.len(),
            concurrency = config.concurrency,
            model = %config.model,
            "Starting sync"
        );

        let run = SyncRun {
            fetcher: SourceFetcher::new(converter, self.inner.ledger.clone()),
            analyzer: ContentAnalyzer::new(
                self.inner.completer.clone(),
                self.inner.ledger.clone(),
            ),
            parser: ResponseParser::new(config.categories.clone()),
            classifier: QualityClassifier::new(config.thresholds),
            inner: self.inner.clone(),
            config,
            session: session.clone(),
            events: events_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute(sources));

        Ok(SyncHandle {
            id,
            events: events_rx,
            cancel,
            session,
            task,
        })
    }

    pub fn current_resources(&self, query: &ResourceQuery) -> Vec<Resource> {
        self.inner.collection.query(query)
    }

    pub fn usage_summary(&self) -> Result<UsageSummary, PersistenceError> {
        self.inner.ledger.summary()
    }

    /// Set the read flag and persist it. `Ok(None)` when the link is unknown.
    pub fn set_read(&self, link: &str, read: bool) -> Result<Option<Resource>, PersistenceError> {
        let updated = self.inner.collection.set_read(link, read);
        self.persist_annotation(updated)
    }

    pub fn set_notes(&self, link: &str, notes: &str) -> Result<Option<Resource>, PersistenceError> {
        let updated = self.inner.collection.set_notes(link, notes);
        self.persist_annotation(updated)
    }

    fn persist_annotation(
        &self,
        updated: Option<Resource>,
    ) -> Result<Option<Resource>, PersistenceError> {
        if let (Some(resource), Some(store)) = (&updated, &self.inner.store) {
            store.save_resource(resource)?;
        }
        Ok(updated)
    }
}

/// Handle to a running sync pass.
pub struct SyncHandle {
    id: Uuid,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    cancel: CancellationToken,
    session: Arc<Mutex<SyncSession>>,
    task: JoinHandle<SyncSession>,
}

impl SyncHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next progress event; `None` once the pass has finished and every
    /// event was delivered.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Current state of the session.
    pub fn snapshot(&self) -> SyncSession {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Request a cooperative stop. Calls already in flight finish and are
    /// accounted for; sources not yet started are failed as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the pass to finish and return the final session.
    pub async fn wait(self) -> Result<SyncSession, SyncError> {
        self.task
            .await
            .map_err(|e| SyncError::Aborted(e.to_string()))
    }
}

/// Everything one pass needs, owned by the background task.
struct SyncRun {
    inner: Arc<Inner>,
    config: SyncConfig,
    fetcher: SourceFetcher,
    analyzer: ContentAnalyzer,
    parser: ResponseParser,
    classifier: QualityClassifier,
    session: Arc<Mutex<SyncSession>>,
    events: mpsc::UnboundedSender<SyncEvent>,
    cancel: CancellationToken,
}

impl SyncRun {
    async fn execute(self, sources: Vec<Source>) -> SyncSession {
        stream::iter(sources)
            .map(|source| self.process(source))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        let session = {
            let mut session = self.lock_session();
            let events = session.finalize(self.cancel.is_cancelled());
            self.publish(events);
            session.clone()
        };

        tracing::info!(
            session_id = %session.id,
            state = session.state.as_str(),
            done = session.done_count(),
            failed = session.failed_count(),
            new = session.counts.new,
            accepted = session.counts.accepted,
            pending_review = session.counts.pending_review,
            rejected = session.counts.rejected,
            malformed = session.counts.malformed,
            "Sync finished"
        );
        session
    }

    async fn process(&self, mut source: Source) {
        let url = source.url.clone();
        if self.cancel.is_cancelled() {
            self.fail(&url, FailureReason::Cancelled);
            return;
        }

        self.transition(&url, SourceStatus::Fetching);
        let fetched = match self.fetcher.fetch(&source, &self.config, &self.cancel).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(source = %url, error = %e, "Fetch failed");
                self.fail(&url, FailureReason::Fetch(e));
                return;
            }
        };

        let unchanged = source.fingerprint.as_deref() == Some(fetched.fingerprint.as_str());
        source.last_synced = Some(fetched.fetched_at);
        self.update_session(|s| s.set_title(&url, fetched.title.clone()));

        if self.cancel.is_cancelled() {
            tracing::info!(source = %url, "Cancelled after fetch");
            self.remember(&source);
            self.fail(&url, FailureReason::Cancelled);
            return;
        }

        self.transition(&url, SourceStatus::Analyzing);

        if unchanged && self.config.skip_unchanged {
            tracing::info!(source = %url, "Content unchanged, skipping analysis");
            self.remember(&source);
            self.update_session(|s| s.mark_skipped(&url));
            self.transition(&url, SourceStatus::Done);
            return;
        }

        let raw = match self
            .analyzer
            .analyze(&url, &fetched.text, &self.config, &self.cancel)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(source = %url, error = %e, "Analysis failed");
                self.remember(&source);
                self.fail(&url, FailureReason::Analysis(e));
                return;
            }
        };

        let counts = self.curate(&raw, &source);
        // Only a fully analyzed fingerprint may short-circuit a later pass.
        source.fingerprint = Some(fetched.fingerprint);
        self.remember(&source);

        {
            let mut session = self.lock_session();
            if let Some(event) = session.record_counts(&url, counts) {
                self.publish([event]);
            }
        }
        self.transition(&url, SourceStatus::Done);
    }

    /// Parse, classify, and store the items of one completion.
    fn curate(&self, raw: &str, source: &Source) -> SyncCounts {
        let outcome = self.parser.parse(raw, source);
        let mut counts = SyncCounts {
            malformed: outcome.malformed,
            ..Default::default()
        };

        for candidate in &outcome.items {
            counts.seen += 1;
            let disposition = self.classifier.classify(&candidate.rankings);
            match disposition {
                Disposition::Accepted => counts.accepted += 1,
                Disposition::Rejected => counts.rejected += 1,
                Disposition::PendingReview => counts.pending_review += 1,
            }

            let upserted = self.inner.collection.upsert(candidate, disposition);
            match upserted.outcome {
                DedupOutcome::New if upserted.resource.is_some() => counts.new += 1,
                DedupOutcome::New => {}
                DedupOutcome::DuplicateUnchanged => counts.duplicate += 1,
                DedupOutcome::DuplicateUpdated => {
                    counts.duplicate += 1;
                    counts.updated += 1;
                }
            }

            if let Some(resource) = &upserted.resource {
                self.save_resource(resource);
            }
        }

        if counts.malformed > 0 {
            tracing::debug!(
                source = %source.url,
                malformed = counts.malformed,
                "Dropped malformed entries"
            );
        }
        counts
    }

    fn save_resource(&self, resource: &Resource) {
        let Some(store) = &self.inner.store else {
            return;
        };
        if let Err(e) = store.save_resource(resource) {
            tracing::warn!(link = %resource.link, error = %e, "Failed to persist resource");
            self.update_session(|s| {
                s.record_persistence_error(format!("resource {}: {}", resource.link, e))
            });
        }
    }

    /// Keep source state for the next pass, in memory and in the store.
    fn remember(&self, source: &Source) {
        self.inner
            .known_sources()
            .insert(source.url.clone(), source.clone());

        let Some(store) = &self.inner.store else {
            return;
        };
        if let Err(e) = store.save_source(source) {
            tracing::warn!(source = %source.url, error = %e, "Failed to persist source state");
            self.update_session(|s| {
                s.record_persistence_error(format!("source {}: {}", source.url, e))
            });
        }
    }

    fn transition(&self, url: &str, status: SourceStatus) {
        let mut session = self.lock_session();
        if let Some(event) = session.transition(url, status) {
            tracing::debug!(source = url, status = status.as_str(), "Source status changed");
            self.publish([event]);
        }
    }

    fn fail(&self, url: &str, reason: FailureReason) {
        let mut session = self.lock_session();
        let events = session.fail(url, reason);
        self.publish(events);
    }

    fn update_session(&self, change: impl FnOnce(&mut SyncSession)) {
        change(&mut self.lock_session());
    }

    // Events are sent while the session lock is held so that their order
    // matches the order of the state changes.
    fn publish(&self, events: impl IntoIterator<Item = SyncEvent>) {
        for event in events {
            // The receiver may have been dropped; the session still completes.
            let _ = self.events.send(event);
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, SyncSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}
