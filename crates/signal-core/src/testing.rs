//! Test doubles for the external collaborators.
//!
//! These let applications exercise the whole pipeline without network access
//! or a database: scripted conversion and completion services, and an
//! in-memory store whose writes can be made to fail.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::analyzer::{Completion, CompletionClient};
use crate::error::{AnalysisError, FetchError, PersistenceError};
use crate::fetcher::{Conversion, ConversionClient};
use crate::models::{normalize_link, Resource, Source};
use crate::store::Persistence;
use crate::usage::{UsageRecord, UsageTotals, JINA_READER};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory [`Persistence`] with switchable write failures.
#[derive(Default)]
pub struct MemoryStore {
    resources: Mutex<HashMap<String, Resource>>,
    usage: Mutex<Vec<UsageRecord>>,
    sources: Mutex<HashMap<String, Source>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn resources(&self) -> Vec<Resource> {
        lock(&self.resources).values().cloned().collect()
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        lock(&self.usage).clone()
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Persistence for MemoryStore {
    fn load_resources(&self) -> Result<Vec<Resource>, PersistenceError> {
        Ok(self.resources())
    }

    fn save_resource(&self, resource: &Resource) -> Result<(), PersistenceError> {
        self.check_writable()?;
        lock(&self.resources).insert(resource.link.clone(), resource.clone());
        Ok(())
    }

    fn load_usage_totals(&self) -> Result<UsageTotals, PersistenceError> {
        Ok(UsageTotals::from_records(lock(&self.usage).iter()))
    }

    fn append_usage_record(&self, record: &UsageRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        lock(&self.usage).push(record.clone());
        Ok(())
    }

    fn load_sources(&self) -> Result<Vec<Source>, PersistenceError> {
        Ok(lock(&self.sources).values().cloned().collect())
    }

    fn save_source(&self, source: &Source) -> Result<(), PersistenceError> {
        self.check_writable()?;
        lock(&self.sources).insert(source.url.clone(), source.clone());
        Ok(())
    }
}

fn script_key(url: &str) -> String {
    normalize_link(url).unwrap_or_else(|| url.to_string())
}

#[derive(Default)]
struct ConverterScript {
    response: Option<Result<Conversion, FetchError>>,
    failures: VecDeque<FetchError>,
    delay: Option<Duration>,
}

/// Conversion service that answers from a per-URL script.
pub struct ScriptedConverter {
    service: String,
    scripts: Mutex<HashMap<String, ConverterScript>>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConverter {
    pub fn new() -> Self {
        Self {
            service: JINA_READER.to_string(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn page(self, url: &str, text: &str, units: u64) -> Self {
        self.set_page(url, None, text, units);
        self
    }

    pub fn page_with_title(self, url: &str, title: &str, text: &str, units: u64) -> Self {
        self.set_page(url, Some(title), text, units);
        self
    }

    pub fn fail(self, url: &str, error: FetchError) -> Self {
        self.script(url, |s| s.response = Some(Err(error)));
        self
    }

    /// Fail the next `times` calls for `url` before answering normally.
    pub fn fail_first(self, url: &str, times: usize, error: FetchError) -> Self {
        self.script(url, |s| {
            s.failures.extend(std::iter::repeat(error).take(times));
        });
        self
    }

    pub fn delay(self, url: &str, delay: Duration) -> Self {
        self.script(url, |s| s.delay = Some(delay));
        self
    }

    /// Replace the page served for `url`, e.g. between two sync passes.
    pub fn set_page(&self, url: &str, title: Option<&str>, text: &str, units: u64) {
        let conversion = Conversion {
            text: text.to_string(),
            title: title.map(str::to_string),
            units,
        };
        self.script(url, |s| s.response = Some(Ok(conversion)));
    }

    /// URLs requested so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn script(&self, url: &str, change: impl FnOnce(&mut ConverterScript)) {
        change(lock(&self.scripts).entry(script_key(url)).or_default());
    }
}

#[async_trait]
impl ConversionClient for ScriptedConverter {
    fn service(&self) -> &str {
        &self.service
    }

    async fn convert(&self, url: &str, _credential: Option<&str>) -> Result<Conversion, FetchError> {
        lock(&self.calls).push(url.to_string());

        let (delay, outcome) = {
            let mut scripts = lock(&self.scripts);
            match scripts.get_mut(&script_key(url)) {
                Some(script) => {
                    let outcome = match script.failures.pop_front() {
                        Some(error) => Err(error),
                        None => script.response.clone().unwrap_or(Err(FetchError::EmptyContent)),
                    };
                    (script.delay, outcome)
                }
                None => (
                    None,
                    Err(FetchError::ServiceRejected {
                        status: 404,
                        message: format!("no scripted page for {}", url),
                        billed_units: None,
                    }),
                ),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

#[derive(Default)]
struct CompleterScript {
    response: Option<Result<Completion, AnalysisError>>,
    delay: Option<Duration>,
}

/// Completion service that answers from a script keyed on the content text.
pub struct ScriptedCompleter {
    scripts: Mutex<HashMap<String, CompleterScript>>,
    received: Mutex<Vec<String>>,
}

impl Default for ScriptedCompleter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCompleter {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, text: &str, response: &str, input_units: u64, output_units: u64) -> Self {
        self.set_response(text, response, input_units, output_units);
        self
    }

    pub fn fail(self, text: &str, error: AnalysisError) -> Self {
        self.script(text, |s| s.response = Some(Err(error)));
        self
    }

    pub fn delay(self, text: &str, delay: Duration) -> Self {
        self.script(text, |s| s.delay = Some(delay));
        self
    }

    pub fn set_response(&self, text: &str, response: &str, input_units: u64, output_units: u64) {
        let completion = Completion {
            text: response.to_string(),
            input_units,
            output_units,
        };
        self.script(text, |s| s.response = Some(Ok(completion)));
    }

    /// Content texts received so far, in call order.
    pub fn received(&self) -> Vec<String> {
        lock(&self.received).clone()
    }

    fn script(&self, text: &str, change: impl FnOnce(&mut CompleterScript)) {
        change(lock(&self.scripts).entry(text.to_string()).or_default());
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompleter {
    fn service(&self, model: &str) -> String {
        format!("openai/{}", model)
    }

    async fn complete(
        &self,
        _prompt: &str,
        text: &str,
        _model: &str,
        _credential: &str,
    ) -> Result<Completion, AnalysisError> {
        lock(&self.received).push(text.to_string());

        let unscripted = AnalysisError::Rejected {
            status: 404,
            message: "no scripted response".to_string(),
        };
        let (delay, outcome) = {
            let scripts = lock(&self.scripts);
            match scripts.get(text) {
                Some(script) => (
                    script.delay,
                    script.response.clone().unwrap_or(Err(unscripted)),
                ),
                None => (None, Err(unscripted)),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}
