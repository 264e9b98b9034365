//! Usage accounting for billed calls to external services.
//!
//! Costs are kept as integer nano-USD. Rates are expressed in micro-USD per
//! 1,000 units, so `units * rate` is the exact cost in nano-USD.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::PersistenceError;
use crate::store::Persistence;

pub const JINA_READER: &str = "jina-reader";
pub const DIRECT_HTML: &str = "direct-html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Conversion,
    Completion,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Conversion => "conversion",
            Operation::Completion => "completion",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "conversion" => Some(Operation::Conversion),
            "completion" => Some(Operation::Completion),
            _ => None,
        }
    }
}

/// Price per 1,000 input and output units, in micro-USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_1k_micros: u64,
    pub output_per_1k_micros: u64,
}

impl Rate {
    pub const fn new(input_per_1k_micros: u64, output_per_1k_micros: u64) -> Self {
        Self {
            input_per_1k_micros,
            output_per_1k_micros,
        }
    }

    /// Saturates at `u64::MAX` when the service reports absurd unit counts.
    pub fn cost_nanos(&self, input_units: u64, output_units: u64) -> u64 {
        input_units
            .saturating_mul(self.input_per_1k_micros)
            .saturating_add(output_units.saturating_mul(self.output_per_1k_micros))
    }
}

/// Static per-service, per-operation price list.
#[derive(Debug, Clone)]
pub struct RateTable {
    rates: HashMap<(String, Operation), Rate>,
}

impl RateTable {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    pub fn with_rate(mut self, service: impl Into<String>, operation: Operation, rate: Rate) -> Self {
        self.set(service, operation, rate);
        self
    }

    pub fn set(&mut self, service: impl Into<String>, operation: Operation, rate: Rate) {
        self.rates.insert((service.into(), operation), rate);
    }

    pub fn lookup(&self, service: &str, operation: Operation) -> Option<Rate> {
        self.rates.get(&(service.to_string(), operation)).copied()
    }
}

impl Default for RateTable {
    fn default() -> Self {
        // Public list prices at the time of writing.
        Self::empty()
            .with_rate(JINA_READER, Operation::Conversion, Rate::new(20, 0))
            .with_rate(DIRECT_HTML, Operation::Conversion, Rate::new(0, 0))
            .with_rate("openai/gpt-4o-mini", Operation::Completion, Rate::new(150, 600))
            .with_rate("openai/gpt-4o", Operation::Completion, Rate::new(2_500, 10_000))
            .with_rate("openai/gpt-4.1-mini", Operation::Completion, Rate::new(400, 1_600))
            .with_rate("openai/gpt-4.1", Operation::Completion, Rate::new(2_000, 8_000))
    }
}

/// What an adapter reports after a billed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub service: String,
    pub operation: Operation,
    pub input_units: u64,
    pub output_units: u64,
}

impl Usage {
    pub fn conversion(service: impl Into<String>, units: u64) -> Self {
        Self {
            service: service.into(),
            operation: Operation::Conversion,
            input_units: units,
            output_units: 0,
        }
    }

    pub fn completion(service: impl Into<String>, input_units: u64, output_units: u64) -> Self {
        Self {
            service: service.into(),
            operation: Operation::Completion,
            input_units,
            output_units,
        }
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub recorded_at: DateTime<Utc>,
    pub service: String,
    pub operation: Operation,
    pub input_units: u64,
    pub output_units: u64,
    pub cost_nanos: u64,
    /// False when no rate was known for the service/operation pair.
    pub priced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTotals {
    pub calls: u64,
    pub input_units: u64,
    pub output_units: u64,
    pub cost_nanos: u64,
    pub unpriced_calls: u64,
}

impl ServiceTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        self.input_units = self.input_units.saturating_add(record.input_units);
        self.output_units = self.output_units.saturating_add(record.output_units);
        self.cost_nanos = self.cost_nanos.saturating_add(record.cost_nanos);
        if !record.priced {
            self.unpriced_calls += 1;
        }
    }

    fn merge(&mut self, other: &ServiceTotals) {
        self.calls += other.calls;
        self.input_units = self.input_units.saturating_add(other.input_units);
        self.output_units = self.output_units.saturating_add(other.output_units);
        self.cost_nanos = self.cost_nanos.saturating_add(other.cost_nanos);
        self.unpriced_calls += other.unpriced_calls;
    }
}

/// Aggregate usage, overall and per service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub overall: ServiceTotals,
    pub by_service: BTreeMap<String, ServiceTotals>,
}

impl UsageTotals {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut totals = Self::default();
        for record in records {
            totals.add(record);
        }
        totals
    }

    pub fn add(&mut self, record: &UsageRecord) {
        self.overall.add(record);
        self.by_service
            .entry(record.service.clone())
            .or_default()
            .add(record);
    }

    /// Fold per-service rows into totals.
    pub fn from_service_rows(rows: impl IntoIterator<Item = (String, ServiceTotals)>) -> Self {
        let mut totals = Self::default();
        for (service, row) in rows {
            totals.overall.merge(&row);
            totals.by_service.entry(service).or_default().merge(&row);
        }
        totals
    }

    pub fn cost_usd(&self) -> f64 {
        self.overall.cost_nanos as f64 / 1e9
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub session: UsageTotals,
    pub all_time: UsageTotals,
}

/// Shared, append-only record of every billed call in this process.
pub struct TokenUsageLedger {
    rates: RateTable,
    records: Mutex<Vec<UsageRecord>>,
    store: Option<Arc<dyn Persistence>>,
}

impl TokenUsageLedger {
    pub fn new(rates: RateTable) -> Self {
        Self {
            rates,
            records: Mutex::new(Vec::new()),
            store: None,
        }
    }

    pub fn with_store(rates: RateTable, store: Arc<dyn Persistence>) -> Self {
        Self {
            rates,
            records: Mutex::new(Vec::new()),
            store: Some(store),
        }
    }

    /// Price and append a usage entry. The record is kept in memory even when
    /// the durable append fails; the error is returned so callers can report it.
    pub fn record(&self, usage: Usage) -> Result<UsageRecord, PersistenceError> {
        let rate = self.rates.lookup(&usage.service, usage.operation);
        if rate.is_none() {
            tracing::warn!(
                service = %usage.service,
                operation = usage.operation.as_str(),
                "No rate configured, recording usage at zero cost"
            );
        }

        let record = UsageRecord {
            recorded_at: Utc::now(),
            cost_nanos: rate
                .map(|r| r.cost_nanos(usage.input_units, usage.output_units))
                .unwrap_or(0),
            priced: rate.is_some(),
            service: usage.service,
            operation: usage.operation,
            input_units: usage.input_units,
            output_units: usage.output_units,
        };

        tracing::debug!(
            service = %record.service,
            operation = record.operation.as_str(),
            input_units = record.input_units,
            output_units = record.output_units,
            cost_nanos = record.cost_nanos,
            "Usage recorded"
        );

        self.lock_records().push(record.clone());

        if let Some(store) = &self.store {
            store.append_usage_record(&record)?;
        }
        Ok(record)
    }

    /// Record and log, for adapters that cannot surface storage failures.
    pub fn record_logged(&self, usage: Usage) {
        if let Err(e) = self.record(usage) {
            tracing::warn!(error = %e, "Failed to persist usage record");
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.lock_records().clone()
    }

    pub fn session_totals(&self) -> UsageTotals {
        UsageTotals::from_records(self.lock_records().iter())
    }

    /// Totals across process restarts. Without a store this equals the
    /// session totals.
    pub fn all_time_totals(&self) -> Result<UsageTotals, PersistenceError> {
        match &self.store {
            Some(store) => store.load_usage_totals(),
            None => Ok(self.session_totals()),
        }
    }

    pub fn summary(&self) -> Result<UsageSummary, PersistenceError> {
        Ok(UsageSummary {
            session: self.session_totals(),
            all_time: self.all_time_totals()?,
        })
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<UsageRecord>> {
        // A poisoned lock still holds a consistent append-only vector.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn test_session_total_is_exact_sum() {
        let ledger = TokenUsageLedger::new(RateTable::default());
        let calls = [(1_500u64, 800u64), (333, 17), (12_345, 6_789)];
        for (input, output) in calls {
            ledger
                .record(Usage::completion("openai/gpt-4o-mini", input, output))
                .unwrap();
        }

        let expected: u64 = calls.iter().map(|(i, o)| i * 150 + o * 600).sum();
        let totals = ledger.session_totals();
        assert_eq!(totals.overall.cost_nanos, expected);
        assert_eq!(totals.overall.calls, 3);
        assert_eq!(totals.overall.input_units, 1_500 + 333 + 12_345);
        assert_eq!(totals.overall.output_units, 800 + 17 + 6_789);
    }

    #[test]
    fn test_oversized_unit_counts_saturate() {
        let rate = Rate::new(150, 600);
        assert_eq!(rate.cost_nanos(u64::MAX, 1), u64::MAX);
        assert_eq!(rate.cost_nanos(1, u64::MAX / 2), u64::MAX);

        let ledger = TokenUsageLedger::new(RateTable::default());
        ledger
            .record(Usage::completion("openai/gpt-4o-mini", u64::MAX, 0))
            .unwrap();
        ledger
            .record(Usage::completion("openai/gpt-4o-mini", 1_000, 1_000))
            .unwrap();
        let totals = ledger.session_totals();
        assert_eq!(totals.overall.cost_nanos, u64::MAX);
        assert_eq!(totals.overall.input_units, u64::MAX);
        assert_eq!(totals.overall.calls, 2);
    }

    #[test]
    fn test_unknown_rate_costs_zero_and_is_flagged() {
        let ledger = TokenUsageLedger::new(RateTable::empty());
        let record = ledger
            .record(Usage::completion("mystery/model", 1_000, 1_000))
            .unwrap();
        assert_eq!(record.cost_nanos, 0);
        assert!(!record.priced);

        let totals = ledger.session_totals();
        assert_eq!(totals.overall.calls, 1);
        assert_eq!(totals.overall.unpriced_calls, 1);
    }

    #[test]
    fn test_by_service_breakdown() {
        let ledger = TokenUsageLedger::new(RateTable::default());
        ledger.record(Usage::conversion(JINA_READER, 2_000)).unwrap();
        ledger
            .record(Usage::completion("openai/gpt-4o-mini", 1_000, 100))
            .unwrap();

        let totals = ledger.session_totals();
        assert_eq!(totals.by_service[JINA_READER].cost_nanos, 40_000);
        assert_eq!(
            totals.by_service["openai/gpt-4o-mini"].cost_nanos,
            150_000 + 60_000
        );
        assert_eq!(totals.overall.cost_nanos, 250_000);
        assert!((totals.cost_usd() - 0.00025).abs() < 1e-12);
    }

    #[test]
    fn test_all_time_delegates_to_store() {
        let store = Arc::new(MemoryStore::new());
        let previous = TokenUsageLedger::with_store(RateTable::default(), store.clone());
        previous
            .record(Usage::completion("openai/gpt-4o-mini", 1_000, 0))
            .unwrap();

        let ledger = TokenUsageLedger::with_store(RateTable::default(), store);
        ledger
            .record(Usage::completion("openai/gpt-4o-mini", 2_000, 0))
            .unwrap();

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.session.overall.calls, 1);
        assert_eq!(summary.all_time.overall.calls, 2);
        assert_eq!(summary.all_time.overall.cost_nanos, 450_000);
    }

    #[test]
    fn test_failed_append_keeps_record_in_memory() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let ledger = TokenUsageLedger::with_store(RateTable::default(), store);

        let result = ledger.record(Usage::conversion(JINA_READER, 10));
        assert!(result.is_err());
        assert_eq!(ledger.session_totals().overall.calls, 1);
    }
}
