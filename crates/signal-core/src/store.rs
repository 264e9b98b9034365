use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::APP_DIR;
use crate::error::PersistenceError;
use crate::models::{Disposition, Rankings, Resource, Source};
use crate::usage::{ServiceTotals, UsageRecord, UsageTotals};

/// Durable storage for resources, source state, and usage records.
pub trait Persistence: Send + Sync {
    fn load_resources(&self) -> Result<Vec<Resource>, PersistenceError>;
    fn save_resource(&self, resource: &Resource) -> Result<(), PersistenceError>;
    fn load_usage_totals(&self) -> Result<UsageTotals, PersistenceError>;
    fn append_usage_record(&self, record: &UsageRecord) -> Result<(), PersistenceError>;
    fn load_sources(&self) -> Result<Vec<Source>, PersistenceError>;
    fn save_source(&self, source: &Source) -> Result<(), PersistenceError>;
}

/// SQLite integers are signed; counts beyond `i64::MAX` are stored clamped.
fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Get the default directory for the database
pub fn get_default_data_dir() -> Result<PathBuf, PersistenceError> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| {
            PersistenceError::Unavailable("could not determine local data directory".to_string())
        })?
        .join(APP_DIR);

    fs::create_dir_all(&data_dir).map_err(|e| {
        PersistenceError::Unavailable(format!(
            "failed to create {}: {}",
            data_dir.display(),
            e
        ))
    })?;

    Ok(data_dir)
}

pub fn default_database_path() -> Result<PathBuf, PersistenceError> {
    Ok(get_default_data_dir()?.join("signal.db"))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resources (
    link TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    source TEXT NOT NULL,
    categories TEXT NOT NULL,
    summary TEXT NOT NULL,
    category_fit REAL NOT NULL,
    profile_fit REAL NOT NULL,
    credibility REAL NOT NULL,
    combined_score REAL NOT NULL,
    disposition TEXT NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_seen TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_resources_source ON resources(source);

CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    service TEXT NOT NULL,
    operation TEXT NOT NULL,
    input_units INTEGER NOT NULL,
    output_units INTEGER NOT NULL,
    cost_nanos INTEGER NOT NULL,
    priced INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sources (
    url TEXT PRIMARY KEY,
    last_synced TEXT,
    fingerprint TEXT
);
";

/// SQLite-backed [`Persistence`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e))
}

fn optional_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(index, e))
    })
    .transpose()
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    let categories_json: String = row.get(3)?;
    let categories: Vec<String> =
        serde_json::from_str(&categories_json).map_err(|e| conversion_error(3, e))?;
    let disposition_raw: String = row.get(9)?;
    let disposition = Disposition::from_slug(&disposition_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            Type::Text,
            format!("unknown disposition {}", disposition_raw).into(),
        )
    })?;

    Ok(Resource {
        link: row.get(0)?,
        title: row.get(1)?,
        source: row.get(2)?,
        categories,
        summary: row.get(4)?,
        rankings: Rankings::new(row.get(5)?, row.get(6)?, row.get(7)?),
        combined_score: row.get(8)?,
        disposition,
        read: row.get::<_, i64>(10)? != 0,
        notes: row.get(11)?,
        created_at: timestamp(row, 12)?,
        last_seen: timestamp(row, 13)?,
    })
}

impl Persistence for SqliteStore {
    fn load_resources(&self) -> Result<Vec<Resource>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT link, title, source, categories, summary, category_fit, profile_fit,
                    credibility, combined_score, disposition, read, notes, created_at, last_seen
             FROM resources
             ORDER BY created_at DESC",
        )?;
        let resources = stmt
            .query_map([], resource_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(resources)
    }

    fn save_resource(&self, resource: &Resource) -> Result<(), PersistenceError> {
        let categories = serde_json::to_string(&resource.categories)?;
        self.conn().execute(
            "INSERT INTO resources
                (link, title, source, categories, summary, category_fit, profile_fit,
                 credibility, combined_score, disposition, read, notes, created_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(link) DO UPDATE SET
                title = excluded.title,
                source = excluded.source,
                categories = excluded.categories,
                summary = excluded.summary,
                category_fit = excluded.category_fit,
                profile_fit = excluded.profile_fit,
                credibility = excluded.credibility,
                combined_score = excluded.combined_score,
                disposition = excluded.disposition,
                read = excluded.read,
                notes = excluded.notes,
                last_seen = excluded.last_seen",
            params![
                resource.link,
                resource.title,
                resource.source,
                categories,
                resource.summary,
                resource.rankings.category_fit,
                resource.rankings.profile_fit,
                resource.rankings.credibility,
                resource.combined_score,
                resource.disposition.as_str(),
                resource.read as i64,
                resource.notes,
                resource.created_at.to_rfc3339(),
                resource.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_usage_totals(&self) -> Result<UsageTotals, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT service, COUNT(*), SUM(input_units), SUM(output_units), SUM(cost_nanos),
                    SUM(CASE WHEN priced = 0 THEN 1 ELSE 0 END)
             FROM usage_records
             GROUP BY service",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ServiceTotals {
                        calls: row.get::<_, i64>(1)? as u64,
                        input_units: row.get::<_, i64>(2)? as u64,
                        output_units: row.get::<_, i64>(3)? as u64,
                        cost_nanos: row.get::<_, i64>(4)? as u64,
                        unpriced_calls: row.get::<_, i64>(5)? as u64,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(UsageTotals::from_service_rows(rows))
    }

    fn append_usage_record(&self, record: &UsageRecord) -> Result<(), PersistenceError> {
        self.conn().execute(
            "INSERT INTO usage_records
                (recorded_at, service, operation, input_units, output_units, cost_nanos, priced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.recorded_at.to_rfc3339(),
                record.service,
                record.operation.as_str(),
                clamp_i64(record.input_units),
                clamp_i64(record.output_units),
                clamp_i64(record.cost_nanos),
                record.priced as i64,
            ],
        )?;
        Ok(())
    }

    fn load_sources(&self) -> Result<Vec<Source>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT url, last_synced, fingerprint FROM sources")?;
        let sources = stmt
            .query_map([], |row| {
                Ok(Source {
                    url: row.get(0)?,
                    last_synced: optional_timestamp(row, 1)?,
                    fingerprint: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    fn save_source(&self, source: &Source) -> Result<(), PersistenceError> {
        self.conn().execute(
            "INSERT INTO sources (url, last_synced, fingerprint)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(url) DO UPDATE SET
                last_synced = excluded.last_synced,
                fingerprint = excluded.fingerprint",
            params![
                source.url,
                source.last_synced.map(|t| t.to_rfc3339()),
                source.fingerprint,
            ],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    /// Look up a single resource by normalized link.
    pub fn find_resource(&self, link: &str) -> Result<Option<Resource>, PersistenceError> {
        let conn = self.conn();
        let resource = conn
            .query_row(
                "SELECT link, title, source, categories, summary, category_fit, profile_fit,
                        credibility, combined_score, disposition, read, notes, created_at, last_seen
                 FROM resources WHERE link = ?1",
                params![link],
                resource_from_row,
            )
            .optional()?;
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{Operation, RateTable, TokenUsageLedger, Usage};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn resource(link: &str) -> Resource {
        let t = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        Resource {
            link: link.to_string(),
            title: "Async cancellation in practice".to_string(),
            source: "https://example.com".to_string(),
            categories: vec!["AI".to_string(), "Rust".to_string()],
            summary: "A summary".to_string(),
            rankings: Rankings::new(0.5, 0.75, 1.0),
            combined_score: 0.75,
            disposition: Disposition::PendingReview,
            read: false,
            notes: String::new(),
            created_at: t,
            last_seen: t,
        }
    }

    #[test]
    fn test_resource_save_and_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        let original = resource("https://example.com/a");
        store.save_resource(&original).unwrap();

        let loaded = store.load_resources().unwrap();
        assert_eq!(loaded, vec![original.clone()]);
        assert_eq!(
            store.find_resource("https://example.com/a").unwrap(),
            Some(original)
        );
        assert_eq!(store.find_resource("https://example.com/b").unwrap(), None);
    }

    #[test]
    fn test_save_updates_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut r = resource("https://example.com/a");
        store.save_resource(&r).unwrap();

        r.disposition = Disposition::Accepted;
        r.read = true;
        r.notes = "worth a look".to_string();
        r.last_seen = r.last_seen + chrono::Duration::days(1);
        store.save_resource(&r).unwrap();

        let loaded = store.load_resources().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], r);
    }

    #[test]
    fn test_usage_totals_group_by_service() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = TokenUsageLedger::with_store(RateTable::default(), store.clone());
        ledger.record(Usage::conversion("jina-reader", 1_000)).unwrap();
        ledger
            .record(Usage::completion("openai/gpt-4o-mini", 2_000, 500))
            .unwrap();
        ledger.record(Usage::completion("unknown", 10, 10)).unwrap();

        let totals = store.load_usage_totals().unwrap();
        assert_eq!(totals, ledger.session_totals());
        assert_eq!(totals.overall.calls, 3);
        assert_eq!(totals.overall.unpriced_calls, 1);
        assert_eq!(totals.by_service["jina-reader"].input_units, 1_000);
        assert_eq!(
            totals.by_service["openai/gpt-4o-mini"].cost_nanos,
            2_000 * 150 + 500 * 600
        );
    }

    #[test]
    fn test_oversized_usage_is_stored_clamped() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = TokenUsageLedger::with_store(RateTable::default(), store.clone());
        ledger
            .record(Usage::completion("openai/gpt-4o-mini", u64::MAX, 0))
            .unwrap();

        let totals = store.load_usage_totals().unwrap();
        assert_eq!(totals.overall.input_units, i64::MAX as u64);
        assert_eq!(totals.overall.cost_nanos, i64::MAX as u64);
    }

    #[test]
    fn test_empty_usage_totals() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.load_usage_totals().unwrap(), UsageTotals::default());
    }

    #[test]
    fn test_source_state_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut source = Source::new("https://example.com/blog");
        store.save_source(&source).unwrap();

        source.last_synced = Some(Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap());
        source.fingerprint = Some("abc123".to_string());
        store.save_source(&source).unwrap();

        assert_eq!(store.load_sources().unwrap(), vec![source]);
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_resource(&resource("https://example.com/a")).unwrap();
            store
                .append_usage_record(&UsageRecord {
                    recorded_at: Utc::now(),
                    service: "jina-reader".to_string(),
                    operation: Operation::Conversion,
                    input_units: 50,
                    output_units: 0,
                    cost_nanos: 1_000,
                    priced: true,
                })
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_resources().unwrap().len(), 1);
        assert_eq!(store.load_usage_totals().unwrap().overall.cost_nanos, 1_000);
    }
}
