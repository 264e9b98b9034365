use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ConfigError;

/// A configured URL monitored for content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    pub last_synced: Option<DateTime<Utc>>,
    pub fingerprint: Option<String>,
}

impl Source {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            last_synced: None,
            fingerprint: None,
        }
    }

    /// Build a source from a configured URL, normalizing it.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = normalize_link(raw).ok_or_else(|| ConfigError::InvalidSource {
            url: raw.to_string(),
            reason: "not an absolute http(s) URL".to_string(),
        })?;
        Ok(Self::new(url))
    }
}

/// Normalized text for one source, alive only for one sync pass.
#[derive(Debug, Clone)]
pub struct RawFetchResult {
    pub source: String,
    pub title: Option<String>,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
    pub length: usize,
    pub fingerprint: String,
}

impl RawFetchResult {
    pub fn new(source: impl Into<String>, title: Option<String>, text: String) -> Self {
        Self {
            source: source.into(),
            title,
            length: text.chars().count(),
            fingerprint: fingerprint(&text),
            text,
            fetched_at: Utc::now(),
        }
    }
}

/// The three ranking dimensions, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rankings {
    pub category_fit: f64,
    pub profile_fit: f64,
    pub credibility: f64,
}

impl Rankings {
    pub fn new(category_fit: f64, profile_fit: f64, credibility: f64) -> Self {
        Self {
            category_fit,
            profile_fit,
            credibility,
        }
    }

    /// Arithmetic mean of the three dimensions.
    pub fn combined(&self) -> f64 {
        (self.category_fit + self.profile_fit + self.credibility) / 3.0
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.category_fit, self.profile_fit, self.credibility]
    }

    /// True when every dimension differs by no more than `epsilon`.
    pub fn approx_eq(&self, other: &Rankings, epsilon: f64) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array().iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

/// A score in thousandths. Scores are compared at this precision.
pub fn score_millis(score: f64) -> i64 {
    (score * 1_000.0).round() as i64
}

/// An unvalidated entry parsed out of a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub title: String,
    pub source: String,
    pub link: String,
    pub categories: Vec<String>,
    pub summary: String,
    pub rankings: Rankings,
}

/// Outcome of quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accepted,
    Rejected,
    PendingReview,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Accepted => "accepted",
            Disposition::Rejected => "rejected",
            Disposition::PendingReview => "pending_review",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "accepted" => Some(Disposition::Accepted),
            "rejected" => Some(Disposition::Rejected),
            "pending_review" | "pending-review" | "pending" => Some(Disposition::PendingReview),
            _ => None,
        }
    }
}

/// A curated, deduplicated, classified item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Normalized link URL, the identity of the resource.
    pub link: String,
    pub title: String,
    pub source: String,
    pub categories: Vec<String>,
    pub summary: String,
    pub rankings: Rankings,
    pub combined_score: f64,
    pub disposition: Disposition,
    pub read: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Resource {
    pub fn from_candidate(
        candidate: &CandidateItem,
        link: String,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            link,
            title: candidate.title.clone(),
            source: candidate.source.clone(),
            categories: candidate.categories.clone(),
            summary: candidate.summary.clone(),
            rankings: candidate.rankings,
            combined_score: candidate.rankings.combined(),
            disposition,
            read: false,
            notes: String::new(),
            created_at: now,
            last_seen: now,
        }
    }

    /// Refresh scores and descriptive fields from a re-seen candidate.
    /// Identity, creation time, read flag, and notes are kept.
    pub fn refresh_from(
        &mut self,
        candidate: &CandidateItem,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) {
        self.title = candidate.title.clone();
        self.categories = candidate.categories.clone();
        if !candidate.summary.is_empty() {
            self.summary = candidate.summary.clone();
        }
        self.rankings = candidate.rankings;
        self.combined_score = candidate.rankings.combined();
        self.disposition = disposition;
        self.last_seen = now;
    }
}

/// Normalize a link for identity comparison: lower-cased scheme and host,
/// default port dropped, trailing slash stripped, query preserved, fragment
/// dropped. Returns `None` for anything that is not an absolute http(s) URL.
pub fn normalize_link(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_lowercase();

    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    Some(normalized)
}

/// SHA-256 hex digest of normalized content.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
