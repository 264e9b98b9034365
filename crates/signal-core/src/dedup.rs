use crate::collection::ResourceCollection;
use crate::models::{normalize_link, CandidateItem, Resource};

/// Ranking differences at or below this are treated as unchanged.
pub const RANKING_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    DuplicateUnchanged,
    DuplicateUpdated,
}

/// Decides whether a candidate is already known, keyed on its normalized link.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    epsilon: f64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self {
            epsilon: RANKING_EPSILON,
        }
    }
}

impl Deduplicator {
    pub fn with_epsilon(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /// Identity key for a candidate. Falls back to the trimmed link when it
    /// does not normalize, which the parser already guards against.
    pub fn key(candidate: &CandidateItem) -> String {
        normalize_link(&candidate.link).unwrap_or_else(|| candidate.link.trim().to_string())
    }

    pub fn check(&self, candidate: &CandidateItem, collection: &ResourceCollection) -> DedupOutcome {
        match collection.get(&Self::key(candidate)) {
            Some(existing) => self.compare(&existing, candidate),
            None => DedupOutcome::New,
        }
    }

    /// Compare a stored resource against a re-seen candidate.
    pub fn compare(&self, existing: &Resource, candidate: &CandidateItem) -> DedupOutcome {
        let rankings_same = existing.rankings.approx_eq(&candidate.rankings, self.epsilon);
        if rankings_same && same_categories(&existing.categories, &candidate.categories) {
            DedupOutcome::DuplicateUnchanged
        } else {
            DedupOutcome::DuplicateUpdated
        }
    }
}

fn same_categories(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    a.dedup();
    b.sort_unstable();
    b.dedup();
    a == b
}
