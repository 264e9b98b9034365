//! The live set of curated resources.
//!
//! All mutation goes through [`ResourceCollection::upsert`], which takes the
//! collection-wide write lock, so concurrent workers can never create two
//! resources for the same normalized link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dedup::{DedupOutcome, Deduplicator};
use crate::models::{normalize_link, score_millis, CandidateItem, Disposition, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Read,
    Unread,
}

/// Conjunctive filter; `None` imposes no restriction. Within the category
/// list a resource matches if it carries any of the listed categories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceFilter {
    pub categories: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub read_status: Option<ReadStatus>,
    pub dispositions: Option<Vec<Disposition>>,
}

impl ResourceFilter {
    pub fn matches(&self, resource: &Resource) -> bool {
        if let Some(categories) = &self.categories {
            let hit = categories.iter().any(|wanted| {
                resource
                    .categories
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(wanted))
            });
            if !hit {
                return false;
            }
        }

        if let Some(sources) = &self.sources {
            let hit = sources.iter().any(|s| {
                normalize_link(s).as_deref().unwrap_or(s.as_str()) == resource.source
            });
            if !hit {
                return false;
            }
        }

        if let Some(status) = self.read_status {
            let is_read = status == ReadStatus::Read;
            if resource.read != is_read {
                return false;
            }
        }

        if let Some(dispositions) = &self.dispositions {
            if !dispositions.contains(&resource.disposition) {
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    CreatedAt,
    /// Highest combined score first.
    CombinedScore,
    /// Highest combined score first, newer first among equal scores.
    CombinedThenDate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceQuery {
    pub filter: ResourceFilter,
    pub sort: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Result of an upsert. `resource` is `None` only for a new candidate that
/// was rejected and therefore not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub outcome: DedupOutcome,
    pub resource: Option<Resource>,
}

impl Upserted {
    pub fn inserted(&self) -> bool {
        self.outcome == DedupOutcome::New && self.resource.is_some()
    }
}

/// Scores are compared at this precision so that rounding noise in the mean
/// does not break ties.
pub fn sort_resources(resources: &mut [Resource], order: SortOrder) {
    resources.sort_by(|a, b| compare(a, b, order));
}

fn compare(a: &Resource, b: &Resource, order: SortOrder) -> Ordering {
    let by_date = || b.created_at.cmp(&a.created_at);
    let by_score = || score_millis(b.combined_score).cmp(&score_millis(a.combined_score));
    let by_link = || a.link.cmp(&b.link);

    match order {
        SortOrder::CreatedAt => by_date().then_with(by_link),
        SortOrder::CombinedScore => by_score().then_with(by_link),
        SortOrder::CombinedThenDate => by_score().then_with(by_date).then_with(by_link),
    }
}

#[derive(Debug, Default)]
pub struct ResourceCollection {
    resources: RwLock<HashMap<String, Resource>>,
    dedup: Deduplicator,
}

impl ResourceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deduplicator(dedup: Deduplicator) -> Self {
        Self {
            resources: RwLock::default(),
            dedup,
        }
    }

    /// Replace the contents with previously persisted resources.
    pub fn load(&self, resources: Vec<Resource>) {
        let mut map = self.write();
        map.clear();
        for resource in resources {
            map.insert(resource.link.clone(), resource);
        }
    }

    pub fn upsert(&self, candidate: &CandidateItem, disposition: Disposition) -> Upserted {
        self.upsert_at(candidate, disposition, Utc::now())
    }

    pub fn upsert_at(
        &self,
        candidate: &CandidateItem,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Upserted {
        let key = Deduplicator::key(candidate);
        let mut map = self.write();

        if let Some(existing) = map.get_mut(&key) {
            let outcome = self.dedup.compare(existing, candidate);
            match outcome {
                DedupOutcome::DuplicateUnchanged => {
                    existing.last_seen = now;
                    existing.disposition = disposition;
                }
                _ => existing.refresh_from(candidate, disposition, now),
            }
            return Upserted {
                outcome,
                resource: Some(existing.clone()),
            };
        }

        if disposition == Disposition::Rejected {
            return Upserted {
                outcome: DedupOutcome::New,
                resource: None,
            };
        }

        let resource = Resource::from_candidate(candidate, key.clone(), disposition, now);
        map.insert(key, resource.clone());
        Upserted {
            outcome: DedupOutcome::New,
            resource: Some(resource),
        }
    }

    pub fn get(&self, link: &str) -> Option<Resource> {
        let key = normalize_link(link).unwrap_or_else(|| link.to_string());
        self.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn filter(&self, filter: &ResourceFilter) -> Vec<Resource> {
        self.read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn sorted(&self, order: SortOrder) -> Vec<Resource> {
        self.query(&ResourceQuery {
            sort: order,
            ..Default::default()
        })
    }

    pub fn query(&self, query: &ResourceQuery) -> Vec<Resource> {
        let mut resources = self.filter(&query.filter);
        sort_resources(&mut resources, query.sort);
        resources
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn set_read(&self, link: &str, read: bool) -> Option<Resource> {
        self.modify(link, |r| r.read = read)
    }

    pub fn set_notes(&self, link: &str, notes: impl Into<String>) -> Option<Resource> {
        let notes = notes.into();
        self.modify(link, move |r| r.notes = notes)
    }

    fn modify(&self, link: &str, change: impl FnOnce(&mut Resource)) -> Option<Resource> {
        let key = normalize_link(link).unwrap_or_else(|| link.to_string());
        let mut map = self.write();
        let resource = map.get_mut(&key)?;
        change(resource);
        Some(resource.clone())
    }

    // Poisoning only happens if a panic occurred mid-update; every update
    // leaves the map consistent, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Resource>> {
        self.resources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Resource>> {
        self.resources.write().unwrap_or_else(|e| e.into_inner())
    }
}
