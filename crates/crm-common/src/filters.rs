//! List filters and pagination parameters.
//!
//! Every list endpoint takes `skip`/`take` plus entity-specific predicates.
//! Filters serialize to explicit query pairs rather than going through
//! `serde_urlencoded`, which cannot flatten typed fields.

use serde::{Deserialize, Serialize};

use crate::models::DealStatus;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// Largest `take` the backend honours; bigger requests are cut down to it.
pub const MAX_PAGE_SIZE: u32 = 100;

fn clamp_take(take: u32) -> u32 {
    take.clamp(1, MAX_PAGE_SIZE)
}

/// Entity-specific list predicates.
pub trait QueryFilter: Clone + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// Query pairs for the predicates that are set.
    fn query_pairs(&self) -> Vec<(&'static str, String)>;

    /// Overwrite every predicate that `patch` sets. An empty search string
    /// clears the search.
    fn merge(&mut self, patch: &Self);
}

fn merge_search(current: &mut Option<String>, patch: &Option<String>) {
    if let Some(s) = patch {
        let s = s.trim();
        *current = if s.is_empty() { None } else { Some(s.to_string()) };
    }
}

fn merge_opt<T: Clone>(current: &mut Option<T>, patch: &Option<T>) {
    if patch.is_some() {
        current.clone_from(patch);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineFilter {
    pub search: Option<String>,
}

impl QueryFilter for PipelineFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        self.search.iter().map(|s| ("search", s.clone())).collect()
    }

    fn merge(&mut self, patch: &Self) {
        merge_search(&mut self.search, &patch.search);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealFilter {
    pub pipeline_id: Option<i64>,
    pub stage_id: Option<i64>,
    pub status: Option<DealStatus>,
    pub search: Option<String>,
}

impl QueryFilter for DealFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(id) = self.pipeline_id {
            pairs.push(("pipelineId", id.to_string()));
        }
        if let Some(id) = self.stage_id {
            pairs.push(("stageId", id.to_string()));
        }
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(s) = &self.search {
            pairs.push(("search", s.clone()));
        }
        pairs
    }

    fn merge(&mut self, patch: &Self) {
        merge_opt(&mut self.pipeline_id, &patch.pipeline_id);
        merge_opt(&mut self.stage_id, &patch.stage_id);
        merge_opt(&mut self.status, &patch.status);
        merge_search(&mut self.search, &patch.search);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFilter {
    pub search: Option<String>,
    pub tag_id: Option<i64>,
}

impl QueryFilter for ContactFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(s) = &self.search {
            pairs.push(("search", s.clone()));
        }
        if let Some(id) = self.tag_id {
            pairs.push(("tagId", id.to_string()));
        }
        pairs
    }

    fn merge(&mut self, patch: &Self) {
        merge_search(&mut self.search, &patch.search);
        merge_opt(&mut self.tag_id, &patch.tag_id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagFilter {
    pub search: Option<String>,
}

impl QueryFilter for TagFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        self.search.iter().map(|s| ("search", s.clone())).collect()
    }

    fn merge(&mut self, patch: &Self) {
        merge_search(&mut self.search, &patch.search);
    }
}

/// Filter plus pagination window for one list request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery<F> {
    pub skip: u32,
    pub take: u32,
    pub filter: F,
}

impl<F: Default> Default for ListQuery<F> {
    fn default() -> Self {
        Self {
            skip: 0,
            take: DEFAULT_PAGE_SIZE,
            filter: F::default(),
        }
    }
}

impl<F: QueryFilter> ListQuery<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, skip: u32, take: u32) -> Self {
        self.skip = skip;
        self.take = clamp_take(take);
        self
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("skip", self.skip.to_string()), ("take", self.take.to_string())];
        pairs.extend(self.filter.query_pairs());
        pairs
    }

    /// Merge a partial change. The offset becomes the patch's `skip` when it
    /// carries one and returns to the first page otherwise.
    pub fn apply(&mut self, patch: &FilterPatch<F>) {
        self.filter.merge(&patch.filter);
        if let Some(take) = patch.take {
            self.take = clamp_take(take);
        }
        self.skip = patch.skip.unwrap_or(0);
    }

    pub fn next_page(&mut self) {
        self.skip = self.skip.saturating_add(self.take);
    }

    pub fn prev_page(&mut self) {
        self.skip = self.skip.saturating_sub(self.take);
    }
}

/// Partial change to a [`ListQuery`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPatch<F> {
    pub skip: Option<u32>,
    pub take: Option<u32>,
    pub filter: F,
}

impl<F: Default> FilterPatch<F> {
    pub fn filter(filter: F) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn skip(skip: u32) -> Self {
        Self {
            skip: Some(skip),
            ..Self::default()
        }
    }
}
