//! Search history: a locally cached list reconciled with the server copy.
//!
//! The server and older local caches disagree on field names (`timestamp` vs
//! `created_at`, `resultCount` vs `result_count`), so records are normalized into
//! [`SearchHistoryEntry`] before merging.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::authorized::{ApiRequest, AuthorizedClient};
use crate::credential::Clock;
use crate::error::{SessionError, StorageError};
use crate::storage::{KeyValueStore, SEARCH_HISTORY_KEY};

pub const SEARCH_HISTORY_PATH: &str = "/search-history/";
/// Entries kept after a merge.
pub const HISTORY_LIMIT: usize = 20;
/// Entries kept by local recording between merges.
pub const LOCAL_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "resultCount", default)]
    pub result_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl SearchHistoryEntry {
    #[must_use]
    pub fn new(query: impl Into<String>, timestamp: DateTime<Utc>, result_count: u64) -> Self {
        Self {
            query: query.into(),
            timestamp,
            result_count,
            annotation: None,
        }
    }
}

/// A history record as either source stores it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<serde_json::Value>,
    #[serde(default, rename = "resultCount")]
    pub result_count_camel: Option<serde_json::Value>,
    #[serde(default)]
    pub result_count: Option<serde_json::Value>,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl HistoryRecord {
    /// `None` when the record has no query or no readable timestamp.
    #[must_use]
    pub fn normalize(self) -> Option<SearchHistoryEntry> {
        let query = self.query.filter(|query| !query.is_empty())?;
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .or_else(|| self.created_at.as_ref().and_then(parse_timestamp))?;
        let result_count = self
            .result_count_camel
            .as_ref()
            .and_then(parse_count)
            .or_else(|| self.result_count.as_ref().and_then(parse_count))
            .unwrap_or(0);
        let annotation = self
            .annotation
            .or(self.note)
            .filter(|annotation| !annotation.trim().is_empty());
        Some(SearchHistoryEntry {
            query,
            timestamp,
            result_count,
            annotation,
        })
    }
}

/// ISO-8601 strings, or numbers as epoch milliseconds.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|timestamp| timestamp.with_timezone(&Utc)),
        serde_json::Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis.floor() as i64))
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn parse_count(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|count| *count >= 0.0).map(|count| count as u64)),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Decodes a JSON array element by element, skipping anything unreadable.
#[must_use]
pub fn normalize_values(values: Vec<serde_json::Value>) -> Vec<SearchHistoryEntry> {
    values
        .into_iter()
        .filter_map(|value| serde_json::from_value::<HistoryRecord>(value).ok())
        .filter_map(HistoryRecord::normalize)
        .collect()
}

/// Union of both lists with one entry per exact query string, newest first,
/// at most [`HISTORY_LIMIT`] long.
#[must_use]
pub fn merge(local: &[SearchHistoryEntry], remote: &[SearchHistoryEntry]) -> Vec<SearchHistoryEntry> {
    let mut by_query: HashMap<&str, &SearchHistoryEntry> = HashMap::new();
    for entry in local.iter().chain(remote) {
        if entry.query.is_empty() {
            continue;
        }
        match by_query.entry(entry.query.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(mut slot) => {
                if supersedes(entry, slot.get()) {
                    slot.insert(entry);
                }
            }
        }
    }

    let mut merged = by_query.into_values().cloned().collect::<Vec<_>>();
    merged.sort_by(|left, right| {
        right
            .timestamp
            .cmp(&left.timestamp)
            .then_with(|| left.query.cmp(&right.query))
    });
    merged.truncate(HISTORY_LIMIT);
    merged
}

/// Newer wins. Equal timestamps fall back to the remaining fields so the
/// winner does not depend on which list was read first.
fn supersedes(candidate: &SearchHistoryEntry, current: &SearchHistoryEntry) -> bool {
    candidate
        .timestamp
        .cmp(&current.timestamp)
        .then_with(|| candidate.result_count.cmp(&current.result_count))
        .then_with(|| candidate.annotation.cmp(&current.annotation))
        .is_gt()
}

/// Prepends without deduplicating; duplicates collapse at the next merge.
pub fn record_local(history: &mut Vec<SearchHistoryEntry>, entry: SearchHistoryEntry) {
    history.insert(0, entry);
    history.truncate(LOCAL_HISTORY_LIMIT);
}

/// The persisted local copy under [`SEARCH_HISTORY_KEY`].
#[derive(Clone)]
pub struct HistoryCache {
    store: Arc<dyn KeyValueStore>,
}

impl HistoryCache {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Missing or corrupt caches read as empty.
    #[must_use]
    pub fn load(&self) -> Vec<SearchHistoryEntry> {
        let raw = match self.store.get(SEARCH_HISTORY_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read search history cache");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
            Ok(values) => normalize_values(values),
            Err(error) => {
                tracing::warn!(error = %error, "discarding unreadable search history cache");
                Vec::new()
            }
        }
    }

    pub fn save(&self, entries: &[SearchHistoryEntry]) -> Result<(), StorageError> {
        let kept = &entries[..entries.len().min(LOCAL_HISTORY_LIMIT)];
        let encoded = serde_json::to_string(kept)
            .map_err(|error| StorageError::Serialize(error.to_string()))?;
        self.store.set(SEARCH_HISTORY_KEY, &encoded)
    }

    pub fn record(&self, entry: SearchHistoryEntry) -> Result<Vec<SearchHistoryEntry>, StorageError> {
        let mut history = self.load();
        record_local(&mut history, entry);
        self.save(&history)?;
        Ok(history)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    List(Vec<serde_json::Value>),
    Page { results: Vec<serde_json::Value> },
}

/// Keeps the local cache and the server's history in step.
#[derive(Clone)]
pub struct HistorySync {
    client: AuthorizedClient,
    cache: HistoryCache,
    clock: Arc<dyn Clock>,
}

impl HistorySync {
    #[must_use]
    pub fn new(client: AuthorizedClient) -> Self {
        let cache = HistoryCache::new(client.session().store());
        let clock = client.session().clock();
        Self {
            client,
            cache,
            clock,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &HistoryCache {
        &self.cache
    }

    pub async fn fetch_remote(&self) -> Result<Vec<SearchHistoryEntry>, SessionError> {
        let payload: HistoryPayload = self
            .client
            .send_json(ApiRequest::get(SEARCH_HISTORY_PATH))
            .await?;
        let values = match payload {
            HistoryPayload::List(values) | HistoryPayload::Page { results: values } => values,
        };
        Ok(normalize_values(values))
    }

    /// Merges local and remote history and writes the result back to the cache.
    /// When the server copy is unavailable the local copy is used alone;
    /// authentication failures are returned.
    pub async fn reconcile(&self) -> Result<Vec<SearchHistoryEntry>, SessionError> {
        let local = self.cache.load();
        let remote = match self.fetch_remote().await {
            Ok(remote) => remote,
            Err(error) if error.is_terminal() => return Err(error),
            Err(error) => {
                tracing::warn!(
                    code = error.code(),
                    error = %error,
                    "server search history unavailable; using local copy"
                );
                Vec::new()
            }
        };

        let merged = merge(&local, &remote);
        self.cache.save(&merged)?;
        tracing::debug!(
            local = local.len(),
            remote = remote.len(),
            merged = merged.len(),
            "search history reconciled"
        );
        Ok(merged)
    }

    /// Records locally first, then on the server. The local entry survives a
    /// failed server write.
    pub async fn record_search(
        &self,
        query: &str,
        result_count: u64,
    ) -> Result<SearchHistoryEntry, SessionError> {
        let entry = SearchHistoryEntry::new(query, self.clock.now(), result_count);
        self.cache.record(entry.clone())?;

        let body = serde_json::json!({ "query": query, "result_count": result_count });
        self.client
            .call_with_auth(ApiRequest::post(SEARCH_HISTORY_PATH, body))
            .await?
            .into_result()?;
        Ok(entry)
    }
}
