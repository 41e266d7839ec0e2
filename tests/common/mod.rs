//! Shared test fixtures: a scripted backend whose responses resolve in
//! whatever order a test dictates, plus entry builders.

// Each integration test binary compiles this module separately and uses
// a different subset of it.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use riptide::api::{
    ApiError, Backend, ListPage, ListQuery, MarkAllReadRequest, MarkReadRequest, MutationResponse,
    SetScoreRequest, SetStarredRequest,
};
use riptide::{Entry, EntryId, ScopeId};

pub type MutationResult = Result<MutationResponse, ApiError>;
pub type ListResult = Result<ListPage, ApiError>;

/// Timestamp helper: a fixed epoch plus an offset, so tests talk about
/// logical instants instead of wall time.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// A future timestamp, safely newer than any `Utc::now()` the session
/// stamps on optimistic writes during the test run.
pub fn future_ts(secs: i64) -> DateTime<Utc> {
    // Anchor to a single base instant captured once per process, so repeated
    // calls with the same offset return the same logical instant (callers
    // compare these for equality). The hour of headroom keeps every value
    // safely newer than the `Utc::now()` the session stamps on optimistic
    // writes during the test run.
    static BASE: std::sync::OnceLock<DateTime<Utc>> = std::sync::OnceLock::new();
    let base = *BASE.get_or_init(|| Utc::now() + chrono::Duration::hours(1));
    base + chrono::Duration::seconds(secs)
}

pub fn entry(id: EntryId, read: bool, starred: bool, updated_at: DateTime<Utc>) -> Entry {
    Entry {
        id,
        subscription_id: Some(1),
        tags: vec![10],
        title: std::sync::Arc::from(format!("Entry {}", id)),
        url: Some(std::sync::Arc::from(format!("https://example.com/{}", id))),
        summary: None,
        content_html: None,
        kind: None,
        read,
        starred,
        score: None,
        implicit_score: None,
        published_at: Some(ts(id)),
        fetched_at: ts(0),
        updated_at,
    }
}

pub fn page(items: Vec<Entry>, next_cursor: Option<&str>) -> ListPage {
    ListPage {
        items,
        next_cursor: next_cursor.map(str::to_string),
    }
}

pub fn mutation_ok(entry: Entry) -> MutationResult {
    Ok(MutationResponse {
        entries: vec![entry],
        unread_counts: Vec::new(),
    })
}

pub fn mutation_ok_with_counts(entry: Entry, counts: Vec<(ScopeId, i64)>) -> MutationResult {
    Ok(MutationResponse {
        entries: vec![entry],
        unread_counts: counts,
    })
}

pub fn server_error() -> ApiError {
    ApiError::HttpStatus(500)
}

/// A scripted response: either ready immediately or gated on a oneshot
/// the test fires when it wants that call to complete.
pub enum Scripted<T> {
    Ready(T),
    Gated(oneshot::Receiver<T>),
}

async fn take<T>(queue: &Mutex<VecDeque<Scripted<T>>>, endpoint: &str) -> T {
    let script = queue
        .lock()
        .pop_front()
        .unwrap_or_else(|| panic!("no scripted response left for {}", endpoint));
    match script {
        Scripted::Ready(value) => value,
        Scripted::Gated(rx) => rx.await.expect("response gate dropped"),
    }
}

/// Backend double with per-endpoint response queues, consumed in call
/// order. Gated responses let a test force any completion interleaving.
#[derive(Default)]
pub struct ScriptedBackend {
    lists: Mutex<VecDeque<Scripted<ListResult>>>,
    entries: Mutex<HashMap<EntryId, Entry>>,
    mark_read: Mutex<VecDeque<Scripted<MutationResult>>>,
    stars: Mutex<VecDeque<Scripted<MutationResult>>>,
    scores: Mutex<VecDeque<Scripted<MutationResult>>>,
    mark_all: Mutex<VecDeque<Scripted<MutationResult>>>,
    pub list_requests: Mutex<Vec<ListQuery>>,
    entry_calls: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_list(&self, result: ListResult) {
        self.lists.lock().push_back(Scripted::Ready(result));
    }

    pub fn gate_list(&self) -> oneshot::Sender<ListResult> {
        let (tx, rx) = oneshot::channel();
        self.lists.lock().push_back(Scripted::Gated(rx));
        tx
    }

    pub fn insert_entry(&self, entry: Entry) {
        self.entries.lock().insert(entry.id, entry);
    }

    pub fn push_mark_read(&self, result: MutationResult) {
        self.mark_read.lock().push_back(Scripted::Ready(result));
    }

    pub fn gate_mark_read(&self) -> oneshot::Sender<MutationResult> {
        let (tx, rx) = oneshot::channel();
        self.mark_read.lock().push_back(Scripted::Gated(rx));
        tx
    }

    pub fn push_star(&self, result: MutationResult) {
        self.stars.lock().push_back(Scripted::Ready(result));
    }

    pub fn gate_star(&self) -> oneshot::Sender<MutationResult> {
        let (tx, rx) = oneshot::channel();
        self.stars.lock().push_back(Scripted::Gated(rx));
        tx
    }

    pub fn gate_score(&self) -> oneshot::Sender<MutationResult> {
        let (tx, rx) = oneshot::channel();
        self.scores.lock().push_back(Scripted::Gated(rx));
        tx
    }

    pub fn push_mark_all(&self, result: MutationResult) {
        self.mark_all.lock().push_back(Scripted::Ready(result));
    }

    pub fn list_call_count(&self) -> usize {
        self.list_requests.lock().len()
    }

    pub fn entry_call_count(&self) -> usize {
        *self.entry_calls.lock()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn list_entries(&self, query: ListQuery) -> Result<ListPage, ApiError> {
        self.list_requests.lock().push(query);
        take(&self.lists, "list_entries").await
    }

    async fn entry(&self, id: EntryId) -> Result<Entry, ApiError> {
        *self.entry_calls.lock() += 1;
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ApiError::HttpStatus(404))
    }

    async fn mark_read(&self, _request: MarkReadRequest) -> Result<MutationResponse, ApiError> {
        take(&self.mark_read, "mark_read").await
    }

    async fn set_starred(&self, _request: SetStarredRequest) -> Result<MutationResponse, ApiError> {
        take(&self.stars, "set_starred").await
    }

    async fn set_score(&self, _request: SetScoreRequest) -> Result<MutationResponse, ApiError> {
        take(&self.scores, "set_score").await
    }

    async fn mark_all_read(
        &self,
        _request: MarkAllReadRequest,
    ) -> Result<MutationResponse, ApiError> {
        take(&self.mark_all, "mark_all_read").await
    }
}
