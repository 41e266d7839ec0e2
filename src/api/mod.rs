//! Typed command interface to the out-of-scope backend.
//!
//! One method per query/mutation, with explicit input/output contracts.
//! Any RPC/REST/GraphQL transport can implement `Backend`; the crate
//! ships an HTTP implementation in `api::http` and tests inject scripted
//! in-memory doubles.

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Entry, EntryId, EntryKind, EntryWire, ListFilter, ScopeId, SortOrder};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
}

impl ApiError {
    /// Returns true if this error is transient and the request should be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Network(_) => true,
            ApiError::HttpStatus(status) => *status >= 500,
            ApiError::Decode(_)
            | ApiError::ResponseTooLarge(_)
            | ApiError::InvalidBaseUrl(_)
            | ApiError::InsecureBaseUrl => false,
        }
    }
}

// ============================================================================
// Query wire types
// ============================================================================

/// Wire form of a list query: the filter set plus cursor/limit.
///
/// Doubles as the `filters` payload of `mark_all_read`, where cursor and
/// limit stay empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub uncategorized: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unread_only: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub starred_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntryKind>,
    pub sort_order: SortOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ListQuery {
    pub fn from_filter(filter: &ListFilter) -> Self {
        Self {
            subscription_id: filter.subscription_id,
            tag_id: filter.tag_id,
            uncategorized: filter.uncategorized,
            unread_only: filter.unread_only,
            starred_only: filter.starred_only,
            kind: filter.kind,
            sort_order: filter.sort,
            cursor: None,
            limit: None,
        }
    }

    pub fn with_page(mut self, cursor: Option<String>, limit: u32) -> Self {
        self.cursor = cursor;
        self.limit = Some(limit);
        self
    }
}

/// One fetched page: server-ordered items plus the opaque cursor after
/// the last item, absent when the sequence is exhausted.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub items: Vec<Entry>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListPageWire {
    pub items: Vec<EntryWire>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl ListPageWire {
    pub(crate) fn into_page(self) -> ListPage {
        ListPage {
            items: self.items.into_iter().map(EntryWire::into_entry).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

// ============================================================================
// Mutation wire types
// ============================================================================

/// One entry reference inside a batch mark-read call.
#[derive(Debug, Clone, Serialize)]
pub struct MarkReadEntry {
    pub id: EntryId,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkReadRequest {
    pub entries: Vec<MarkReadEntry>,
    pub read: bool,
    /// Set when the action originated from a list view rather than the
    /// reader, letting the backend attribute implicit-score signals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_list: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetStarredRequest {
    pub id: EntryId,
    pub starred: bool,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetScoreRequest {
    pub id: EntryId,
    pub score: i32,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkAllReadRequest {
    pub filters: ListQuery,
    pub changed_at: DateTime<Utc>,
}

/// Per-scope authoritative unread count carried by mutation responses.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScopeCountWire {
    pub scope: ScopeKindWire,
    pub id: i64,
    pub unread: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ScopeKindWire {
    Subscription,
    Tag,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MutationResponseWire {
    /// Authoritative post-write entity states, including server
    /// `updated_at`. Empty for bulk operations.
    #[serde(default)]
    pub entries: Vec<EntryWire>,
    #[serde(default)]
    pub unread_counts: Vec<ScopeCountWire>,
}

/// Authoritative outcome of a mutation.
#[derive(Debug, Clone, Default)]
pub struct MutationResponse {
    pub entries: Vec<Entry>,
    pub unread_counts: Vec<(ScopeId, i64)>,
}

impl MutationResponseWire {
    pub(crate) fn into_response(self) -> MutationResponse {
        MutationResponse {
            entries: self.entries.into_iter().map(EntryWire::into_entry).collect(),
            unread_counts: self
                .unread_counts
                .into_iter()
                .map(|c| {
                    let scope = match c.scope {
                        ScopeKindWire::Subscription => ScopeId::Subscription(c.id),
                        ScopeKindWire::Tag => ScopeId::Tag(c.id),
                    };
                    (scope, c.unread)
                })
                .collect(),
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// The backend boundary: list/entry queries and mutation endpoints.
///
/// Every success response of a single-entry mutation carries the
/// authoritative post-write entity state; the mutation tracker resolves
/// concurrent completions against its `updated_at`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_entries(&self, query: ListQuery) -> Result<ListPage, ApiError>;
    async fn entry(&self, id: EntryId) -> Result<Entry, ApiError>;
    async fn mark_read(&self, request: MarkReadRequest) -> Result<MutationResponse, ApiError>;
    async fn set_starred(&self, request: SetStarredRequest) -> Result<MutationResponse, ApiError>;
    async fn set_score(&self, request: SetScoreRequest) -> Result<MutationResponse, ApiError>;
    async fn mark_all_read(
        &self,
        request: MarkAllReadRequest,
    ) -> Result<MutationResponse, ApiError>;
}
