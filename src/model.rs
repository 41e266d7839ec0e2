//! Domain snapshots shared by every component: entries, filters, scopes.
//!
//! Entries are immutable value snapshots — every state transition produces
//! a new `Entry`, never an in-place mutation of a shared object, so a stale
//! clone held by a suspended task cannot corrupt newer data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Database-style identifier for an entry.
pub type EntryId = i64;
/// Identifier for a subscription (feed).
pub type SubscriptionId = i64;
/// Identifier for a tag (folder/label).
pub type TagId = i64;

// ============================================================================
// Scopes
// ============================================================================

/// The unit by which aggregate unread counts are tracked.
///
/// A subscription and a tag with the same numeric ID are distinct scopes,
/// so the discriminant participates in hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeId {
    Subscription(SubscriptionId),
    Tag(TagId),
}

// ============================================================================
// Ordering and filtering
// ============================================================================

/// Server-side sort order for a list sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Content kind of an entry, used as an optional list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Article,
    Audio,
    Video,
}

/// Filter-set identity for a paginated list sequence.
///
/// Every fetched page belongs to exactly one `ListFilter`; changing any
/// field logically starts a new sequence. `Hash`/`Eq` make the filter the
/// key of the list store, so two views with identical filters share pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ListFilter {
    pub subscription_id: Option<SubscriptionId>,
    pub tag_id: Option<TagId>,
    /// Restrict to entries whose subscription has no tag.
    pub uncategorized: bool,
    pub unread_only: bool,
    pub starred_only: bool,
    pub kind: Option<EntryKind>,
    pub sort: SortOrder,
}

impl ListFilter {
    /// Filter for a single subscription, newest first.
    pub fn subscription(id: SubscriptionId) -> Self {
        Self {
            subscription_id: Some(id),
            ..Self::default()
        }
    }

    /// Filter for a tag, newest first.
    pub fn tag(id: TagId) -> Self {
        Self {
            tag_id: Some(id),
            ..Self::default()
        }
    }

    /// The unread-only variant of this filter.
    pub fn unread_only(mut self) -> Self {
        self.unread_only = true;
        self
    }

    /// The starred-only variant of this filter.
    pub fn starred_only(mut self) -> Self {
        self.starred_only = true;
        self
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A feed entry snapshot.
///
/// String payload fields use `Arc<str>` so that producing a new snapshot
/// for a read/starred flip is an O(1) reference bump per field rather than
/// a copy of the article body.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: EntryId,
    /// Owning subscription. `None` for orphaned entries kept after an
    /// unsubscribe (the server still lists them under starred views).
    pub subscription_id: Option<SubscriptionId>,
    /// Tags of the owning subscription, carried so mutations can adjust
    /// per-tag unread counts without a lookup round trip.
    pub tags: Vec<TagId>,
    pub title: Arc<str>,
    pub url: Option<Arc<str>>,
    pub summary: Option<Arc<str>>,
    pub content_html: Option<Arc<str>>,
    pub kind: Option<EntryKind>,
    pub read: bool,
    pub starred: bool,
    /// Explicit user rating.
    pub score: Option<i32>,
    /// Derived interest signal, read-only on the client.
    pub implicit_score: Option<f32>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// Server-assigned logical timestamp of the last authoritative write.
    /// All winner resolution and staleness guards compare this field.
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// Produce a new snapshot with the given partial change applied.
    ///
    /// `updated_at` is left untouched: only the server advances it. The
    /// delta store keeps its own `changed_at` for the optimistic write.
    pub fn with_change(&self, change: &StateChange) -> Entry {
        let mut next = self.clone();
        if let Some(read) = change.read {
            next.read = read;
        }
        if let Some(starred) = change.starred {
            next.starred = starred;
        }
        if let Some(score) = change.score {
            next.score = Some(score);
        }
        next
    }

    /// Ordering key for display: `published_at`, falling back to
    /// `fetched_at` for feeds that omit publication dates.
    pub fn order_key(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.fetched_at)
    }

    /// Whether this entry satisfies a filter's membership conditions.
    ///
    /// Only the conditions that entry state can change are checked here
    /// (`unread_only`, `starred_only`, `kind`); scope membership is the
    /// server's side of the contract and is not second-guessed.
    pub fn matches(&self, filter: &ListFilter) -> bool {
        if filter.unread_only && self.read {
            return false;
        }
        if filter.starred_only && !self.starred {
            return false;
        }
        if let Some(kind) = filter.kind {
            if self.kind != Some(kind) {
                return false;
            }
        }
        true
    }
}

/// Partial state change applied by an optimistic write.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StateChange {
    pub read: Option<bool>,
    pub starred: Option<bool>,
    pub score: Option<i32>,
}

impl StateChange {
    pub fn read(value: bool) -> Self {
        Self {
            read: Some(value),
            ..Self::default()
        }
    }

    pub fn starred(value: bool) -> Self {
        Self {
            starred: Some(value),
            ..Self::default()
        }
    }

    pub fn score(value: i32) -> Self {
        Self {
            score: Some(value),
            ..Self::default()
        }
    }
}

// ============================================================================
// Pending entry stubs
// ============================================================================

/// Lightweight stub for an entry pushed by the server ahead of the next
/// list fetch. Only display-ordering data; the full entry arrives with
/// the next page fetch or an explicit entry fetch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntryStub {
    pub id: EntryId,
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default)]
    pub tags: Vec<TagId>,
    pub published_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Wire row
// ============================================================================

/// Wire representation of an entry as the backend serializes it.
/// Converts to `Entry` via `into_entry()` with `Arc` wrapping.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryWire {
    pub id: EntryId,
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default)]
    pub tags: Vec<TagId>,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content_html: Option<String>,
    #[serde(default)]
    pub kind: Option<EntryKind>,
    pub read: bool,
    pub starred: bool,
    #[serde(default)]
    pub score: Option<i32>,
    #[serde(default)]
    pub implicit_score: Option<f32>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntryWire {
    pub fn into_entry(self) -> Entry {
        Entry {
            id: self.id,
            subscription_id: self.subscription_id,
            tags: self.tags,
            title: Arc::from(self.title),
            url: self.url.map(Arc::from),
            summary: self.summary.map(Arc::from),
            content_html: self.content_html.map(Arc::from),
            kind: self.kind,
            read: self.read,
            starred: self.starred,
            score: self.score,
            implicit_score: self.implicit_score,
            published_at: self.published_at,
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
        }
    }
}
