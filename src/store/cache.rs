//! Entity and list caches rewritten by the optimistic updater.
//!
//! The single-entity view is a bounded LRU; the member-of-list view is a
//! growing page sequence per filter identity. Both hold immutable `Entry`
//! snapshots: an update replaces the snapshot wholesale, so clones held by
//! suspended tasks keep observing the state they captured.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};

use crate::model::{Entry, EntryId, ListFilter};

/// Bound on the single-entity cache. Entries carry their content bodies,
/// so an unbounded map would grow with every article ever opened.
const ENTRY_CACHE_CAP: usize = 512;

// ============================================================================
// Single-entity cache
// ============================================================================

/// LRU cache of full entry snapshots keyed by ID.
pub struct EntryCache {
    inner: LruCache<EntryId, Entry>,
}

impl std::fmt::Debug for EntryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCache")
            .field("len", &self.inner.len())
            .field("cap", &self.inner.cap())
            .finish()
    }
}

impl EntryCache {
    pub fn new() -> Self {
        Self::with_capacity(ENTRY_CACHE_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(cap),
        }
    }

    /// Look up without promoting — used by merge and staleness checks,
    /// which must not perturb recency under read-only evaluation.
    pub fn peek(&self, id: EntryId) -> Option<&Entry> {
        self.inner.peek(&id)
    }

    /// Look up and promote to most-recently-used.
    pub fn get(&mut self, id: EntryId) -> Option<&Entry> {
        self.inner.get(&id)
    }

    pub fn insert(&mut self, entry: Entry) {
        self.inner.put(entry.id, entry);
    }

    /// Replace the cached snapshot for `id` if present, without changing
    /// its recency. Returns whether a rewrite happened.
    pub fn rewrite(&mut self, id: EntryId, f: impl FnOnce(&Entry) -> Entry) -> bool {
        if let Some(slot) = self.inner.peek_mut(&id) {
            *slot = f(slot);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: EntryId) {
        self.inner.pop(&id);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for EntryCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Paged list sequences
// ============================================================================

/// One filter identity's fetched pages, in fetch order.
///
/// `generation` implements last-fetch-wins for reads: a refetch bumps it,
/// and page results carrying a stale generation are discarded. Writes are
/// never superseded this way — they resolve through the mutation tracker.
#[derive(Debug, Default)]
pub struct PagedList {
    pages: Vec<Vec<Entry>>,
    next_cursor: Option<String>,
    /// True once at least one fetch for this sequence completed.
    loaded: bool,
    fetching: bool,
    generation: u64,
    /// Inline, retryable error scoped to this list only.
    error: Option<String>,
}

impl PagedList {
    /// Begin a fetch, returning the generation the result must carry.
    pub fn begin_fetch(&mut self) -> u64 {
        self.fetching = true;
        self.error = None;
        self.generation
    }

    /// Begin a refetch: discards loaded pages and supersedes any fetch
    /// still in flight by bumping the generation.
    pub fn begin_refetch(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.pages.clear();
        self.next_cursor = None;
        self.loaded = false;
        self.fetching = true;
        self.error = None;
        self.generation
    }

    /// Append a fetched page. Returns false (and changes nothing) when
    /// the result belongs to a superseded fetch.
    pub fn complete_fetch(
        &mut self,
        generation: u64,
        items: Vec<Entry>,
        next_cursor: Option<String>,
    ) -> bool {
        if generation != self.generation {
            tracing::debug!(
                stale = generation,
                current = self.generation,
                "Discarding superseded list fetch"
            );
            return false;
        }
        self.pages.push(items);
        self.next_cursor = next_cursor;
        self.loaded = true;
        self.fetching = false;
        self.error = None;
        true
    }

    /// Record a failed fetch. Stale failures are ignored like stale pages.
    pub fn fail_fetch(&mut self, generation: u64, error: String) -> bool {
        if generation != self.generation {
            return false;
        }
        self.fetching = false;
        self.error = Some(error);
        true
    }

    /// Pages in fetch order. Server-provided order within each page is
    /// preserved untouched.
    pub fn pages(&self) -> &[Vec<Entry>] {
        &self.pages
    }

    /// Whether the server indicated another page after the last one.
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn rewrite_entry(&mut self, id: EntryId, f: &impl Fn(&Entry) -> Entry) -> bool {
        let mut rewrote = false;
        for page in &mut self.pages {
            for slot in page.iter_mut().filter(|e| e.id == id) {
                *slot = f(slot);
                rewrote = true;
            }
        }
        rewrote
    }

    fn newest_updated_at(&self, id: EntryId) -> Option<DateTime<Utc>> {
        self.pages
            .iter()
            .flatten()
            .filter(|e| e.id == id)
            .map(|e| e.updated_at)
            .max()
    }
}

// ============================================================================
// List store
// ============================================================================

/// All paged sequences of the session, keyed by filter identity.
#[derive(Debug, Default)]
pub struct ListStore {
    lists: HashMap<ListFilter, PagedList>,
}

impl ListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filter: &ListFilter) -> Option<&PagedList> {
        self.lists.get(filter)
    }

    pub fn ensure_mut(&mut self, filter: &ListFilter) -> &mut PagedList {
        self.lists.entry(filter.clone()).or_default()
    }

    pub fn get_mut(&mut self, filter: &ListFilter) -> Option<&mut PagedList> {
        self.lists.get_mut(filter)
    }

    /// Rewrite every cached membership of `id` across all sequences.
    /// Returns the number of sequences touched.
    pub fn rewrite_entry(&mut self, id: EntryId, f: impl Fn(&Entry) -> Entry) -> usize {
        let mut touched = 0;
        for list in self.lists.values_mut() {
            if list.rewrite_entry(id, &f) {
                touched += 1;
            }
        }
        touched
    }

    /// First cached membership of `id` across all sequences.
    pub fn find_entry(&self, id: EntryId) -> Option<&Entry> {
        self.lists
            .values()
            .flat_map(|list| list.pages.iter().flatten())
            .find(|e| e.id == id)
    }

    /// Greatest `updated_at` cached for `id` across all sequences.
    pub fn newest_updated_at(&self, id: EntryId) -> Option<DateTime<Utc>> {
        self.lists
            .values()
            .filter_map(|list| list.newest_updated_at(id))
            .max()
    }

    /// Drop all fetched pages. Sequences refetch lazily afterwards; any
    /// in-flight fetch is superseded by the generation bump.
    pub fn invalidate_all(&mut self) {
        for list in self.lists.values_mut() {
            list.begin_refetch();
            list.fetching = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateChange;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(id: EntryId, updated_at: DateTime<Utc>) -> Entry {
        Entry {
            id,
            subscription_id: Some(1),
            tags: Vec::new(),
            title: Arc::from("t"),
            url: None,
            summary: None,
            content_html: None,
            kind: None,
            read: false,
            starred: false,
            score: None,
            implicit_score: None,
            published_at: None,
            fetched_at: ts(0),
            updated_at,
        }
    }

    #[test]
    fn test_entry_cache_rewrite_in_place() {
        let mut cache = EntryCache::new();
        cache.insert(entry(1, ts(0)));

        let rewrote = cache.rewrite(1, |e| e.with_change(&StateChange::read(true)));
        assert!(rewrote);
        assert!(cache.peek(1).unwrap().read);

        assert!(!cache.rewrite(99, |e| e.clone()));
    }

    #[test]
    fn test_entry_cache_evicts_at_capacity() {
        let mut cache = EntryCache::with_capacity(2);
        cache.insert(entry(1, ts(0)));
        cache.insert(entry(2, ts(0)));
        cache.insert(entry(3, ts(0)));

        assert!(cache.peek(1).is_none(), "least recent evicted");
        assert!(cache.peek(2).is_some());
        assert!(cache.peek(3).is_some());
    }

    #[test]
    fn test_paged_list_generation_discards_stale_fetch() {
        let mut list = PagedList::default();
        let stale = list.begin_fetch();
        let current = list.begin_refetch();

        assert!(!list.complete_fetch(stale, vec![entry(1, ts(0))], None));
        assert!(list.pages().is_empty());

        assert!(list.complete_fetch(current, vec![entry(2, ts(0))], Some("c".into())));
        assert_eq!(list.pages().len(), 1);
        assert!(list.has_more());
    }

    #[test]
    fn test_paged_list_error_scoped_and_cleared() {
        let mut list = PagedList::default();
        let generation = list.begin_fetch();
        assert!(list.fail_fetch(generation, "boom".into()));
        assert_eq!(list.error(), Some("boom"));
        assert!(!list.is_fetching());

        let generation = list.begin_fetch();
        assert!(list.error().is_none(), "retry clears the inline error");
        list.complete_fetch(generation, Vec::new(), None);
        assert!(list.is_loaded());
    }

    #[test]
    fn test_list_store_rewrites_every_membership() {
        let mut lists = ListStore::new();
        let all = ListFilter::default();
        let unread = ListFilter::default().unread_only();

        let g = lists.ensure_mut(&all).begin_fetch();
        lists
            .ensure_mut(&all)
            .complete_fetch(g, vec![entry(1, ts(0)), entry(2, ts(0))], None);
        let g = lists.ensure_mut(&unread).begin_fetch();
        lists
            .ensure_mut(&unread)
            .complete_fetch(g, vec![entry(1, ts(0))], None);

        let touched = lists.rewrite_entry(1, |e| e.with_change(&StateChange::starred(true)));
        assert_eq!(touched, 2);
        for filter in [&all, &unread] {
            let starred: Vec<bool> = lists.get(filter).unwrap().pages()[0]
                .iter()
                .filter(|e| e.id == 1)
                .map(|e| e.starred)
                .collect();
            assert!(starred.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_newest_updated_at_across_lists() {
        let mut lists = ListStore::new();
        let all = ListFilter::default();
        let starred = ListFilter::default().starred_only();

        let g = lists.ensure_mut(&all).begin_fetch();
        lists
            .ensure_mut(&all)
            .complete_fetch(g, vec![entry(1, ts(5))], None);
        let g = lists.ensure_mut(&starred).begin_fetch();
        lists
            .ensure_mut(&starred)
            .complete_fetch(g, vec![entry(1, ts(9))], None);

        assert_eq!(lists.newest_updated_at(1), Some(ts(9)));
        assert_eq!(lists.newest_updated_at(42), None);
    }

    #[test]
    fn test_invalidate_all_clears_pages() {
        let mut lists = ListStore::new();
        let all = ListFilter::default();
        let g = lists.ensure_mut(&all).begin_fetch();
        lists
            .ensure_mut(&all)
            .complete_fetch(g, vec![entry(1, ts(0))], None);

        lists.invalidate_all();
        let list = lists.get(&all).unwrap();
        assert!(list.pages().is_empty());
        assert!(!list.is_loaded());
        assert!(!list.is_fetching());
    }
}
