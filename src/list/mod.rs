//! Cursor-paginated list navigation.
//!
//! The navigator resolves "next"/"previous" entry identity relative to the
//! currently open entry, keeps working when that entry has been filtered
//! out of the live list (marking read in an unread-only view), and decides
//! when to proactively request the next page so forward reading never
//! blocks on a network round trip.

mod merge;

pub use merge::{merge_entry, merge_list, reconcile};

use std::collections::HashMap;

use crate::model::{Entry, EntryId, ListFilter};

/// Default distance from the loaded boundary at which the next page is
/// requested.
pub const DEFAULT_PREFETCH_THRESHOLD: usize = 3;

/// Last-known next/previous entity identity relative to one open entry.
///
/// Lives outside the merged-list computation path, so it survives the
/// open entry disappearing from the list it came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adjacency {
    pub prev: Option<EntryId>,
    pub next: Option<EntryId>,
}

/// Navigation state for one (filter, open entry) session.
///
/// Owned by the session, not by any view's lifetime; the adjacency map is
/// cleared when the filter changes.
#[derive(Debug)]
pub struct Navigator {
    filter: ListFilter,
    open: Option<EntryId>,
    adjacency: HashMap<EntryId, Adjacency>,
    prefetch_threshold: usize,
}

impl Navigator {
    pub fn new(filter: ListFilter, prefetch_threshold: usize) -> Self {
        Self {
            filter,
            open: None,
            adjacency: HashMap::new(),
            prefetch_threshold,
        }
    }

    pub fn filter(&self) -> &ListFilter {
        &self.filter
    }

    /// Switch to a different filter identity. Remembered adjacency is
    /// meaningless across sequences and is dropped; the open entry is
    /// kept — the user may still be reading it.
    pub fn set_filter(&mut self, filter: ListFilter) {
        if self.filter != filter {
            tracing::debug!(?filter, "Filter changed, clearing adjacency records");
            self.adjacency.clear();
            self.filter = filter;
        }
    }

    pub fn open(&mut self, id: EntryId) {
        self.open = Some(id);
    }

    pub fn close(&mut self) {
        self.open = None;
    }

    pub fn open_id(&self) -> Option<EntryId> {
        self.open
    }

    /// Record adjacency for the open entry against the current merged
    /// list. Call on every list update; when the open entry is no longer
    /// present the previously stored record is deliberately left intact.
    pub fn observe_list(&mut self, entities: &[Entry]) {
        let Some(open) = self.open else {
            return;
        };
        if let Some(index) = entities.iter().position(|e| e.id == open) {
            let record = Adjacency {
                prev: index.checked_sub(1).and_then(|i| entities.get(i)).map(|e| e.id),
                next: entities.get(index + 1).map(|e| e.id),
            };
            self.adjacency.insert(open, record);
        }
    }

    /// Identity of the entry after the open one. Pure: no I/O, only an ID
    /// for the caller to act on.
    ///
    /// Resolution order: live position in `entities`; the remembered
    /// adjacency record when the open entry has been filtered out; the
    /// list head when nothing is remembered. `None` only at a genuine
    /// boundary.
    pub fn next_entry_id(&self, entities: &[Entry]) -> Option<EntryId> {
        let open = self.open?;
        if let Some(index) = entities.iter().position(|e| e.id == open) {
            return entities.get(index + 1).map(|e| e.id);
        }
        if let Some(record) = self.adjacency.get(&open) {
            return record.next;
        }
        entities.first().map(|e| e.id)
    }

    /// Identity of the entry before the open one. Mirror of
    /// `next_entry_id`, falling back to the list tail.
    pub fn previous_entry_id(&self, entities: &[Entry]) -> Option<EntryId> {
        let open = self.open?;
        if let Some(index) = entities.iter().position(|e| e.id == open) {
            return index.checked_sub(1).and_then(|i| entities.get(i)).map(|e| e.id);
        }
        if let Some(record) = self.adjacency.get(&open) {
            return record.prev;
        }
        entities.last().map(|e| e.id)
    }

    /// Whether the next page should be requested now: the open position
    /// is within `prefetch_threshold` of the loaded boundary, another
    /// page is known to exist, and none is currently being fetched.
    pub fn should_prefetch(&self, entities: &[Entry], has_more: bool, fetching: bool) -> bool {
        if !has_more || fetching {
            return false;
        }
        let Some(open) = self.open else {
            return false;
        };
        let Some(index) = entities.iter().position(|e| e.id == open) else {
            return false;
        };
        entities.len() - index <= self.prefetch_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(id: EntryId) -> Entry {
        use std::sync::Arc;
        Entry {
            id,
            subscription_id: Some(1),
            tags: Vec::new(),
            title: Arc::from(format!("Entry {}", id)),
            url: None,
            summary: None,
            content_html: None,
            kind: None,
            read: false,
            starred: false,
            score: None,
            implicit_score: None,
            published_at: Some(ts(id)),
            fetched_at: ts(0),
            updated_at: ts(0),
        }
    }

    fn entries(ids: &[EntryId]) -> Vec<Entry> {
        ids.iter().copied().map(entry).collect()
    }

    fn navigator() -> Navigator {
        Navigator::new(ListFilter::default(), DEFAULT_PREFETCH_THRESHOLD)
    }

    #[test]
    fn test_live_adjacency() {
        let mut nav = navigator();
        let list = entries(&[1, 2, 3]);
        nav.open(2);
        nav.observe_list(&list);

        assert_eq!(nav.next_entry_id(&list), Some(3));
        assert_eq!(nav.previous_entry_id(&list), Some(1));
    }

    #[test]
    fn test_boundaries_return_none() {
        let mut nav = navigator();
        let list = entries(&[1, 2, 3]);

        nav.open(3);
        nav.observe_list(&list);
        assert_eq!(nav.next_entry_id(&list), None);

        nav.open(1);
        nav.observe_list(&list);
        assert_eq!(nav.previous_entry_id(&list), None);
    }

    #[test]
    fn test_adjacency_survives_open_entry_removal() {
        let mut nav = navigator();
        let list = entries(&[1, 2, 3]);
        nav.open(2);
        nav.observe_list(&list);

        // Entry 2 marked read in an unread-only view: gone from the list.
        let filtered = entries(&[1, 3]);
        nav.observe_list(&filtered);

        assert_eq!(nav.next_entry_id(&filtered), Some(3));
        assert_eq!(nav.previous_entry_id(&filtered), Some(1));
    }

    #[test]
    fn test_fallback_to_list_edges_without_record() {
        let mut nav = navigator();
        // Open an entry that was never observed in any list.
        nav.open(99);
        let list = entries(&[1, 2, 3]);

        assert_eq!(nav.next_entry_id(&list), Some(1));
        assert_eq!(nav.previous_entry_id(&list), Some(3));
    }

    #[test]
    fn test_no_open_entry_yields_none() {
        let nav = navigator();
        let list = entries(&[1, 2]);
        assert_eq!(nav.next_entry_id(&list), None);
        assert_eq!(nav.previous_entry_id(&list), None);
    }

    #[test]
    fn test_filter_change_clears_adjacency() {
        let mut nav = navigator();
        let list = entries(&[1, 2, 3]);
        nav.open(2);
        nav.observe_list(&list);

        nav.set_filter(ListFilter::default().unread_only());

        // No record and entry 2 not in the (empty) list: edge fallback.
        assert_eq!(nav.next_entry_id(&[]), None);
        let fresh = entries(&[7, 8]);
        assert_eq!(nav.next_entry_id(&fresh), Some(7));
    }

    #[test]
    fn test_same_filter_keeps_adjacency() {
        let mut nav = navigator();
        let list = entries(&[1, 2, 3]);
        nav.open(2);
        nav.observe_list(&list);

        nav.set_filter(ListFilter::default());
        assert_eq!(nav.next_entry_id(&entries(&[1, 3])), Some(3));
    }

    #[test]
    fn test_prefetch_boundary() {
        let mut nav = navigator();
        let list = entries(&(1..=10).collect::<Vec<_>>());

        // Index 8 (id 9): 10 - 8 = 2 <= 3 — fetch now.
        nav.open(9);
        assert!(nav.should_prefetch(&list, true, false));

        // Index 6 (id 7): 10 - 6 = 4 > 3 — not yet.
        nav.open(7);
        assert!(!nav.should_prefetch(&list, true, false));
    }

    #[test]
    fn test_prefetch_requires_more_pages_and_idle_fetcher() {
        let mut nav = navigator();
        let list = entries(&[1, 2, 3]);
        nav.open(3);

        assert!(!nav.should_prefetch(&list, false, false), "no further page");
        assert!(!nav.should_prefetch(&list, true, true), "fetch in flight");
        assert!(nav.should_prefetch(&list, true, false));
    }

    #[test]
    fn test_prefetch_skipped_when_open_entry_missing() {
        let mut nav = navigator();
        nav.open(42);
        assert!(!nav.should_prefetch(&entries(&[1, 2, 3]), true, false));
    }
}
