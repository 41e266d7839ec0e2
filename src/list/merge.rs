//! Reconciliation merge: server pages + delta overlay + filters.
//!
//! Pure functions only — invoking them twice on the same inputs yields
//! identical output. Filtering happens after delta application, so an
//! entry marked read in an unread-only view vanishes from the merged
//! output immediately, without a refetch.

use std::collections::HashSet;

use crate::model::{Entry, EntryId, ListFilter};
use crate::store::DeltaStore;

/// Effective single-entry view: the server snapshot with the delta
/// store's read/starred overrides applied.
pub fn merge_entry(entry: &Entry, delta: &DeltaStore) -> Entry {
    let mut merged = entry.clone();
    if let Some(read) = delta.read_override(entry.id) {
        merged.read = read;
    }
    if let Some(starred) = delta.star_override(entry.id) {
        merged.starred = starred;
    }
    merged
}

/// Merge a list of server entries, then drop the ones whose *merged*
/// state no longer satisfies the filter.
pub fn merge_list<'a, I>(entries: I, delta: &DeltaStore, filter: &ListFilter) -> Vec<Entry>
where
    I: IntoIterator<Item = &'a Entry>,
{
    entries
        .into_iter()
        .map(|entry| merge_entry(entry, delta))
        .filter(|merged| merged.matches(filter))
        .collect()
}

/// Produce the final ordered sequence rendered to the user.
///
/// Pages are flattened in fetch order — page order is authoritative and
/// server-provided order within a page is preserved. Entries repeated
/// across pages (the underlying set shifted between cursor fetches) keep
/// their first occurrence. Delta overrides are applied before the
/// defensive re-filter, since delta application can change filter
/// membership post-fetch.
pub fn reconcile(pages: &[Vec<Entry>], delta: &DeltaStore, filter: &ListFilter) -> Vec<Entry> {
    let mut seen: HashSet<EntryId> = HashSet::new();
    pages
        .iter()
        .flatten()
        .filter(|entry| seen.insert(entry.id))
        .map(|entry| merge_entry(entry, delta))
        .filter(|merged| merged.matches(filter))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(id: EntryId, read: bool, starred: bool) -> Entry {
        Entry {
            id,
            subscription_id: Some(1),
            tags: Vec::new(),
            title: Arc::from(format!("Entry {}", id)),
            url: None,
            summary: None,
            content_html: None,
            kind: None,
            read,
            starred,
            score: None,
            implicit_score: None,
            published_at: Some(ts(id)),
            fetched_at: ts(0),
            updated_at: ts(0),
        }
    }

    #[test]
    fn test_merge_entry_applies_overrides() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, None, &[], ts(1));
        delta.set_starred(1, true, ts(1));

        let merged = merge_entry(&entry(1, false, false), &delta);
        assert!(merged.read);
        assert!(merged.starred);
    }

    #[test]
    fn test_merge_entry_without_overrides_is_identity() {
        let delta = DeltaStore::new();
        let original = entry(1, true, false);
        let merged = merge_entry(&original, &delta);
        assert_eq!(merged.read, original.read);
        assert_eq!(merged.starred, original.starred);
    }

    #[test]
    fn test_merge_entry_idempotent() {
        let mut delta = DeltaStore::new();
        delta.mark_unread(2, None, &[], ts(1));

        let once = merge_entry(&entry(2, true, false), &delta);
        let twice = merge_entry(&once, &delta);
        assert_eq!(once.read, twice.read);
        assert_eq!(once.starred, twice.starred);
    }

    #[test]
    fn test_unread_only_drops_entries_read_via_delta() {
        let mut delta = DeltaStore::new();
        delta.mark_read(2, None, &[], ts(1));

        let entries = vec![entry(1, false, false), entry(2, false, false)];
        let filter = ListFilter::default().unread_only();
        let merged = merge_list(&entries, &delta, &filter);

        let ids: Vec<EntryId> = merged.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1], "entry read via delta vanishes immediately");
    }

    #[test]
    fn test_unread_only_keeps_entries_unread_via_delta() {
        let mut delta = DeltaStore::new();
        delta.mark_unread(2, None, &[], ts(1));

        // Server says read, the override says unread: stays visible.
        let entries = vec![entry(2, true, false)];
        let filter = ListFilter::default().unread_only();
        let merged = merge_list(&entries, &delta, &filter);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_reconcile_preserves_page_order() {
        let delta = DeltaStore::new();
        let pages = vec![
            vec![entry(5, false, false), entry(4, false, false)],
            vec![entry(3, false, false), entry(2, false, false)],
        ];
        let merged = reconcile(&pages, &delta, &ListFilter::default());
        let ids: Vec<EntryId> = merged.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 4, 3, 2]);
    }

    #[test]
    fn test_reconcile_dedupes_across_pages_first_wins() {
        let delta = DeltaStore::new();
        let pages = vec![
            vec![entry(5, false, false), entry(4, false, false)],
            // Entry 4 slid into page two after a new entry landed server-side.
            vec![entry(4, false, false), entry(3, false, false)],
        ];
        let merged = reconcile(&pages, &delta, &ListFilter::default());
        let ids: Vec<EntryId> = merged.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut delta = DeltaStore::new();
        delta.mark_read(4, None, &[], ts(1));
        let pages = vec![vec![entry(5, false, false), entry(4, false, false)]];
        let filter = ListFilter::default().unread_only();

        let first = reconcile(&pages, &delta, &filter);
        let second = reconcile(&pages, &delta, &filter);
        let first_ids: Vec<EntryId> = first.iter().map(|e| e.id).collect();
        let second_ids: Vec<EntryId> = second.iter().map(|e| e.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_entry() -> impl Strategy<Value = Entry> {
            (0..32i64, any::<bool>(), any::<bool>())
                .prop_map(|(id, read, starred)| entry(id, read, starred))
        }

        fn arb_delta() -> impl Strategy<Value = DeltaStore> {
            proptest::collection::vec((0..32i64, 0..3u8, 0..50i64), 0..48).prop_map(|ops| {
                let mut delta = DeltaStore::new();
                for (id, op, t) in ops {
                    match op {
                        0 => delta.mark_read(id, None, &[], ts(t)),
                        1 => delta.mark_unread(id, None, &[], ts(t)),
                        _ => delta.set_starred(id, t % 2 == 0, ts(t)),
                    }
                }
                delta
            })
        }

        proptest! {
            // Applying the merge to its own output changes nothing.
            #[test]
            fn merge_entry_idempotent(e in arb_entry(), delta in arb_delta()) {
                let once = merge_entry(&e, &delta);
                let twice = merge_entry(&once, &delta);
                prop_assert_eq!(once.read, twice.read);
                prop_assert_eq!(once.starred, twice.starred);
            }

            // No entry whose merged read state is true survives an
            // unread-only merge, and no merged unstarred entry survives
            // a starred-only merge.
            #[test]
            fn filter_consistent(
                entries in proptest::collection::vec(arb_entry(), 0..32),
                delta in arb_delta(),
            ) {
                let unread = merge_list(&entries, &delta, &ListFilter::default().unread_only());
                prop_assert!(unread.iter().all(|e| !e.read));

                let starred = merge_list(&entries, &delta, &ListFilter::default().starred_only());
                prop_assert!(starred.iter().all(|e| e.starred));
            }
        }
    }
}
