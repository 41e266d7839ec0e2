//! Real-time delta overlay against the last authoritative server snapshot.
//!
//! The delta store holds the state changes the server has not yet reflected
//! back to us: optimistic writes awaiting confirmation and push events that
//! arrived ahead of the next list fetch. It is session-lifetime state, owned
//! by the `SessionStore` and mutated only through the operations here.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::model::{Entry, EntryId, EntryStub, ScopeId, TagId};

/// Overlay of not-yet-reconciled state changes.
///
/// Invariant: an entry ID never appears in both sets of a pair
/// (`read_ids`/`unread_ids`, `starred_ids`/`unstarred_ids`). Last write
/// wins by removal from the opposing set.
#[derive(Debug, Default)]
pub struct DeltaStore {
    read_ids: HashSet<EntryId>,
    unread_ids: HashSet<EntryId>,
    starred_ids: HashSet<EntryId>,
    unstarred_ids: HashSet<EntryId>,

    /// Logical timestamp of the active read/unread override per entry.
    /// A server snapshot with `updated_at >=` this subsumes the override.
    read_changed_at: HashMap<EntryId, DateTime<Utc>>,
    /// Same, for the starred/unstarred override.
    star_changed_at: HashMap<EntryId, DateTime<Utc>>,

    /// Signed unread-count adjustments per scope, applied on top of the
    /// last authoritative counts.
    unread_deltas: HashMap<ScopeId, i64>,

    /// Entries announced by `new_entry` push events, ahead of the next
    /// list fetch. Ordered by arrival.
    pending_entries: Vec<EntryStub>,
}

impl DeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Read/unread overrides
    // ========================================================================

    /// Record a read override for `id` and adjust unread counts for its
    /// subscription scope and every tag scope by -1.
    ///
    /// No-op (including counts) when the read override is already present,
    /// so callers may retry without double-counting.
    pub fn mark_read(
        &mut self,
        id: EntryId,
        scope: Option<ScopeId>,
        tags: &[TagId],
        changed_at: DateTime<Utc>,
    ) {
        if self.read_ids.contains(&id) {
            self.read_changed_at.insert(id, changed_at);
            return;
        }
        self.unread_ids.remove(&id);
        self.read_ids.insert(id);
        self.read_changed_at.insert(id, changed_at);
        self.adjust_scopes(scope, tags, -1);
        self.check_invariants();
    }

    /// Record an unread override for `id` and adjust unread counts by +1.
    pub fn mark_unread(
        &mut self,
        id: EntryId,
        scope: Option<ScopeId>,
        tags: &[TagId],
        changed_at: DateTime<Utc>,
    ) {
        if self.unread_ids.contains(&id) {
            self.read_changed_at.insert(id, changed_at);
            return;
        }
        self.read_ids.remove(&id);
        self.unread_ids.insert(id);
        self.read_changed_at.insert(id, changed_at);
        self.adjust_scopes(scope, tags, 1);
        self.check_invariants();
    }

    // ========================================================================
    // Starred overrides
    // ========================================================================

    /// Record a starred override. Starred state is orthogonal to unread
    /// accounting, so no count delta is applied.
    pub fn set_starred(&mut self, id: EntryId, starred: bool, changed_at: DateTime<Utc>) {
        if starred {
            self.unstarred_ids.remove(&id);
            self.starred_ids.insert(id);
        } else {
            self.starred_ids.remove(&id);
            self.unstarred_ids.insert(id);
        }
        self.star_changed_at.insert(id, changed_at);
        self.check_invariants();
    }

    // ========================================================================
    // Overrides lookup (merge contract)
    // ========================================================================

    /// Effective read override for `id`, if any.
    pub fn read_override(&self, id: EntryId) -> Option<bool> {
        if self.read_ids.contains(&id) {
            Some(true)
        } else if self.unread_ids.contains(&id) {
            Some(false)
        } else {
            None
        }
    }

    /// Effective starred override for `id`, if any.
    pub fn star_override(&self, id: EntryId) -> Option<bool> {
        if self.starred_ids.contains(&id) {
            Some(true)
        } else if self.unstarred_ids.contains(&id) {
            Some(false)
        } else {
            None
        }
    }

    /// Whether any override or pending stub references `id`.
    pub fn touches(&self, id: EntryId) -> bool {
        self.read_override(id).is_some()
            || self.star_override(id).is_some()
            || self.pending_entries.iter().any(|stub| stub.id == id)
    }

    // ========================================================================
    // Unread counts
    // ========================================================================

    /// Signed unread-count adjustment for a scope (0 when untouched).
    pub fn unread_delta(&self, scope: ScopeId) -> i64 {
        self.unread_deltas.get(&scope).copied().unwrap_or(0)
    }

    /// Zero the unread adjustment for the given scopes. Used when a
    /// mutation response carries fresh authoritative counts for them.
    pub fn clear_unread_deltas(&mut self, scopes: &[ScopeId]) {
        for scope in scopes {
            self.unread_deltas.remove(scope);
        }
    }

    /// Force the unread adjustment for a scope to a specific value.
    /// Used by bulk mark-read, which zeroes a scope rather than counting.
    pub fn set_unread_delta(&mut self, scope: ScopeId, delta: i64) {
        if delta == 0 {
            self.unread_deltas.remove(&scope);
        } else {
            self.unread_deltas.insert(scope, delta);
        }
    }

    /// Scopes with a non-zero unread adjustment.
    pub fn adjusted_scopes(&self) -> Vec<ScopeId> {
        self.unread_deltas.keys().copied().collect()
    }

    fn adjust_scopes(&mut self, scope: Option<ScopeId>, tags: &[TagId], by: i64) {
        if let Some(scope) = scope {
            *self.unread_deltas.entry(scope).or_insert(0) += by;
        }
        for &tag in tags {
            *self.unread_deltas.entry(ScopeId::Tag(tag)).or_insert(0) += by;
        }
        self.unread_deltas.retain(|_, v| *v != 0);
    }

    // ========================================================================
    // Pending entries
    // ========================================================================

    /// Record a `new_entry` push. The stub is queued for display ("N new
    /// entries") and the unread counts for its scopes move immediately.
    ///
    /// Duplicate announcements for the same ID are ignored.
    pub fn record_new_entry(&mut self, stub: EntryStub) {
        if self.pending_entries.iter().any(|s| s.id == stub.id) {
            return;
        }
        let scope = stub.subscription_id.map(ScopeId::Subscription);
        let tags = stub.tags.clone();
        self.adjust_scopes(scope, &tags, 1);
        self.pending_entries.push(stub);
    }

    /// Pending entry stubs in arrival order.
    pub fn pending_entries(&self) -> &[EntryStub] {
        &self.pending_entries
    }

    /// Drop pending stubs whose IDs appeared in a fetched list page: the
    /// snapshot now accounts for them, including their unread counts, so
    /// the provisional adjustment made at announcement time is undone.
    pub fn absorb_listed(&mut self, listed: &[EntryId]) {
        if self.pending_entries.is_empty() {
            return;
        }
        let listed: HashSet<EntryId> = listed.iter().copied().collect();
        let pending = std::mem::take(&mut self.pending_entries);
        for stub in pending {
            if listed.contains(&stub.id) {
                let scope = stub.subscription_id.map(ScopeId::Subscription);
                self.adjust_scopes(scope, &stub.tags, -1);
            } else {
                self.pending_entries.push(stub);
            }
        }
    }

    /// Withdraw every override for an entry, reversing the unread-count
    /// adjustments the overrides made on the way in. Used by rollback,
    /// which restores the pre-optimistic state after all writes failed.
    pub fn rollback_entry(&mut self, id: EntryId, scope: Option<ScopeId>, tags: &[TagId]) {
        if self.read_ids.remove(&id) {
            self.adjust_scopes(scope, tags, 1);
        }
        if self.unread_ids.remove(&id) {
            self.adjust_scopes(scope, tags, -1);
        }
        self.read_changed_at.remove(&id);
        self.starred_ids.remove(&id);
        self.unstarred_ids.remove(&id);
        self.star_changed_at.remove(&id);
    }

    // ========================================================================
    // Snapshot subsumption
    // ========================================================================

    /// Observe an authoritative server snapshot for an entry.
    ///
    /// Overrides whose `changed_at` is older than or equal to the
    /// snapshot's `updated_at` are cleared — the server has caught up.
    /// Newer overrides survive: an in-flight optimistic write must keep
    /// winning the merged view until its own confirmation resolves.
    pub fn observe_snapshot(&mut self, entry: &Entry) {
        if let Some(&changed_at) = self.read_changed_at.get(&entry.id) {
            if entry.updated_at >= changed_at {
                self.read_ids.remove(&entry.id);
                self.unread_ids.remove(&entry.id);
                self.read_changed_at.remove(&entry.id);
            }
        }
        if let Some(&changed_at) = self.star_changed_at.get(&entry.id) {
            if entry.updated_at >= changed_at {
                self.starred_ids.remove(&entry.id);
                self.unstarred_ids.remove(&entry.id);
                self.star_changed_at.remove(&entry.id);
            }
        }
    }

    // ========================================================================
    // Hard reset
    // ========================================================================

    /// Discard all speculative state. Last-resort recovery for when
    /// optimistic state and server state have diverged unrecoverably.
    pub fn reset(&mut self) {
        let overrides = self.read_changed_at.len() + self.star_changed_at.len();
        tracing::warn!(
            overrides,
            pending = self.pending_entries.len(),
            "Resetting delta store, discarding speculative state"
        );
        self.read_ids.clear();
        self.unread_ids.clear();
        self.starred_ids.clear();
        self.unstarred_ids.clear();
        self.read_changed_at.clear();
        self.star_changed_at.clear();
        self.unread_deltas.clear();
        self.pending_entries.clear();
    }

    /// Whether the store holds no speculative state at all.
    pub fn is_empty(&self) -> bool {
        self.read_ids.is_empty()
            && self.unread_ids.is_empty()
            && self.starred_ids.is_empty()
            && self.unstarred_ids.is_empty()
            && self.unread_deltas.is_empty()
            && self.pending_entries.is_empty()
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.read_ids.is_disjoint(&self.unread_ids),
            "entry in both read_ids and unread_ids"
        );
        debug_assert!(
            self.starred_ids.is_disjoint(&self.unstarred_ids),
            "entry in both starred_ids and unstarred_ids"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry_snapshot(id: EntryId, updated_at: DateTime<Utc>) -> Entry {
        Entry {
            id,
            subscription_id: Some(1),
            tags: vec![10],
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

    fn stub(id: EntryId) -> EntryStub {
        EntryStub {
            id,
            subscription_id: Some(1),
            tags: vec![10],
            published_at: None,
        }
    }

    #[test]
    fn test_mark_read_sets_override_and_counts() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, Some(ScopeId::Subscription(1)), &[10], ts(1));

        assert_eq!(delta.read_override(1), Some(true));
        assert_eq!(delta.unread_delta(ScopeId::Subscription(1)), -1);
        assert_eq!(delta.unread_delta(ScopeId::Tag(10)), -1);
    }

    #[test]
    fn test_mark_read_then_unread_moves_between_sets() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, Some(ScopeId::Subscription(1)), &[], ts(1));
        delta.mark_unread(1, Some(ScopeId::Subscription(1)), &[], ts(2));

        assert_eq!(delta.read_override(1), Some(false));
        // -1 then +1 nets out
        assert_eq!(delta.unread_delta(ScopeId::Subscription(1)), 0);
    }

    #[test]
    fn test_mark_read_idempotent_counts() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, Some(ScopeId::Subscription(1)), &[], ts(1));
        delta.mark_read(1, Some(ScopeId::Subscription(1)), &[], ts(2));

        assert_eq!(delta.unread_delta(ScopeId::Subscription(1)), -1);
    }

    #[test]
    fn test_star_override_no_count_delta() {
        let mut delta = DeltaStore::new();
        delta.set_starred(5, true, ts(1));

        assert_eq!(delta.star_override(5), Some(true));
        assert_eq!(delta.unread_delta(ScopeId::Subscription(1)), 0);

        delta.set_starred(5, false, ts(2));
        assert_eq!(delta.star_override(5), Some(false));
    }

    #[test]
    fn test_observe_snapshot_subsumes_older_override() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, None, &[], ts(10));

        // Snapshot at the same logical instant subsumes the override.
        delta.observe_snapshot(&entry_snapshot(1, ts(10)));
        assert_eq!(delta.read_override(1), None);
    }

    #[test]
    fn test_observe_snapshot_keeps_newer_override() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, None, &[], ts(10));
        delta.set_starred(1, true, ts(10));

        // An entry_updated event carrying an older server state must not
        // clobber the pending optimistic override.
        delta.observe_snapshot(&entry_snapshot(1, ts(5)));
        assert_eq!(delta.read_override(1), Some(true));
        assert_eq!(delta.star_override(1), Some(true));
    }

    #[test]
    fn test_record_new_entry_adjusts_counts_once() {
        let mut delta = DeltaStore::new();
        delta.record_new_entry(stub(3));
        delta.record_new_entry(stub(3));

        assert_eq!(delta.pending_entries().len(), 1);
        assert_eq!(delta.unread_delta(ScopeId::Subscription(1)), 1);
        assert_eq!(delta.unread_delta(ScopeId::Tag(10)), 1);
    }

    #[test]
    fn test_absorb_listed_drops_stub_and_counts() {
        let mut delta = DeltaStore::new();
        delta.record_new_entry(stub(3));
        delta.record_new_entry(stub(4));

        delta.absorb_listed(&[3]);

        assert_eq!(delta.pending_entries().len(), 1);
        assert_eq!(delta.pending_entries()[0].id, 4);
        assert_eq!(delta.unread_delta(ScopeId::Subscription(1)), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut delta = DeltaStore::new();
        delta.mark_read(1, Some(ScopeId::Subscription(1)), &[10], ts(1));
        delta.set_starred(2, true, ts(1));
        delta.record_new_entry(stub(3));

        delta.reset();
        assert!(delta.is_empty());
    }

    // Property: after any operation sequence, no ID is in both sets of a
    // pair, and observe_snapshot never resurrects a cleared override.
    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            MarkRead(EntryId, i64),
            MarkUnread(EntryId, i64),
            SetStarred(EntryId, bool, i64),
            Observe(EntryId, i64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..8i64, 0..100i64).prop_map(|(id, t)| Op::MarkRead(id, t)),
                (0..8i64, 0..100i64).prop_map(|(id, t)| Op::MarkUnread(id, t)),
                (0..8i64, any::<bool>(), 0..100i64)
                    .prop_map(|(id, s, t)| Op::SetStarred(id, s, t)),
                (0..8i64, 0..100i64).prop_map(|(id, t)| Op::Observe(id, t)),
            ]
        }

        proptest! {
            #[test]
            fn mutual_exclusivity_holds(ops in proptest::collection::vec(op_strategy(), 0..64)) {
                let mut delta = DeltaStore::new();
                for op in ops {
                    match op {
                        Op::MarkRead(id, t) => delta.mark_read(id, None, &[], ts(t)),
                        Op::MarkUnread(id, t) => delta.mark_unread(id, None, &[], ts(t)),
                        Op::SetStarred(id, s, t) => delta.set_starred(id, s, ts(t)),
                        Op::Observe(id, t) => {
                            delta.observe_snapshot(&entry_snapshot(id, ts(t)))
                        }
                    }
                    for id in 0..8 {
                        let read = delta.read_override(id);
                        let star = delta.star_override(id);
                        // read_override/star_override return at most one
                        // value per pair by construction; assert the sets
                        // agree with the timestamps map.
                        if read.is_none() {
                            prop_assert!(!delta.read_ids.contains(&id));
                            prop_assert!(!delta.unread_ids.contains(&id));
                        }
                        if star.is_none() {
                            prop_assert!(!delta.starred_ids.contains(&id));
                            prop_assert!(!delta.unstarred_ids.contains(&id));
                        }
                        prop_assert!(delta.read_ids.is_disjoint(&delta.unread_ids));
                        prop_assert!(delta.starred_ids.is_disjoint(&delta.unstarred_ids));
                    }
                }
            }
        }
    }
}
