//! Session-lifetime shared state: delta overlay, mutation tracking, and
//! the entity/list caches, behind one injectable store object.
//!
//! The store is created at session start, passed by reference to every
//! component that needs it, reset on hard error, and dropped on logout.
//! Components never reach into ambient globals. All mutation goes through
//! the operations defined here and in the sub-modules; critical sections
//! are synchronous and never held across an await point.

mod cache;
mod delta;
mod tracker;

pub use cache::{EntryCache, ListStore, PagedList};
pub use delta::DeltaStore;
pub use tracker::{FailureOutcome, MutationTracker, SuccessOutcome};

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::list::merge_entry;
use crate::model::{Entry, EntryId, EntryStub, ScopeId, StateChange};

/// Handle returned by `SessionStore::subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Store state
// ============================================================================

/// The mutable interior of the session store. Only reachable through
/// `SessionStore::lock`, so every mutation path is a defined operation.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub delta: DeltaStore,
    pub tracker: MutationTracker,
    pub entries: EntryCache,
    pub lists: ListStore,
    /// Last authoritative unread counts per scope, as returned by
    /// mutation responses. The delta store's adjustments apply on top.
    unread_base: HashMap<ScopeId, i64>,
}

impl StoreState {
    /// Current merged flags for an entry: the cached snapshot with delta
    /// overrides applied. This is the pre-optimistic state a new mutation
    /// captures as its rollback target.
    pub fn merged_flags(&self, id: EntryId) -> Option<(bool, bool)> {
        let entry = self.cached_entry(id)?;
        let read = self.delta.read_override(id).unwrap_or(entry.read);
        let starred = self.delta.star_override(id).unwrap_or(entry.starred);
        Some((read, starred))
    }

    /// Cached snapshot for an entry without delta application: the entity
    /// cache first, then any list membership.
    pub fn cached_entry(&self, id: EntryId) -> Option<&Entry> {
        if let Some(entry) = self.entries.peek(id) {
            return Some(entry);
        }
        self.lists.find_entry(id)
    }

    /// Merged single-entry view (4.3 merge contract applied).
    pub fn merged_entry(&self, id: EntryId) -> Option<Entry> {
        self.cached_entry(id)
            .map(|entry| merge_entry(entry, &self.delta))
    }

    /// Greatest `updated_at` currently cached for an entry.
    fn cached_updated_at(&self, id: EntryId) -> Option<DateTime<Utc>> {
        let from_entry = self.entries.peek(id).map(|e| e.updated_at);
        let from_lists = self.lists.newest_updated_at(id);
        from_entry.max(from_lists)
    }

    /// Apply a tentative state change to both the single-entity view and
    /// every member-of-list view, producing new immutable snapshots, and
    /// record the matching overrides in the delta store.
    ///
    /// Runs synchronously in the dispatching turn, before the network
    /// write is issued.
    pub fn apply_optimistic(&mut self, id: EntryId, change: StateChange, changed_at: DateTime<Utc>) {
        let (scope, tags) = self
            .cached_entry(id)
            .map(|e| (e.subscription_id.map(ScopeId::Subscription), e.tags.clone()))
            .unwrap_or((None, Vec::new()));

        self.entries.rewrite(id, |e| e.with_change(&change));
        self.lists.rewrite_entry(id, |e| e.with_change(&change));

        if let Some(read) = change.read {
            if read {
                self.delta.mark_read(id, scope, &tags, changed_at);
            } else {
                self.delta.mark_unread(id, scope, &tags, changed_at);
            }
        }
        if let Some(starred) = change.starred {
            self.delta.set_starred(id, starred, changed_at);
        }
        // Score changes ride the cache rewrite only: scores have no list
        // filter semantics and no unread accounting.
    }

    /// Apply a resolved winning state to both cached views.
    ///
    /// Staleness guard: if the cache already holds a newer `updated_at`
    /// for this entry, the write is skipped — a later, already-applied
    /// update must not be regressed by a slower-arriving confirmation.
    pub fn apply_winning(&mut self, id: EntryId, winning: &Entry) {
        if let Some(cached) = self.cached_updated_at(id) {
            if cached > winning.updated_at {
                tracing::debug!(
                    entry_id = id,
                    cached = %cached,
                    incoming = %winning.updated_at,
                    "Skipping stale winning state"
                );
                // The snapshot still subsumes any delta it is newer than.
                self.delta.observe_snapshot(winning);
                return;
            }
        }

        self.entries.rewrite(id, |_| winning.clone());
        self.lists.rewrite_entry(id, |_| winning.clone());
        self.delta.observe_snapshot(winning);
    }

    /// Restore the pre-optimistic originals after every in-flight write
    /// for the entry failed: rewrite both views and withdraw the entry's
    /// overrides (including their unread-count adjustments).
    pub fn rollback(&mut self, id: EntryId, original_read: bool, original_starred: bool) {
        let (scope, tags) = self
            .cached_entry(id)
            .map(|e| (e.subscription_id.map(ScopeId::Subscription), e.tags.clone()))
            .unwrap_or((None, Vec::new()));

        let change = StateChange {
            read: Some(original_read),
            starred: Some(original_starred),
            score: None,
        };
        self.entries.rewrite(id, |e| e.with_change(&change));
        self.lists.rewrite_entry(id, |e| e.with_change(&change));
        self.delta.rollback_entry(id, scope, &tags);
    }

    /// Record authoritative unread counts returned by a mutation
    /// response. Fresh counts subsume the delta adjustments for those
    /// scopes.
    pub fn set_unread_base(&mut self, counts: &[(ScopeId, i64)]) {
        for &(scope, count) in counts {
            self.unread_base.insert(scope, count);
        }
        let scopes: Vec<ScopeId> = counts.iter().map(|&(s, _)| s).collect();
        self.delta.clear_unread_deltas(&scopes);
    }

    /// Effective unread count for a scope: last authoritative base plus
    /// the delta adjustment. `None` when nothing is known for the scope.
    pub fn unread_count(&self, scope: ScopeId) -> Option<i64> {
        let base = self.unread_base.get(&scope).copied();
        let delta = self.delta.unread_delta(scope);
        match (base, delta) {
            (None, 0) => None,
            (base, delta) => Some((base.unwrap_or(0) + delta).max(0)),
        }
    }

    /// Force the effective unread count for a scope to zero by setting
    /// the delta to the negated base. Used by bulk mark-read, which
    /// cannot enumerate the unloaded entries it affects.
    pub fn zero_unread(&mut self, scope: ScopeId) {
        let base = self.unread_base.get(&scope).copied().unwrap_or(0);
        self.delta.set_unread_delta(scope, -base);
    }

    /// Zero every scope the store knows about (bulk mark-read with no
    /// scope filter).
    pub fn zero_unread_all(&mut self) {
        let mut scopes: Vec<ScopeId> = self.unread_base.keys().copied().collect();
        scopes.extend(self.delta.adjusted_scopes());
        scopes.sort_unstable_by_key(|s| match s {
            ScopeId::Subscription(id) => (0, *id),
            ScopeId::Tag(id) => (1, *id),
        });
        scopes.dedup();
        for scope in scopes {
            self.zero_unread(scope);
        }
    }
}

// ============================================================================
// Session store
// ============================================================================

/// Counts exposed to the UI in one consistent read.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Monotonic change counter; two equal versions imply equal state.
    pub version: u64,
    /// Entries announced in real time, awaiting the next list fetch.
    pub pending_entries: Vec<EntryStub>,
    /// Number of entries with writes still in flight.
    pub pending_mutations: usize,
}

/// The process-wide (session-lifetime) reconciliation store.
///
/// Cheap to share: clone the `Arc` it is handed around in. Listeners are
/// invoked after every state-changing operation, outside the state lock.
pub struct SessionStore {
    state: Mutex<StoreState>,
    version: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            version: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Store with a specific single-entry cache capacity.
    pub fn with_entry_capacity(capacity: usize) -> Self {
        let store = Self::new();
        store.state.lock().entries = EntryCache::with_capacity(capacity);
        store
    }

    /// Lock the store state for one synchronous turn of operations.
    ///
    /// Callers must not hold the guard across an await point; pair with
    /// `notify()` after dropping the guard when state changed.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Register a change listener. The listener runs after each
    /// state-changing operation and must not block; use it to schedule a
    /// re-render, not to perform one.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        ListenerId(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.lock().remove(&id.0);
    }

    /// Monotonic change counter. Cheaper than `snapshot()` when only an
    /// invalidation check is needed.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Consistent read of the store's UI-facing summary state.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            version: self.version(),
            pending_entries: state.delta.pending_entries().to_vec(),
            pending_mutations: state.tracker.tracked_entries(),
        }
    }

    /// Bump the version and invoke listeners. Called by the owning
    /// session after any state-changing operation.
    pub(crate) fn notify(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    // ========================================================================
    // Read accessors
    // ========================================================================

    /// Merged single-entry view, if the entry is cached anywhere.
    pub fn merged_entry(&self, id: EntryId) -> Option<Entry> {
        self.state.lock().merged_entry(id)
    }

    /// Whether a write for the entry is still in flight.
    pub fn is_mutation_pending(&self, id: EntryId) -> bool {
        self.state.lock().tracker.is_pending(id)
    }

    /// Effective unread count for a scope.
    pub fn unread_count(&self, scope: ScopeId) -> Option<i64> {
        self.state.lock().unread_count(scope)
    }

    // ========================================================================
    // Hard recovery
    // ========================================================================

    /// Discard all speculative state and cached pages. Last-resort
    /// recovery when optimistic and server state have diverged beyond
    /// incremental repair; the session refetches afterwards.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.delta.reset();
            state.tracker.reset();
            state.entries.clear();
            state.lists.invalidate_all();
            state.unread_base.clear();
        }
        self.notify();
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}
