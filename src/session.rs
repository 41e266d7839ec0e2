//! UI-facing facade: list reads, navigation, and optimistic mutations.
//!
//! A `Session` is a cheap-to-clone handle over the shared store, the
//! backend boundary, and the navigator. Mutations apply optimistically in
//! the dispatching turn, before the network write is issued; completions
//! resolve through the mutation tracker so out-of-order responses can
//! never regress newer state. Discrete user-visible notices (a failed
//! write, a store reset) arrive on the `SessionEvent` channel; continuous
//! re-render invalidation goes through `SessionStore::subscribe`.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::{
    ApiError, Backend, ListQuery, MarkAllReadRequest, MarkReadEntry, MarkReadRequest,
    MutationResponse, SetScoreRequest, SetStarredRequest,
};
use crate::config::ClientConfig;
use crate::list::{reconcile, Navigator};
use crate::model::{Entry, EntryId, ListFilter, ScopeId, StateChange};
use crate::store::{FailureOutcome, SessionStore, SuccessOutcome};

/// Capacity of the session event channel. Events are transient notices;
/// a slow consumer loses the oldest ones rather than blocking mutations.
const EVENT_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Events
// ============================================================================

/// Discrete notifications for the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Every in-flight write for the entry failed; the optimistic state
    /// was reverted. One event per entry, not per failed request.
    MutationFailed { entry_id: EntryId, error: String },
    /// A bulk mark-read failed and triggered hard recovery.
    BulkMarkReadFailed { error: String },
    /// A list fetch failed; the error is also available inline via
    /// `list_state()`, scoped to that list only.
    ListFetchFailed { filter: ListFilter, error: String },
    /// All speculative state was discarded and caches invalidated.
    StoreReset,
    /// A subscription appeared server-side (another device, an import).
    SubscriptionCreated {
        subscription_id: i64,
        title: String,
    },
    /// Server-side OPML import progress.
    ImportProgress { completed: u32, total: u32 },
}

/// Loading/error state of the currently open list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListState {
    pub loaded: bool,
    pub fetching: bool,
    pub has_more: bool,
    pub error: Option<String>,
}

enum FetchMode {
    /// First page, skipped when the sequence is already loaded.
    Initial,
    /// Next page after the stored cursor.
    More,
    /// Discard and reload; supersedes any fetch in flight.
    Refetch,
}

// ============================================================================
// Session
// ============================================================================

/// Handle to one user session's reconciliation engine.
#[derive(Clone)]
pub struct Session {
    store: Arc<SessionStore>,
    backend: Arc<dyn Backend>,
    nav: Arc<Mutex<Navigator>>,
    events_tx: mpsc::Sender<SessionEvent>,
    page_limit: u32,
}

impl Session {
    /// Create a session with its own store.
    pub fn new(
        backend: Arc<dyn Backend>,
        config: &ClientConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let store = Arc::new(SessionStore::with_entry_capacity(
            config.entry_cache_capacity,
        ));
        Self::with_store(store, backend, config)
    }

    /// Create a session over an externally constructed store. The store
    /// is injectable so hosts control its lifecycle (created at login,
    /// dropped at logout) and tests can observe it directly.
    pub fn with_store(
        store: Arc<SessionStore>,
        backend: Arc<dyn Backend>,
        config: &ClientConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = Self {
            store,
            backend,
            nav: Arc::new(Mutex::new(Navigator::new(
                ListFilter::default(),
                config.prefetch_threshold,
            ))),
            events_tx,
            page_limit: config.page_limit,
        };
        (session, events_rx)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Sender half of the event channel, for wiring collaborators (the
    /// real-time ingestor) onto the same stream of notices.
    pub fn event_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Whether a write for the entry is still in flight (pending
    /// indicator for mutation buttons).
    pub fn is_mutation_pending(&self, id: EntryId) -> bool {
        self.store.is_mutation_pending(id)
    }

    /// Effective unread count for a scope.
    pub fn unread_count(&self, scope: ScopeId) -> Option<i64> {
        self.store.unread_count(scope)
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            tracing::warn!(error = %e, "Dropping session event (receiver full or gone)");
        }
    }

    // ========================================================================
    // List-read API
    // ========================================================================

    /// Switch to a filter and ensure its first page is loaded. Returns
    /// the reconciled sequence.
    pub async fn open_list(&self, filter: ListFilter) -> Result<Vec<Entry>, ApiError> {
        self.nav.lock().set_filter(filter.clone());
        self.fetch_page(filter, FetchMode::Initial).await?;
        Ok(self.visible_entries())
    }

    /// Request the next page of the open list. No-op when a fetch is in
    /// flight or the sequence is exhausted.
    pub async fn fetch_more(&self) -> Result<(), ApiError> {
        let filter = self.current_filter();
        self.fetch_page(filter, FetchMode::More).await
    }

    /// Discard and reload the open list. Supersedes in-flight fetches:
    /// last fetch wins for reads, never for writes.
    pub async fn refetch(&self) -> Result<(), ApiError> {
        let filter = self.current_filter();
        self.fetch_page(filter, FetchMode::Refetch).await
    }

    /// The reconciled sequence for the open filter: server pages merged
    /// with the delta overlay, then re-filtered.
    pub fn visible_entries(&self) -> Vec<Entry> {
        let filter = self.current_filter();
        let state = self.store.lock();
        match state.lists.get(&filter) {
            Some(list) => reconcile(list.pages(), &state.delta, &filter),
            None => Vec::new(),
        }
    }

    /// Loading/error state of the open list.
    pub fn list_state(&self) -> ListState {
        let filter = self.current_filter();
        let state = self.store.lock();
        match state.lists.get(&filter) {
            Some(list) => ListState {
                loaded: list.is_loaded(),
                fetching: list.is_fetching(),
                has_more: list.has_more(),
                error: list.error().map(str::to_string),
            },
            None => ListState::default(),
        }
    }

    fn current_filter(&self) -> ListFilter {
        self.nav.lock().filter().clone()
    }

    async fn fetch_page(&self, filter: ListFilter, mode: FetchMode) -> Result<(), ApiError> {
        let (generation, cursor) = {
            let mut state = self.store.lock();
            let list = state.lists.ensure_mut(&filter);
            match mode {
                FetchMode::Initial => {
                    if list.is_loaded() || list.is_fetching() {
                        return Ok(());
                    }
                    (list.begin_fetch(), None)
                }
                FetchMode::More => {
                    if list.is_fetching() || !list.has_more() {
                        return Ok(());
                    }
                    let cursor = list.next_cursor().map(str::to_string);
                    (list.begin_fetch(), cursor)
                }
                FetchMode::Refetch => (list.begin_refetch(), None),
            }
        };
        self.store.notify();

        let query = ListQuery::from_filter(&filter).with_page(cursor, self.page_limit);
        tracing::debug!(?filter, generation, "Fetching list page");

        match self.backend.list_entries(query).await {
            Ok(page) => {
                {
                    let mut state = self.store.lock();
                    let ids: Vec<EntryId> = page.items.iter().map(|e| e.id).collect();
                    let applied = state.lists.ensure_mut(&filter).complete_fetch(
                        generation,
                        page.items.clone(),
                        page.next_cursor,
                    );
                    if applied {
                        // The page is an authoritative snapshot: it
                        // subsumes equal-or-older deltas, refreshes other
                        // cached views, and absorbs announced entries.
                        for entry in &page.items {
                            state.apply_winning(entry.id, entry);
                        }
                        state.delta.absorb_listed(&ids);
                    }
                }
                self.store.notify();
                self.sync_navigation();
                Ok(())
            }
            Err(error) => {
                let applied = {
                    let mut state = self.store.lock();
                    state
                        .lists
                        .ensure_mut(&filter)
                        .fail_fetch(generation, error.to_string())
                };
                self.store.notify();
                if applied {
                    self.emit(SessionEvent::ListFetchFailed {
                        filter,
                        error: error.to_string(),
                    });
                }
                Err(error)
            }
        }
    }

    // ========================================================================
    // Navigation API
    // ========================================================================

    /// Open an entry: records it as the navigation anchor, refreshes
    /// adjacency, proactively loads the next page when the open position
    /// nears the loaded boundary, and returns the merged entry with
    /// content (cache-first, fetching from the backend if needed).
    pub async fn open_entry(&self, id: EntryId) -> Result<Entry, ApiError> {
        self.nav.lock().open(id);
        self.sync_navigation();
        self.maybe_prefetch();

        if let Some(entry) = self.store.merged_entry(id) {
            if entry.content_html.is_some() {
                return Ok(entry);
            }
        }

        let fetched = self.backend.entry(id).await?;
        {
            let mut state = self.store.lock();
            state.entries.insert(fetched.clone());
            state.apply_winning(id, &fetched);
        }
        self.store.notify();
        Ok(self.store.merged_entry(id).unwrap_or(fetched))
    }

    pub fn close_entry(&self) {
        self.nav.lock().close();
    }

    pub fn open_entry_id(&self) -> Option<EntryId> {
        self.nav.lock().open_id()
    }

    /// Identity of the entry after the open one, or `None` at a genuine
    /// end of the fully loaded sequence. Pure: performs no I/O.
    pub fn next_entry_id(&self) -> Option<EntryId> {
        let entities = self.visible_entries();
        self.nav.lock().next_entry_id(&entities)
    }

    /// Identity of the entry before the open one.
    pub fn previous_entry_id(&self) -> Option<EntryId> {
        let entities = self.visible_entries();
        self.nav.lock().previous_entry_id(&entities)
    }

    fn sync_navigation(&self) {
        let entities = self.visible_entries();
        self.nav.lock().observe_list(&entities);
    }

    /// Request the next page in the background when the open position is
    /// within the prefetch threshold of the loaded boundary, so forward
    /// reading never blocks on a round trip.
    fn maybe_prefetch(&self) {
        let entities = self.visible_entries();
        let filter = self.current_filter();
        let (has_more, fetching) = {
            let state = self.store.lock();
            state
                .lists
                .get(&filter)
                .map(|l| (l.has_more(), l.is_fetching()))
                .unwrap_or((false, false))
        };
        let should = self
            .nav
            .lock()
            .should_prefetch(&entities, has_more, fetching);
        if should {
            tracing::debug!(?filter, "Proactively fetching next page");
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.fetch_more().await {
                    tracing::debug!(error = %e, "Proactive page fetch failed");
                }
            });
        }
    }

    // ========================================================================
    // Mutation API
    // ========================================================================

    /// Mark an entry read.
    pub async fn mark_read(&self, id: EntryId) -> Result<(), ApiError> {
        self.write_read_flag(id, true, None).await
    }

    /// Mark an entry unread.
    pub async fn mark_unread(&self, id: EntryId) -> Result<(), ApiError> {
        self.write_read_flag(id, false, None).await
    }

    /// Flip the merged read state. Returns the new value.
    pub async fn toggle_read(&self, id: EntryId) -> Result<bool, ApiError> {
        let current = self
            .store
            .merged_entry(id)
            .map(|e| e.read)
            .unwrap_or(false);
        self.write_read_flag(id, !current, Some(true)).await?;
        Ok(!current)
    }

    /// Star an entry.
    pub async fn star(&self, id: EntryId) -> Result<(), ApiError> {
        self.write_star_flag(id, true).await
    }

    /// Unstar an entry.
    pub async fn unstar(&self, id: EntryId) -> Result<(), ApiError> {
        self.write_star_flag(id, false).await
    }

    /// Flip the merged starred state. Returns the new value.
    pub async fn toggle_star(&self, id: EntryId) -> Result<bool, ApiError> {
        let current = self
            .store
            .merged_entry(id)
            .map(|e| e.starred)
            .unwrap_or(false);
        self.write_star_flag(id, !current).await?;
        Ok(!current)
    }

    /// Set the explicit user rating for an entry.
    pub async fn set_score(&self, id: EntryId, score: i32) -> Result<(), ApiError> {
        let changed_at = Utc::now();
        self.begin_entry_mutation(id, StateChange::score(score), changed_at);
        let result = self
            .backend
            .set_score(SetScoreRequest {
                id,
                score,
                changed_at,
            })
            .await;
        self.resolve_entry_mutation(id, result)
    }

    async fn write_read_flag(
        &self,
        id: EntryId,
        read: bool,
        from_list: Option<bool>,
    ) -> Result<(), ApiError> {
        let changed_at = Utc::now();
        self.begin_entry_mutation(id, StateChange::read(read), changed_at);
        let result = self
            .backend
            .mark_read(MarkReadRequest {
                entries: vec![MarkReadEntry { id, changed_at }],
                read,
                from_list,
            })
            .await;
        self.resolve_entry_mutation(id, result)
    }

    async fn write_star_flag(&self, id: EntryId, starred: bool) -> Result<(), ApiError> {
        let changed_at = Utc::now();
        self.begin_entry_mutation(id, StateChange::starred(starred), changed_at);
        let result = self
            .backend
            .set_starred(SetStarredRequest {
                id,
                starred,
                changed_at,
            })
            .await;
        self.resolve_entry_mutation(id, result)
    }

    /// Synchronous half of every entry mutation: capture originals,
    /// start tracking, apply the optimistic change, wake observers. Runs
    /// in the dispatching turn, before the network write is issued.
    fn begin_entry_mutation(
        &self,
        id: EntryId,
        change: StateChange,
        changed_at: chrono::DateTime<Utc>,
    ) {
        {
            let mut state = self.store.lock();
            let (original_read, original_starred) = state.merged_flags(id).unwrap_or((false, false));
            state.tracker.start(id, original_read, original_starred);
            state.apply_optimistic(id, change, changed_at);
        }
        self.store.notify();
        self.sync_navigation();
    }

    /// Resolve a completed mutation through the tracker and apply the
    /// outcome: the winning snapshot, a rollback, or nothing while
    /// siblings are still in flight.
    fn resolve_entry_mutation(
        &self,
        id: EntryId,
        result: Result<MutationResponse, ApiError>,
    ) -> Result<(), ApiError> {
        match result {
            Ok(response) => {
                let MutationResponse {
                    entries,
                    unread_counts,
                } = response;
                let winning = entries.into_iter().find(|e| e.id == id);
                {
                    let mut state = self.store.lock();
                    match winning {
                        Some(entry) => match state.tracker.record_success(id, entry) {
                            SuccessOutcome::Immediate(winning) => {
                                state.apply_winning(id, &winning)
                            }
                            SuccessOutcome::Complete { winning } => {
                                state.apply_winning(id, &winning)
                            }
                            SuccessOutcome::Pending => {}
                        },
                        None => {
                            // Server accepted the write but returned no
                            // entry state; resolve like a failure so the
                            // tracker record cannot leak.
                            tracing::warn!(entry_id = id, "Mutation response missing entry state");
                            Self::resolve_failure(&mut state, id);
                        }
                    }
                    state.set_unread_base(&unread_counts);
                }
                self.store.notify();
                self.sync_navigation();
                Ok(())
            }
            Err(error) => {
                let rolled_back = {
                    let mut state = self.store.lock();
                    Self::resolve_failure(&mut state, id)
                };
                self.store.notify();
                self.sync_navigation();
                if rolled_back {
                    // One notification per entry, raised only by the
                    // completion that resolved the record (scenario: N
                    // concurrent failures, one notice).
                    self.emit(SessionEvent::MutationFailed {
                        entry_id: id,
                        error: error.to_string(),
                    });
                }
                Err(error)
            }
        }
    }

    /// Returns true when the entry was fully rolled back (no sibling
    /// write succeeded).
    fn resolve_failure(state: &mut crate::store::StoreState, id: EntryId) -> bool {
        match state.tracker.record_failure(id) {
            FailureOutcome::Pending => false,
            FailureOutcome::Complete {
                winning: Some(winning),
                ..
            } => {
                state.apply_winning(id, &winning);
                false
            }
            FailureOutcome::Complete {
                winning: None,
                original_read,
                original_starred,
            } => {
                state.rollback(id, original_read, original_starred);
                true
            }
        }
    }

    /// Mark everything matching the open filter read: optimistically
    /// flips every visible unread entry and zeroes the affected scope
    /// counts, then issues the bulk write.
    ///
    /// A failed bulk write has no per-entry originals to roll back to,
    /// so it escalates to hard recovery instead of incremental repair.
    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        let filter = self.current_filter();
        let changed_at = Utc::now();
        {
            let mut state = self.store.lock();
            let unread_ids: Vec<EntryId> = match state.lists.get(&filter) {
                Some(list) => reconcile(list.pages(), &state.delta, &filter)
                    .into_iter()
                    .filter(|e| !e.read)
                    .map(|e| e.id)
                    .collect(),
                None => Vec::new(),
            };
            for id in unread_ids {
                state.apply_optimistic(id, StateChange::read(true), changed_at);
            }
            match (filter.subscription_id, filter.tag_id) {
                (Some(sub), _) => state.zero_unread(ScopeId::Subscription(sub)),
                (None, Some(tag)) => state.zero_unread(ScopeId::Tag(tag)),
                (None, None) => state.zero_unread_all(),
            }
        }
        self.store.notify();
        self.sync_navigation();

        let request = MarkAllReadRequest {
            filters: ListQuery::from_filter(&filter),
            changed_at,
        };
        match self.backend.mark_all_read(request).await {
            Ok(response) => {
                {
                    let mut state = self.store.lock();
                    state.set_unread_base(&response.unread_counts);
                    for entry in &response.entries {
                        state.apply_winning(entry.id, entry);
                    }
                }
                self.store.notify();
                self.sync_navigation();
                Ok(())
            }
            Err(error) => {
                self.emit(SessionEvent::BulkMarkReadFailed {
                    error: error.to_string(),
                });
                self.recover().await;
                Err(error)
            }
        }
    }

    // ========================================================================
    // Hard recovery
    // ========================================================================

    /// Brute-force resynchronization: discard all speculative state,
    /// invalidate caches, refetch the open list. The only path where
    /// correctness is restored by refetch rather than incremental repair.
    pub async fn recover(&self) {
        tracing::warn!("Hard recovery: resetting speculative state and refetching");
        self.store.reset();
        self.emit(SessionEvent::StoreReset);
        if let Err(e) = self.refetch().await {
            tracing::warn!(error = %e, "Refetch after recovery failed");
        }
    }

    // ========================================================================
    // Detached mutations
    // ========================================================================

    // Mutations must run to completion and resolve through the tracker
    // even if the originating view is no longer visible. The spawn_
    // helpers detach the write from the caller's lifetime; errors are
    // already reported through the event channel.

    pub fn spawn_mark_read(&self, id: EntryId) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.mark_read(id).await {
                tracing::debug!(entry_id = id, error = %e, "Detached mark_read failed");
            }
        })
    }

    pub fn spawn_toggle_read(&self, id: EntryId) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.toggle_read(id).await {
                tracing::debug!(entry_id = id, error = %e, "Detached toggle_read failed");
            }
        })
    }

    pub fn spawn_toggle_star(&self, id: EntryId) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.toggle_star(id).await {
                tracing::debug!(entry_id = id, error = %e, "Detached toggle_star failed");
            }
        })
    }

    pub fn spawn_set_score(&self, id: EntryId, score: i32) -> tokio::task::JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.set_score(id, score).await {
                tracing::debug!(entry_id = id, error = %e, "Detached set_score failed");
            }
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("page_limit", &self.page_limit)
            .finish_non_exhaustive()
    }
}
