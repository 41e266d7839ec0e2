//! Per-entry bookkeeping of in-flight write operations.
//!
//! Multiple user actions on the same entry (rapid toggle-read then
//! toggle-star) may be in flight concurrently. Applying whichever network
//! response arrives last would let a stale response overwrite a newer
//! optimistic state, so completions are resolved against the server's own
//! `updated_at` instead of client-side arrival order.

use std::collections::HashMap;

use crate::model::{Entry, EntryId};

/// Tracking record for one entry with outstanding writes.
///
/// Invariant: a record exists only while `pending_count > 0`; it is
/// deleted atomically with the count reaching zero.
#[derive(Debug)]
struct TrackRecord {
    pending_count: u32,
    /// Entry snapshot with the greatest `updated_at` seen so far among
    /// completed operations.
    winning_state: Option<Entry>,
    /// Flags captured before the first optimistic write. Used only if
    /// every in-flight operation ultimately fails.
    original_read: bool,
    original_starred: bool,
}

/// Outcome of recording a successful completion.
#[derive(Debug)]
pub enum SuccessOutcome {
    /// No record existed: a single, already-resolved mutation. The
    /// response snapshot is the immediate winner.
    Immediate(Entry),
    /// Other operations are still in flight; nothing to apply yet.
    Pending,
    /// This was the last outstanding operation; apply the winner.
    Complete { winning: Entry },
}

/// Outcome of recording a failed completion.
#[derive(Debug)]
pub enum FailureOutcome {
    /// Other operations are still in flight; nothing to do yet.
    Pending,
    /// This was the last outstanding operation. If any sibling write
    /// succeeded its winner applies; otherwise roll back to the originals.
    Complete {
        winning: Option<Entry>,
        original_read: bool,
        original_starred: bool,
    },
}

/// Tracks in-flight writes per entry and resolves the winning result.
#[derive(Debug, Default)]
pub struct MutationTracker {
    records: HashMap<EntryId, TrackRecord>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a write for `id`.
    ///
    /// Must be called synchronously at the moment the optimistic write is
    /// applied, before the network call is issued — the originals captured
    /// here are the rollback target if everything fails.
    pub fn start(&mut self, id: EntryId, original_read: bool, original_starred: bool) {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.pending_count += 1;
                tracing::trace!(
                    entry_id = id,
                    pending = record.pending_count,
                    "Additional mutation in flight"
                );
            }
            None => {
                self.records.insert(
                    id,
                    TrackRecord {
                        pending_count: 1,
                        winning_state: None,
                        original_read,
                        original_starred,
                    },
                );
            }
        }
    }

    /// Record a successful completion carrying the authoritative
    /// post-write snapshot.
    ///
    /// The comparison uses `>=`: a timestamp tie favors the most recently
    /// observed result, not chronological request order. The backend's
    /// write clock assigns `updated_at`, so two different writes landing
    /// on the same timestamp were concurrent server-side and either
    /// outcome is a valid serialization.
    pub fn record_success(&mut self, id: EntryId, result: Entry) -> SuccessOutcome {
        let Some(mut record) = self.records.remove(&id) else {
            return SuccessOutcome::Immediate(result);
        };

        // Keep the previous winner only when it is strictly newer.
        let winning = match record.winning_state.take() {
            Some(prev) if prev.updated_at > result.updated_at => prev,
            _ => result,
        };

        record.pending_count -= 1;
        if record.pending_count > 0 {
            record.winning_state = Some(winning);
            self.records.insert(id, record);
            return SuccessOutcome::Pending;
        }

        // Record deletion is atomic with the count reaching zero: the
        // entry was removed above and is not reinserted.
        tracing::debug!(
            entry_id = id,
            winning_updated_at = %winning.updated_at,
            "All mutations resolved"
        );
        SuccessOutcome::Complete { winning }
    }

    /// Record a failed completion.
    pub fn record_failure(&mut self, id: EntryId) -> FailureOutcome {
        let Some(mut record) = self.records.remove(&id) else {
            tracing::warn!(entry_id = id, "Failure recorded with no tracking record");
            return FailureOutcome::Pending;
        };

        record.pending_count -= 1;
        if record.pending_count > 0 {
            self.records.insert(id, record);
            return FailureOutcome::Pending;
        }

        tracing::debug!(
            entry_id = id,
            rolled_back = record.winning_state.is_none(),
            "All mutations resolved after failure"
        );
        FailureOutcome::Complete {
            winning: record.winning_state,
            original_read: record.original_read,
            original_starred: record.original_starred,
        }
    }

    /// Whether any write for `id` is still in flight.
    pub fn is_pending(&self, id: EntryId) -> bool {
        self.records.contains_key(&id)
    }

    /// Number of outstanding writes for `id`.
    pub fn pending_count(&self, id: EntryId) -> u32 {
        self.records.get(&id).map_or(0, |r| r.pending_count)
    }

    /// Number of entries with at least one write in flight.
    pub fn tracked_entries(&self) -> usize {
        self.records.len()
    }

    /// Drop every tracking record. Only used by hard recovery, where the
    /// cache is refetched and late completions become no-ops.
    pub fn reset(&mut self) {
        if !self.records.is_empty() {
            tracing::warn!(
                entries = self.records.len(),
                "Dropping mutation tracking records on reset"
            );
        }
        self.records.clear();
    }
}
