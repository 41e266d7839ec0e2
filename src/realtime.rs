//! Push-event ingestion boundary.
//!
//! The persistent connection itself lives outside this crate; whatever
//! transport the host wires up (websocket, SSE, long-poll) decodes events
//! into `PushEvent` and hands them to the `Ingestor`, which folds them
//! into the session store. The ingestor also keeps the reconnect
//! bookkeeping: last-seen cursors per event kind so the server can replay
//! missed events, and a heartbeat clock for deciding when to fall back to
//! timestamp-based polling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::model::{EntryStub, EntryWire, SubscriptionId};
use crate::session::SessionEvent;
use crate::store::SessionStore;

// ============================================================================
// Wire shapes
// ============================================================================

/// Delivery scope of a push event: a single feed's channel or the
/// per-user channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Channel {
    Feed { subscription_id: SubscriptionId },
    User,
}

/// Events pushed by the server over the persistent connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A new entry landed server-side ahead of the next list fetch.
    NewEntry {
        channel: Channel,
        entry: EntryStub,
        #[serde(default)]
        cursor: Option<String>,
    },
    /// An entry's authoritative state changed (another device, a rule).
    EntryUpdated {
        channel: Channel,
        entry: EntryWire,
        #[serde(default)]
        cursor: Option<String>,
    },
    SubscriptionCreated {
        channel: Channel,
        subscription_id: SubscriptionId,
        title: String,
        #[serde(default)]
        cursor: Option<String>,
    },
    /// Progress of a server-side OPML import.
    ImportProgress {
        channel: Channel,
        completed: u32,
        total: u32,
    },
    /// Connection liveness probe; carries no state.
    Heartbeat,
}

/// Cursor families the server replays independently on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Entry,
    Subscription,
}

/// Cursors supplied on reconnect so the server can replay missed events.
/// When `entry` is absent the client falls back to polling from
/// `fallback_since`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_since: Option<DateTime<Utc>>,
}

// ============================================================================
// Ingestor
// ============================================================================

#[derive(Debug, Default)]
struct ResumeState {
    cursors: HashMap<EventKind, String>,
    last_event_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<Instant>,
}

/// Applies push events to the session store and tracks resume state.
pub struct Ingestor {
    store: Arc<SessionStore>,
    events_tx: mpsc::Sender<SessionEvent>,
    resume: Mutex<ResumeState>,
}

impl Ingestor {
    pub fn new(store: Arc<SessionStore>, events_tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            store,
            events_tx,
            resume: Mutex::new(ResumeState::default()),
        }
    }

    /// Fold one event into the store. Synchronous: every store update
    /// happens within this turn, matching the single-threaded
    /// cooperative model the reconciliation logic assumes.
    pub fn apply(&self, event: PushEvent) {
        {
            let mut resume = self.resume.lock();
            resume.last_heartbeat = Some(Instant::now());
            if !matches!(event, PushEvent::Heartbeat) {
                resume.last_event_at = Some(Utc::now());
            }
        }

        match event {
            PushEvent::NewEntry { entry, cursor, .. } => {
                self.advance_cursor(EventKind::Entry, cursor);
                tracing::debug!(entry_id = entry.id, "Real-time new entry");
                {
                    let mut state = self.store.lock();
                    state.delta.record_new_entry(entry);
                }
                self.store.notify();
            }
            PushEvent::EntryUpdated { entry, cursor, .. } => {
                self.advance_cursor(EventKind::Entry, cursor);
                let entry = entry.into_entry();
                tracing::debug!(
                    entry_id = entry.id,
                    updated_at = %entry.updated_at,
                    "Real-time entry update"
                );
                {
                    let mut state = self.store.lock();
                    // apply_winning carries the staleness guard, and the
                    // delta subsumption check keeps a pending optimistic
                    // override winning the merged view until its own
                    // mutation resolves.
                    state.apply_winning(entry.id, &entry);
                }
                self.store.notify();
            }
            PushEvent::SubscriptionCreated {
                subscription_id,
                title,
                cursor,
                ..
            } => {
                self.advance_cursor(EventKind::Subscription, cursor);
                self.emit(SessionEvent::SubscriptionCreated {
                    subscription_id,
                    title,
                });
            }
            PushEvent::ImportProgress {
                completed, total, ..
            } => {
                self.emit(SessionEvent::ImportProgress { completed, total });
            }
            PushEvent::Heartbeat => {}
        }
    }

    /// Parameters for resuming the push stream after a reconnect.
    pub fn resume_params(&self) -> ResumeParams {
        let resume = self.resume.lock();
        ResumeParams {
            entry_cursor: resume.cursors.get(&EventKind::Entry).cloned(),
            subscription_cursor: resume.cursors.get(&EventKind::Subscription).cloned(),
            fallback_since: resume.last_event_at,
        }
    }

    /// Whether the connection has gone quiet past the heartbeat budget.
    /// Hosts use this to tear down the stream and fall back to polling.
    pub fn is_stale(&self, max_silence: std::time::Duration) -> bool {
        let resume = self.resume.lock();
        match resume.last_heartbeat {
            Some(at) => at.elapsed() > max_silence,
            None => false,
        }
    }

    fn advance_cursor(&self, kind: EventKind, cursor: Option<String>) {
        if let Some(cursor) = cursor {
            self.resume.lock().cursors.insert(kind, cursor);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            tracing::warn!(error = %e, "Dropping session event (receiver full or gone)");
        }
    }
}
