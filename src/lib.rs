//! riptide — client-side state reconciliation for feed readers.
//!
//! The crate is the sync core a feed-reading UI sits on top of:
//!
//! - **Optimistic mutations** apply to the caches in the same turn the
//!   user acts, before the network write is issued; concurrent
//!   completions for one entry resolve by the server's own `updated_at`
//!   (highest wins), so response reordering can never regress state.
//! - **A real-time delta overlay** merges pushed events onto the last
//!   paginated server snapshot; filtering happens after the overlay, so
//!   marking an entry read in an unread-only view removes it immediately
//!   without a refetch.
//! - **Cursor-based navigation** keeps next/previous working even when
//!   the open entry has been filtered out of the list it came from, and
//!   proactively loads pages so forward reading never blocks.
//!
//! Feed fetching, persistence, auth, and rendering live behind the typed
//! [`api::Backend`] boundary and the [`realtime::PushEvent`] contract;
//! this crate owns only the reconciliation state machine between them.

pub mod api;
pub mod config;
pub mod list;
pub mod model;
pub mod realtime;
pub mod session;
pub mod store;

pub use api::{ApiError, Backend, HttpBackend, ListPage, ListQuery, MutationResponse};
pub use config::{ClientConfig, ConfigError};
pub use list::{merge_entry, merge_list, reconcile, Adjacency, Navigator};
pub use model::{
    Entry, EntryId, EntryKind, EntryStub, ListFilter, ScopeId, SortOrder, StateChange,
    SubscriptionId, TagId,
};
pub use realtime::{Channel, Ingestor, PushEvent, ResumeParams};
pub use session::{ListState, Session, SessionEvent};
pub use store::{ListenerId, SessionStore, StoreSnapshot};
