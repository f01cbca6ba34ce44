//! Propagation relay manager.
//!
//! Selects, tracks and syncs with a store-and-forward relay ("propagation
//! node") for a delay-tolerant mesh messenger. Reconciles persisted
//! settings, the live announce stream and the contact book into one
//! current relay, and pushes that choice down to the network transport.
//!
//! Collaborators are consumed through the traits in [`ports`]; in-memory
//! versions live in [`memory`], a SQLite settings store in [`settings_db`].

pub mod candidate;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod ports;
pub mod projector;
mod propagator;
pub mod selection;
pub mod settings_db;
pub mod sync;
pub mod types;

pub use candidate::{compare_hops, rank, select_best, RelayCandidate};
pub use config::RelayManagerConfig;
pub use error::RelayError;
pub use manager::{Collaborators, RelayManager};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use ports::{
    AnnounceRepository, ContactRecord, ContactStatus, ContactStore, NetworkStatus,
    NetworkTransport, PendingOutcome, SettingsStore, SyncPhase, SyncState, DEFAULT_SYNC_INTERVAL,
};
pub use projector::{resolve_relay_info, AvailableRelaysState, RelayInfo, RelayState};
pub use selection::{evaluate_candidate, SelectionMode, SelectionOutcome, SwitchDecision};
pub use settings_db::SqliteSettingsStore;
pub use sync::{SyncResult, SyncStatus};
pub use types::{now_ms, NodeId, NODE_ID_LEN};
