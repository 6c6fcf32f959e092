//! cmirror-cloudfilter: placeholder hydration engine
//!
//! Serves on-demand hydration for a sync root whose entries are placeholders
//! of items in a remote content store:
//! - Sync root connection (bind the root to a callback table, drain on exit)
//! - Fetch callbacks (stream the requested range from the content source)
//! - Cancel callbacks (stop a transfer at its next chunk boundary)
//! - Placeholder state (Ghost → Partial → Full, invalidated on remote change)
//!
//! ## Architecture
//!
//! ```text
//! Host placeholder subsystem (Cloud Files minifilter, or LocalDirHost)
//!       │
//!       ├── FETCH_DATA ────────┐
//!       ├── CANCEL_FETCH_DATA ─┤
//!       │                      ▼
//!       │            ConnectionHandle (live while connected)
//!       │                      │
//!       │                      ▼
//!       │            HydrationEngine ──▶ TransferRegistry (one session per placeholder)
//!       │                      │
//!       │                      ├──▶ ContentSource (remote read, retried)
//!       │                      └──▶ PlaceholderTable (extents, revision)
//!       │                      │
//!       ◀── transfer_data / report_progress / complete
//! ```

pub mod host;
pub mod hydration;
pub mod placeholder;
pub mod provider;
pub mod registry;

pub use host::{CompletionStatus, FailureReason, HostError, LocalDirHost, TransferHost};
pub use hydration::{
    EngineConfig, FetchRejected, FetchRequest, HydrationEngine, SyncCallbacks, TransferReport,
};
pub use placeholder::{PlaceholderEntry, PlaceholderTable};
pub use provider::{
    ConnectError, ConnectOptions, ConnectionHandle, ConnectionKey, ConnectionManager,
    DisconnectError, LockFileRegistrar, NotConnected, RootRegistrar, STATE_DIR,
};
pub use registry::{
    ContentLease, RegistryError, SessionHandle, TransferRegistry, TransferSession,
};
