//! cmirror-sync: local change watcher and the bridge that propagates local
//! changes to the content source

pub mod bridge;
pub mod watcher;

pub use bridge::{
    BridgeConfig, BridgeStats, ChangeBridge, Outcome, Propagated, PropagatedFn, SkipReason,
};
pub use watcher::{watch_root, Debouncer, PathFilter, WatchOptions, WatcherError};
