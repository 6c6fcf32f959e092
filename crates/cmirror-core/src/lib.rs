pub mod config;
pub mod error;
pub mod types;

pub use error::{MirrorError, MirrorResult};
pub use types::{
    ByteRange, ChangeEvent, ChangeKind, HydrationState, ItemId, PlaceholderId, Revision,
    TransferKey,
};
