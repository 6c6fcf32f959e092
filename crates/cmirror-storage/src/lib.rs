//! cmirror-storage: content source adapter over OpenDAL
//!
//! Every call goes to the remote store; nothing is cached here. Retry policy
//! lives with the caller (see [`retry`]), so transient failures surface as
//! [`FetchError::Unavailable`] instead of being absorbed by a transport layer.

pub mod health;
pub mod operator;
pub mod retry;
pub mod source;

pub use health::check_health;
pub use operator::{build_from_core_config, build_operator, StorageConfig};
pub use retry::{with_retry, RetryPolicy};
pub use source::{ContentSource, FetchError, ItemStat, OpendalSource};
