pub mod capabilities;
pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use capabilities::{
    ChangeNotifier, IdentityProvider, InsertCallback, KeyValueStore, MessageStore, StaticIdentity,
    SubscriptionHandle,
};
pub use config::{BackendKind, Config};
pub use context::SyncContext;
pub use error::{SyncError, SyncResult};
pub use types::{Identity, Message, UnreadCounts, TEMP_ID_PREFIX};
