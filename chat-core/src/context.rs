use std::sync::Arc;

use crate::capabilities::{ChangeNotifier, MessageStore};
use crate::config::Config;

/// Shared backend handles. Cheap to clone; every session engine draws its
/// store and notifier from here.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn MessageStore>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl SyncContext {
    pub fn new(config: Config, store: Arc<dyn MessageStore>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        SyncContext {
            config: Arc::new(config),
            store,
            notifier,
        }
    }
}
