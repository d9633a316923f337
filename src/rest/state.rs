//! API state management for the REST server.

use std::sync::Arc;

use crate::config::Config;
use crate::session::SessionStore;

/// Shared state for the REST API
#[derive(Clone)]
pub struct ApiState {
    /// Session store (internally synchronized)
    pub store: Arc<SessionStore>,
    pub config: Arc<Config>,
}

impl ApiState {
    pub fn new(store: Arc<SessionStore>, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}
