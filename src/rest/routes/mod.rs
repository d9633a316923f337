//! Route handlers for the REST API.

pub mod health;
pub mod sessions;

#[cfg(test)]
pub(crate) fn test_state(dir: &tempfile::TempDir) -> crate::rest::state::ApiState {
    use crate::session::{MemoryPersistence, SessionStore, StoreSettings};
    use std::sync::Arc;

    let store = SessionStore::open(
        StoreSettings::with_workspace_root(dir.path().join("workspaces")),
        Arc::new(MemoryPersistence::new()),
    )
    .unwrap();
    crate::rest::state::ApiState::new(Arc::new(store), crate::config::Config::default())
}
