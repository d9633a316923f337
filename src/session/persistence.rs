//! Session record persistence: one self-describing JSON file per session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::session::model::Session;

/// Storage backend for session records
pub trait SessionPersistence: Send + Sync {
    /// Every readable record; unreadable ones are skipped and logged
    fn load_all(&self) -> WorkflowResult<Vec<Session>>;

    fn save(&self, session: &Session) -> WorkflowResult<()>;

    /// Removing a record that does not exist is not an error
    fn delete(&self, session_id: &str) -> WorkflowResult<()>;
}

/// Writes `<dir>/<session_id>.json`
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> WorkflowResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            WorkflowError::internal(format!(
                "failed to create session store {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

impl SessionPersistence for FilePersistence {
    fn load_all(&self) -> WorkflowResult<Vec<Session>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            WorkflowError::internal(format!("failed to read {}: {e}", self.dir.display()))
        })?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<Session>(&raw).map_err(|e| e.to_string()));
            match parsed {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable session record: {}", e),
            }
        }
        debug!(count = sessions.len(), dir = %self.dir.display(), "Loaded session records");
        Ok(sessions)
    }

    fn save(&self, session: &Session) -> WorkflowResult<()> {
        let path = self.record_path(&session.session_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(session)?;

        // Write-then-rename so readers never observe a torn record
        std::fs::write(&tmp, content)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| {
                WorkflowError::internal(format!("failed to persist {}: {e}", path.display()))
            })
    }

    fn delete(&self, session_id: &str) -> WorkflowResult<()> {
        match std::fs::remove_file(self.record_path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkflowError::internal(format!(
                "failed to delete session record {session_id}: {e}"
            ))),
        }
    }
}

/// In-memory backend; can be told to fail saves to exercise degraded paths
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<String, String>>,
    fail_saves: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Persisted copy of a record, if any
    pub fn stored(&self, session_id: &str) -> Option<Session> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load_all(&self) -> WorkflowResult<Vec<Session>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    fn save(&self, session: &Session) -> WorkflowResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(WorkflowError::internal("simulated persistence failure"));
        }
        let raw = serde_json::to_string(session)?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.session_id.clone(), raw);
        Ok(())
    }

    fn delete(&self, session_id: &str) -> WorkflowResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        Ok(())
    }
}
