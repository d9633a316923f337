//! Concurrent, persistent session store.
//!
//! Sessions live behind a two-level lock: a map-wide `RwLock` for membership
//! and a per-session `Mutex` that serializes writers to the same session.
//! Lock order is always map, then session. Nothing takes the map lock while
//! holding a session lock.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{WorkflowError, WorkflowResult};
use crate::session::model::{
    JobInfo, JobStatus, Session, SessionFilter, SessionStatus, SessionSummary, StoreStats,
};
use crate::session::persistence::SessionPersistence;
use crate::session::validation::{
    normalize_label, validate_k8s_label_key, validate_k8s_label_value, validate_session_id,
    SessionValidator,
};
use crate::workflow::state::{StageExecution, TokenUsage, WorkflowState};

/// Limits and locations the store enforces
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Session workspaces are created as `<workspace_root>/<session_id>`
    pub workspace_root: PathBuf,
    pub ttl: chrono::Duration,
    pub max_sessions: usize,
    pub max_disk_per_session: u64,
    pub total_disk_limit: u64,
    /// Completed/failed sessions are kept this long after their last update
    pub retention: chrono::Duration,
    /// Deleted sessions are kept this long after their last update
    pub deleted_grace: chrono::Duration,
}

impl StoreSettings {
    pub fn from_config(config: &Config) -> Self {
        let secs = |s: u64| chrono::Duration::seconds(s as i64);
        Self {
            workspace_root: config.workspaces_path(),
            ttl: secs(config.sessions.ttl_secs),
            max_sessions: config.sessions.max_sessions,
            max_disk_per_session: config.sessions.max_disk_per_session,
            total_disk_limit: config.sessions.total_disk_limit,
            retention: secs(config.sessions.retention_secs),
            deleted_grace: secs(config.sessions.deleted_grace_secs),
        }
    }

    /// Defaults rooted at a given workspace directory
    pub fn with_workspace_root(workspace_root: impl Into<PathBuf>) -> Self {
        let mut settings = Self::from_config(&Config::default());
        settings.workspace_root = workspace_root.into();
        settings
    }
}

struct Entry {
    session: Session,
    /// In-memory state is ahead of the persisted record
    dirty: bool,
    /// Set once the session has been removed from the map
    removed: bool,
}

type Slot = Arc<Mutex<Entry>>;

/// What an update does when the record cannot be written while already dirty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistFailure {
    Reject,
    KeepDirty,
}

fn lock(slot: &Slot) -> MutexGuard<'_, Entry> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Slot>>,
    persistence: Arc<dyn SessionPersistence>,
    validator: SessionValidator,
    settings: StoreSettings,
    /// Sum of `disk_usage` across sessions
    total_disk: AtomicU64,
    /// Sessions created by this process
    created: AtomicU64,
}

impl SessionStore {
    /// Open the store, loading persisted sessions that are still worth keeping
    #[instrument(skip_all, fields(workspace_root = %settings.workspace_root.display()))]
    pub fn open(
        settings: StoreSettings,
        persistence: Arc<dyn SessionPersistence>,
    ) -> WorkflowResult<Self> {
        std::fs::create_dir_all(&settings.workspace_root).map_err(|e| {
            WorkflowError::internal(format!(
                "failed to create workspace root {}: {e}",
                settings.workspace_root.display()
            ))
        })?;

        let now = Utc::now();
        let mut map = HashMap::new();
        let mut total_disk = 0;
        let mut skipped = 0;

        for session in persistence.load_all()? {
            if validate_session_id(&session.session_id).is_err()
                || session.should_auto_cleanup(now, settings.retention, settings.deleted_grace)
            {
                skipped += 1;
                if let Err(e) = persistence.delete(&session.session_id) {
                    warn!(session_id = %session.session_id, "Failed to drop stale session record: {}", e);
                }
                continue;
            }
            total_disk += session.disk_usage;
            map.insert(
                session.session_id.clone(),
                Arc::new(Mutex::new(Entry {
                    session,
                    dirty: false,
                    removed: false,
                })),
            );
        }

        info!(loaded = map.len(), skipped, "Session store opened");

        Ok(Self {
            sessions: RwLock::new(map),
            persistence,
            validator: SessionValidator::new(settings.max_disk_per_session),
            settings,
            total_disk: AtomicU64::new(total_disk),
            created: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, session_id: &str) -> WorkflowResult<Slot> {
        self.read_map()
            .get(session_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found("session", session_id))
    }

    /// Number of sessions created by this store instance
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Creation ───────────────────────────────────────────────────────────

    /// Return the session with this id, creating it if it does not exist.
    ///
    /// Concurrent callers with the same id all observe the same session and
    /// exactly one creation happens.
    pub fn get_or_create(&self, session_id: &str) -> WorkflowResult<Session> {
        validate_session_id(session_id)?;

        if let Some(slot) = self.read_map().get(session_id).cloned() {
            return Ok(lock(&slot).session.clone());
        }

        let mut map = self.write_map();
        if let Some(slot) = map.get(session_id) {
            return Ok(lock(slot).session.clone());
        }
        self.insert_new(&mut map, session_id, SessionStatus::Active)
    }

    /// Create a new idle session. Generates an id when none is given.
    pub fn create_session(&self, session_id: Option<&str>) -> WorkflowResult<Session> {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        validate_session_id(&session_id)?;

        let mut map = self.write_map();
        if map.contains_key(&session_id) {
            return Err(WorkflowError::validation(
                "session_id",
                format!("session '{session_id}' already exists"),
            ));
        }
        self.insert_new(&mut map, &session_id, SessionStatus::Inactive)
    }

    fn insert_new(
        &self,
        map: &mut HashMap<String, Slot>,
        session_id: &str,
        status: SessionStatus,
    ) -> WorkflowResult<Session> {
        if map.len() >= self.settings.max_sessions {
            self.evict_oldest(map)?;
        }

        let workspace = self.settings.workspace_root.join(session_id);
        std::fs::create_dir_all(&workspace).map_err(|e| {
            WorkflowError::internal(format!(
                "failed to create workspace {}: {e}",
                workspace.display()
            ))
        })?;

        let mut session = Session::new(
            session_id,
            workspace,
            self.settings.ttl,
            self.settings.max_disk_per_session,
        );
        session.status = status;
        self.validator
            .validate(&session, Utc::now())
            .into_result()?;

        let dirty = match self.persistence.save(&session) {
            Ok(()) => false,
            Err(e) => {
                warn!(session_id, "Failed to persist new session, keeping it in memory: {}", e);
                true
            }
        };

        map.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(Entry {
                session: session.clone(),
                dirty,
                removed: false,
            })),
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        info!(session_id, %status, "Created session");
        Ok(session)
    }

    /// Remove the least recently used evictable session to make room
    fn evict_oldest(&self, map: &mut HashMap<String, Slot>) -> WorkflowResult<()> {
        let now = Utc::now();
        let oldest = map
            .iter()
            .filter_map(|(id, slot)| {
                let entry = lock(slot);
                entry
                    .session
                    .is_evictable(now)
                    .then(|| (entry.session.last_accessed, id.clone()))
            })
            .min()
            .map(|(_, id)| id);

        let limit_reached = || {
            WorkflowError::resource_limit(
                "sessions",
                format!("maximum of {} sessions reached", self.settings.max_sessions),
            )
        };
        let Some(id) = oldest else {
            return Err(limit_reached());
        };
        let Some(slot) = map.get(&id).cloned() else {
            return Err(limit_reached());
        };

        // A writer may have picked the session up since the scan
        let mut entry = lock(&slot);
        if !entry.session.is_evictable(now) {
            return Err(limit_reached());
        }
        map.remove(&id);
        self.finish_removal(&mut entry);
        info!(session_id = %id, "Evicted session to stay under the session limit");
        Ok(())
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub fn get_session(&self, session_id: &str) -> WorkflowResult<Session> {
        let slot = self.slot(session_id)?;
        let entry = lock(&slot);
        Ok(entry.session.clone())
    }

    fn snapshot(&self) -> Vec<Session> {
        self.read_map()
            .values()
            .map(|slot| lock(slot).session.clone())
            .collect()
    }

    /// All sessions, newest first
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions = self.snapshot();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn list_summaries(&self) -> Vec<SessionSummary> {
        let now = Utc::now();
        self.list_sessions()
            .iter()
            .map(|s| s.summary(now))
            .collect()
    }

    pub fn list_filtered(&self, filter: &SessionFilter) -> Vec<Session> {
        self.list_sessions()
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect()
    }

    /// Sessions carrying `label` (normalized), newest first
    pub fn get_sessions_by_label(&self, label: &str) -> WorkflowResult<Vec<Session>> {
        let label = normalize_label(label)?;
        Ok(self
            .list_sessions()
            .into_iter()
            .filter(|s| s.labels.contains(&label))
            .collect())
    }

    pub fn get_all_labels(&self) -> BTreeSet<String> {
        self.snapshot()
            .into_iter()
            .flat_map(|s| s.labels.into_iter())
            .collect()
    }

    /// Most recently created session for a repository
    pub fn find_session_by_repo(&self, repo_url: &str) -> Option<Session> {
        self.list_sessions()
            .into_iter()
            .find(|s| s.repo_url.as_deref() == Some(repo_url))
    }

    pub fn stats(&self) -> StoreStats {
        let now = Utc::now();
        let sessions = self.snapshot();
        let mut stats = StoreStats {
            total_sessions: sessions.len(),
            total_disk_limit: self.settings.total_disk_limit,
            ..Default::default()
        };

        let mut total_age = 0u64;
        for session in &sessions {
            *stats
                .by_status
                .entry(session.status.to_string())
                .or_insert(0) += 1;
            stats.total_disk_usage += session.disk_usage;
            stats.outstanding_jobs += session.outstanding_jobs();
            stats.total_errors += u64::from(session.error_count);
            total_age += (now - session.created_at).num_seconds().max(0) as u64;
        }
        if !sessions.is_empty() {
            stats.average_age_secs = total_age / sessions.len() as u64;
        }
        stats
    }

    // ─── Writes ─────────────────────────────────────────────────────────────

    /// Apply `mutate` to a session under its exclusive lock and persist the result.
    ///
    /// Status changes must follow the session state machine. If `mutate` or
    /// validation fails the session is left unchanged. A failed
    /// persist keeps the change in memory and is retried by the next update;
    /// a second consecutive failure rejects the update.
    pub fn update_session<F>(&self, session_id: &str, mutate: F) -> WorkflowResult<Session>
    where
        F: FnOnce(&mut Session) -> WorkflowResult<()>,
    {
        self.apply(session_id, mutate, PersistFailure::Reject)
    }

    /// Like [`update_session`](Self::update_session), but a persist failure
    /// never rejects the change: it stays in memory, dirty, until `flush`.
    ///
    /// For closing out runs, where losing a terminal job or session status
    /// would strand the session as active.
    pub fn finish_session<F>(&self, session_id: &str, mutate: F) -> WorkflowResult<Session>
    where
        F: FnOnce(&mut Session) -> WorkflowResult<()>,
    {
        self.apply(session_id, mutate, PersistFailure::KeepDirty)
    }

    fn apply<F>(&self, session_id: &str, mutate: F, on_failure: PersistFailure) -> WorkflowResult<Session>
    where
        F: FnOnce(&mut Session) -> WorkflowResult<()>,
    {
        let slot = self.slot(session_id)?;
        let mut entry = lock(&slot);
        if entry.removed {
            return Err(WorkflowError::not_found("session", session_id));
        }

        let mut draft = entry.session.clone();
        mutate(&mut draft)?;

        if draft.session_id != entry.session.session_id {
            return Err(WorkflowError::validation(
                "session_id",
                "session id cannot be changed",
            ));
        }
        if draft.created_at != entry.session.created_at {
            return Err(WorkflowError::validation(
                "created_at",
                "creation time cannot be changed",
            ));
        }
        if draft.status != entry.session.status
            && !entry.session.status.can_transition_to(draft.status)
        {
            return Err(WorkflowError::validation(
                "status",
                format!("cannot move from {} to {}", entry.session.status, draft.status),
            ));
        }

        let now = Utc::now();
        draft.updated_at = now;
        draft.last_accessed = now;

        let warnings = self.validator.validate(&draft, now).into_result()?;
        for warning in warnings {
            debug!(session_id, field = %warning.field, "{}", warning.message);
        }

        let old_disk = entry.session.disk_usage;
        self.reserve_disk(session_id, old_disk, draft.disk_usage)?;

        match self.persistence.save(&draft) {
            Ok(()) => entry.dirty = false,
            Err(e) if !entry.dirty => {
                warn!(session_id, "Failed to persist session, will retry on next update: {}", e);
                entry.dirty = true;
            }
            Err(e) if on_failure == PersistFailure::KeepDirty => {
                error!(session_id, "Failed to persist session again, keeping it for the next flush: {}", e);
            }
            Err(e) => {
                self.reserve_disk(session_id, draft.disk_usage, old_disk)?;
                return Err(e);
            }
        }

        entry.session = draft;
        Ok(entry.session.clone())
    }

    /// Move the aggregate disk counter from `old` to `new`, enforcing the aggregate limit
    fn reserve_disk(&self, session_id: &str, old: u64, new: u64) -> WorkflowResult<()> {
        if new <= old {
            self.total_disk.fetch_sub(old - new, Ordering::SeqCst);
            return Ok(());
        }
        let delta = new - old;
        let limit = self.settings.total_disk_limit;
        self.total_disk
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total + delta <= limit).then_some(total + delta)
            })
            .map(|_| ())
            .map_err(|total| {
                WorkflowError::resource_limit(
                    "disk",
                    format!(
                        "session {session_id} needs {delta} more bytes but the store holds {total} of {limit}"
                    ),
                )
            })
    }

    /// Persist every session whose last write failed. Returns how many were flushed.
    pub fn flush(&self) -> WorkflowResult<usize> {
        let slots: Vec<Slot> = self.read_map().values().cloned().collect();
        let mut flushed = 0;
        for slot in slots {
            let mut entry = lock(&slot);
            if entry.dirty && !entry.removed {
                self.persistence.save(&entry.session)?;
                entry.dirty = false;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    // ─── Removal ────────────────────────────────────────────────────────────

    /// Remove a session if `predicate` holds, checked under the session lock
    fn remove_where<P>(&self, session_id: &str, predicate: P) -> WorkflowResult<Option<Session>>
    where
        P: FnOnce(&mut Session) -> bool,
    {
        let mut map = self.write_map();
        let Some(slot) = map.get(session_id).cloned() else {
            return Ok(None);
        };
        let mut entry = lock(&slot);
        if !predicate(&mut entry.session) {
            return Ok(None);
        }
        map.remove(session_id);
        drop(map);

        let removed = self.finish_removal(&mut entry);
        Ok(Some(removed))
    }

    /// Mark an unlinked entry removed and clean up its record and workspace
    fn finish_removal(&self, entry: &mut Entry) -> Session {
        entry.removed = true;
        let session = entry.session.clone();
        self.total_disk
            .fetch_sub(session.disk_usage, Ordering::SeqCst);

        if let Err(e) = self.persistence.delete(&session.session_id) {
            warn!(session_id = %session.session_id, "Failed to delete session record: {}", e);
        }
        remove_workspace(&self.settings.workspace_root, &session.workspace_dir);
        session
    }

    /// Delete a session, cancelling outstanding jobs. Returns the cancelled job ids.
    #[instrument(skip(self))]
    pub fn delete_session(&self, session_id: &str) -> WorkflowResult<Vec<String>> {
        let mut cancelled = Vec::new();
        let removed = self.remove_where(session_id, |session| {
            cancelled = cancel_jobs(session, Utc::now());
            true
        })?;

        match removed {
            Some(_) => {
                info!(cancelled_jobs = cancelled.len(), "Deleted session");
                Ok(cancelled)
            }
            None => Err(WorkflowError::not_found("session", session_id)),
        }
    }

    /// Remove every session eligible for cleanup at `now`. Returns how many were removed.
    ///
    /// Eligibility is snapshotted under the read lock, then rechecked per
    /// session under its own lock while removing.
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> WorkflowResult<usize> {
        let retention = self.settings.retention;
        let grace = self.settings.deleted_grace;

        let candidates: Vec<String> = self
            .read_map()
            .iter()
            .filter(|(_, slot)| {
                lock(slot)
                    .session
                    .should_auto_cleanup(now, retention, grace)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in candidates {
            let outcome =
                self.remove_where(&id, |session| session.should_auto_cleanup(now, retention, grace))?;
            if outcome.is_some() {
                debug!(session_id = %id, "Garbage collected session");
                removed += 1;
            }
        }

        let orphans = self.cleanup_orphaned_workspaces();
        if removed > 0 || orphans > 0 {
            info!(removed, orphans, "Garbage collection finished");
        }
        Ok(removed)
    }

    /// Remove workspace directories that belong to no session
    fn cleanup_orphaned_workspaces(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.settings.workspace_root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // Held while removing so a concurrent creation cannot lose its workspace
            let map = self.read_map();
            if !map.contains_key(&name) {
                remove_workspace(&self.settings.workspace_root, &path);
                removed += 1;
            }
        }
        removed
    }

    // ─── Status ─────────────────────────────────────────────────────────────

    pub fn set_status(&self, session_id: &str, target: SessionStatus) -> WorkflowResult<Session> {
        self.update_session(session_id, |session| {
            if session.transition_to(target) {
                Ok(())
            } else {
                Err(WorkflowError::validation(
                    "status",
                    format!("cannot move from {} to {}", session.status, target),
                ))
            }
        })
    }

    // ─── Labels ─────────────────────────────────────────────────────────────

    pub fn add_label(&self, session_id: &str, label: &str) -> WorkflowResult<Session> {
        let label = normalize_label(label)?;
        self.update_session(session_id, |session| {
            session.labels.insert(label);
            Ok(())
        })
    }

    pub fn remove_label(&self, session_id: &str, label: &str) -> WorkflowResult<Session> {
        let label = normalize_label(label)?;
        self.update_session(session_id, |session| {
            session.labels.remove(&label);
            Ok(())
        })
    }

    /// Replace all labels; invalid input rejects the whole set
    pub fn set_labels(&self, session_id: &str, labels: &[String]) -> WorkflowResult<Session> {
        let labels = labels
            .iter()
            .map(|l| normalize_label(l))
            .collect::<WorkflowResult<BTreeSet<_>>>()?;
        self.update_session(session_id, |session| {
            session.labels = labels;
            Ok(())
        })
    }

    /// Merge Kubernetes labels; any invalid pair rejects the whole change
    pub fn set_k8s_labels(
        &self,
        session_id: &str,
        labels: &BTreeMap<String, String>,
    ) -> WorkflowResult<Session> {
        for (key, value) in labels {
            validate_k8s_label_key(key)?;
            validate_k8s_label_value(value)?;
        }
        self.update_session(session_id, |session| {
            session
                .k8s_labels
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    pub fn remove_k8s_label(&self, session_id: &str, key: &str) -> WorkflowResult<Session> {
        validate_k8s_label_key(key)?;
        self.update_session(session_id, |session| {
            session.k8s_labels.remove(key);
            Ok(())
        })
    }

    // ─── Jobs ───────────────────────────────────────────────────────────────

    /// Register a pending job; returns its id
    pub fn start_job(&self, session_id: &str, job_type: &str) -> WorkflowResult<String> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let job = JobInfo::new(&job_id, job_type);
        self.update_session(session_id, |session| {
            session.active_jobs.insert(job.job_id.clone(), job);
            Ok(())
        })?;
        debug!(session_id, job_id = %job_id, job_type, "Started job");
        Ok(job_id)
    }

    pub fn update_job_status(
        &self,
        session_id: &str,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> WorkflowResult<JobInfo> {
        let session = self.update_session(session_id, |session| {
            let job = session
                .active_jobs
                .get_mut(job_id)
                .ok_or_else(|| WorkflowError::not_found("job", job_id))?;
            let from = job.status;
            if !job.transition(status, Utc::now()) {
                return Err(WorkflowError::validation(
                    "job_status",
                    format!("job {job_id} cannot move from {from} to {status}"),
                ));
            }
            if error.is_some() {
                job.error = error;
            }
            Ok(())
        })?;
        session
            .active_jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| WorkflowError::internal(format!("job {job_id} vanished after update")))
    }

    /// Finish a job with a result (`Ok`) or an error message (`Err`)
    pub fn complete_job(
        &self,
        session_id: &str,
        job_id: &str,
        outcome: Result<String, String>,
    ) -> WorkflowResult<JobInfo> {
        let session = self.update_session(session_id, |session| {
            let job = session
                .active_jobs
                .get_mut(job_id)
                .ok_or_else(|| WorkflowError::not_found("job", job_id))?;
            let now = Utc::now();
            if job.status == JobStatus::Pending {
                job.transition(JobStatus::Running, now);
            }
            let target = if outcome.is_ok() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            let from = job.status;
            if !job.transition(target, now) {
                return Err(WorkflowError::validation(
                    "job_status",
                    format!("job {job_id} cannot move from {from} to {target}"),
                ));
            }
            match outcome {
                Ok(result) => job.result = Some(result),
                Err(error) => job.error = Some(error),
            }
            Ok(())
        })?;
        session
            .active_jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| WorkflowError::internal(format!("job {job_id} vanished after update")))
    }

    /// Cancel every pending or running job. Returns the cancelled ids.
    pub fn cancel_session_jobs(&self, session_id: &str) -> WorkflowResult<Vec<String>> {
        let mut cancelled = Vec::new();
        self.update_session(session_id, |session| {
            cancelled = cancel_jobs(session, Utc::now());
            Ok(())
        })?;
        Ok(cancelled)
    }

    // ─── Disk ───────────────────────────────────────────────────────────────

    pub fn update_disk_usage(&self, session_id: &str, bytes: u64) -> WorkflowResult<Session> {
        self.update_session(session_id, |session| {
            session.disk_usage = bytes;
            Ok(())
        })
    }

    /// Measure the session workspace on disk and record it
    pub fn refresh_disk_usage(&self, session_id: &str) -> WorkflowResult<u64> {
        let session = self.get_session(session_id)?;
        let bytes = dir_size(&session.workspace_dir);
        self.update_disk_usage(session_id, bytes)?;
        Ok(bytes)
    }

    /// Whether `additional` bytes fit in both the session and aggregate quotas
    pub fn check_disk_quota(&self, session_id: &str, additional: u64) -> WorkflowResult<()> {
        let session = self.get_session(session_id)?;
        let session_limit = self
            .settings
            .max_disk_per_session
            .min(session.max_disk_usage);
        if session.disk_usage + additional > session_limit {
            return Err(WorkflowError::resource_limit(
                "disk",
                format!(
                    "session {session_id} would use {} of {session_limit} bytes",
                    session.disk_usage + additional
                ),
            ));
        }
        let total = self.total_disk.load(Ordering::SeqCst);
        if total + additional > self.settings.total_disk_limit {
            return Err(WorkflowError::resource_limit(
                "disk",
                format!(
                    "store would use {} of {} bytes",
                    total + additional,
                    self.settings.total_disk_limit
                ),
            ));
        }
        Ok(())
    }

    // ─── History and errors ─────────────────────────────────────────────────

    pub fn track_error(&self, session_id: &str, message: &str) -> WorkflowResult<Session> {
        self.update_session(session_id, |session| {
            session.last_error = Some(message.to_string());
            session.error_count += 1;
            Ok(())
        })
    }

    /// Append an open history entry; returns its index
    pub fn track_stage_execution(&self, session_id: &str, step: &str) -> WorkflowResult<usize> {
        let mut index = 0;
        self.update_session(session_id, |session| {
            let attempt = session
                .stage_history
                .iter()
                .filter(|e| e.step == step)
                .count() as u32
                + 1;
            index = session.stage_history.len();
            session
                .stage_history
                .push(StageExecution::start(step, attempt));
            Ok(())
        })?;
        Ok(index)
    }

    pub fn complete_stage_execution(
        &self,
        session_id: &str,
        index: usize,
        success: bool,
        error: Option<String>,
        tokens_used: u64,
    ) -> WorkflowResult<Session> {
        self.update_session(session_id, |session| {
            let entry = session
                .stage_history
                .get_mut(index)
                .ok_or_else(|| WorkflowError::not_found("stage execution", index.to_string()))?;
            entry.finish(success, error, tokens_used);
            session
                .token_usage
                .add(&TokenUsage::new(0, tokens_used));
            Ok(())
        })
    }

    /// Store a workflow checkpoint: snapshot, stage history and token usage
    pub fn record_workflow(&self, state: &WorkflowState) -> WorkflowResult<Session> {
        self.update_session(&state.session_id, |session| {
            session.stage_history = state.stage_history.clone();
            session.token_usage = state.token_usage.clone();
            if session.repo_url.is_none() && !state.repo_identifier.is_empty() {
                session.repo_url = Some(state.repo_identifier.clone());
            }
            session.workflow = Some(state.clone());
            Ok(())
        })
    }
}

fn cancel_jobs(session: &mut Session, now: DateTime<Utc>) -> Vec<String> {
    session
        .active_jobs
        .values_mut()
        .filter(|job| job.status.is_outstanding())
        .filter_map(|job| {
            job.transition(JobStatus::Cancelled, now)
                .then(|| job.job_id.clone())
        })
        .collect()
}

/// Remove a workspace, refusing anything outside the workspace root
fn remove_workspace(root: &Path, workspace: &Path) {
    if !workspace.starts_with(root) || workspace == root {
        warn!(workspace = %workspace.display(), "Refusing to remove workspace outside the workspace root");
        return;
    }
    match std::fs::remove_dir_all(workspace) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(workspace = %workspace.display(), "Failed to remove workspace: {}", e),
    }
}

/// Total size of regular files under `path`
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::persistence::{FilePersistence, MemoryPersistence};
    use chrono::Duration;
    use tempfile::TempDir;

    const ID: &str = "session-0001";

    fn store_in(dir: &TempDir) -> (SessionStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let settings = StoreSettings::with_workspace_root(dir.path().join("workspaces"));
        let store = SessionStore::open(settings, persistence.clone()).unwrap();
        (store, persistence)
    }

    #[test]
    fn test_get_or_create_defaults() {
        let dir = TempDir::new().unwrap();
        let (store, persistence) = store_in(&dir);

        let session = store.get_or_create(ID).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.expires_at > session.created_at);
        assert!(session.workspace_dir.is_dir());
        assert!(session.labels.is_empty());
        assert!(persistence.stored(ID).is_some());

        let again = store.get_or_create(ID).unwrap();
        assert_eq!(again.created_at, session.created_at);
        assert_eq!(store.created_count(), 1);
    }

    #[test]
    fn test_get_or_create_rejects_bad_id() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        assert!(matches!(
            store.get_or_create("../x"),
            Err(WorkflowError::Validation { .. })
        ));
    }

    #[test]
    fn test_failed_mutation_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let err = store
            .update_session(ID, |s| {
                s.error_count = 99;
                Err(WorkflowError::validation("test", "nope"))
            })
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert_eq!(store.get_session(ID).unwrap().error_count, 0);
    }

    #[test]
    fn test_session_id_is_immutable() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let result = store.update_session(ID, |s| {
            s.session_id = "session-0002".to_string();
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.get_session(ID).unwrap().session_id, ID);
    }

    #[test]
    fn test_label_normalization_dedupes() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        for label in ["Foo", " foo ", "FOO"] {
            store.add_label(ID, label).unwrap();
        }

        let session = store.get_session(ID).unwrap();
        assert_eq!(session.labels.into_iter().collect::<Vec<_>>(), vec!["foo"]);
        assert!(store.add_label(ID, "   ").is_err());
    }

    #[test]
    fn test_sessions_by_label_newest_first() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);

        for id in ["session-0001", "session-0002", "session-0003"] {
            store.get_or_create(id).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        store.add_label("session-0001", "team").unwrap();
        store.add_label("session-0003", "Team").unwrap();

        let ids: Vec<String> = store
            .get_sessions_by_label("TEAM")
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["session-0003", "session-0001"]);
        assert_eq!(store.get_all_labels().into_iter().collect::<Vec<_>>(), vec!["team"]);
    }

    #[test]
    fn test_k8s_labels_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("bad key!".to_string(), "x".to_string());
        assert!(store.set_k8s_labels(ID, &labels).is_err());
        assert!(store.get_session(ID).unwrap().k8s_labels.is_empty());

        labels.remove("bad key!");
        labels.insert("tier".to_string(), "a".repeat(64));
        assert!(store.set_k8s_labels(ID, &labels).is_err());

        labels.insert("tier".to_string(), "frontend".to_string());
        let session = store.set_k8s_labels(ID, &labels).unwrap();
        assert_eq!(session.k8s_labels.len(), 2);

        let session = store.remove_k8s_label(ID, "tier").unwrap();
        assert_eq!(session.k8s_labels.len(), 1);
    }

    #[test]
    fn test_status_transitions_enforced() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        assert!(store.set_status(ID, SessionStatus::Deleted).is_err());
        store.set_status(ID, SessionStatus::Completed).unwrap();
        assert!(store.set_status(ID, SessionStatus::Active).is_err());
        store.set_status(ID, SessionStatus::Deleted).unwrap();
    }

    #[test]
    fn test_update_session_cannot_bypass_status_machine() {
        let dir = TempDir::new().unwrap();
        let (store, persistence) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let err = store
            .update_session(ID, |s| {
                s.status = SessionStatus::Inactive;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "status"));

        store.set_status(ID, SessionStatus::Completed).unwrap();
        let err = store
            .update_session(ID, |s| {
                s.status = SessionStatus::Active;
                s.error_count += 1;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));

        // Nothing from the rejected mutation was applied or persisted
        let session = store.get_session(ID).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.error_count, 0);
        assert_eq!(persistence.stored(ID).unwrap().status, SessionStatus::Completed);

        // Legal moves still go through the generic path
        store
            .update_session(ID, |s| {
                s.status = SessionStatus::Deleted;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_job_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let job_id = store.start_job(ID, "containerize").unwrap();
        let job = store
            .update_job_status(ID, &job_id, JobStatus::Running, None)
            .unwrap();
        assert!(job.started_at.is_some());

        assert!(store
            .update_job_status(ID, &job_id, JobStatus::Pending, None)
            .is_err());

        let job = store
            .complete_job(ID, &job_id, Ok("done".to_string()))
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.duration_ms.is_some());
        assert_eq!(job.result.as_deref(), Some("done"));

        assert!(store
            .update_job_status(ID, "missing", JobStatus::Running, None)
            .is_err());
    }

    #[test]
    fn test_cancel_session_jobs() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let pending = store.start_job(ID, "build").unwrap();
        let running = store.start_job(ID, "deploy").unwrap();
        let done = store.start_job(ID, "scan").unwrap();
        store
            .update_job_status(ID, &running, JobStatus::Running, None)
            .unwrap();
        store.complete_job(ID, &done, Ok(String::new())).unwrap();

        let mut cancelled = store.cancel_session_jobs(ID).unwrap();
        cancelled.sort();
        let mut expected = vec![pending, running];
        expected.sort();
        assert_eq!(cancelled, expected);

        let session = store.get_session(ID).unwrap();
        assert!(!session.has_active_jobs());
        assert_eq!(session.active_jobs[&done].status, JobStatus::Completed);
    }

    #[test]
    fn test_delete_session_removes_record_and_workspace() {
        let dir = TempDir::new().unwrap();
        let (store, persistence) = store_in(&dir);
        let session = store.get_or_create(ID).unwrap();
        let job = store.start_job(ID, "build").unwrap();

        let cancelled = store.delete_session(ID).unwrap();
        assert_eq!(cancelled, vec![job]);
        assert!(persistence.stored(ID).is_none());
        assert!(!session.workspace_dir.exists());
        assert!(matches!(
            store.get_session(ID),
            Err(WorkflowError::NotFound { .. })
        ));
        assert!(store.delete_session(ID).is_err());
    }

    #[test]
    fn test_gc_respects_windows_and_running_jobs() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);

        for id in ["session-0001", "session-0002", "session-0003"] {
            store.get_or_create(id).unwrap();
            store.set_status(id, SessionStatus::Completed).unwrap();
        }
        let job = store.start_job("session-0002", "deploy").unwrap();
        store
            .update_job_status("session-0002", &job, JobStatus::Running, None)
            .unwrap();

        // Nothing is old enough yet
        assert_eq!(store.collect_garbage(Utc::now()).unwrap(), 0);

        let far_future = Utc::now() + Duration::days(3650);
        assert_eq!(store.collect_garbage(far_future).unwrap(), 2);
        assert!(store.get_session("session-0002").is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_gc_removes_orphaned_workspaces() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();
        let orphan = dir.path().join("workspaces").join("leftover");
        std::fs::create_dir_all(&orphan).unwrap();

        store.collect_garbage(Utc::now()).unwrap();
        assert!(!orphan.exists());
        assert!(store.get_session(ID).unwrap().workspace_dir.exists());
    }

    #[test]
    fn test_max_sessions_evicts_oldest_terminal() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(MemoryPersistence::new());
        let mut settings = StoreSettings::with_workspace_root(dir.path().join("ws"));
        settings.max_sessions = 2;
        let store = SessionStore::open(settings, persistence).unwrap();

        store.get_or_create("session-0001").unwrap();
        store.get_or_create("session-0002").unwrap();

        // Both active: nothing to evict
        assert!(matches!(
            store.get_or_create("session-0003"),
            Err(WorkflowError::ResourceLimit { .. })
        ));

        store
            .set_status("session-0001", SessionStatus::Failed)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.get_or_create("session-0003").unwrap();
        assert!(store.get_session("session-0001").is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_disk_limits() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(MemoryPersistence::new());
        let mut settings = StoreSettings::with_workspace_root(dir.path().join("ws"));
        settings.max_disk_per_session = 100;
        settings.total_disk_limit = 150;
        let store = SessionStore::open(settings, persistence).unwrap();
        store.get_or_create("session-0001").unwrap();
        store.get_or_create("session-0002").unwrap();

        assert!(store.update_disk_usage("session-0001", 101).is_err());
        store.update_disk_usage("session-0001", 100).unwrap();
        assert!(store.check_disk_quota("session-0002", 60).is_err());
        assert!(store.update_disk_usage("session-0002", 60).is_err());
        store.update_disk_usage("session-0002", 50).unwrap();

        store.update_disk_usage("session-0001", 10).unwrap();
        store.update_disk_usage("session-0002", 100).unwrap();
        assert_eq!(store.stats().total_disk_usage, 110);
    }

    #[test]
    fn test_persist_failure_degrades_once_then_rejects() {
        let dir = TempDir::new().unwrap();
        let (store, persistence) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        persistence.set_fail_saves(true);
        store.add_label(ID, "first").unwrap();
        assert!(store.get_session(ID).unwrap().labels.contains("first"));

        // Second consecutive failure must not widen the divergence
        assert!(store.add_label(ID, "second").is_err());
        assert!(!store.get_session(ID).unwrap().labels.contains("second"));

        persistence.set_fail_saves(false);
        assert_eq!(store.flush().unwrap(), 1);
        assert!(persistence.stored(ID).unwrap().labels.contains("first"));
    }

    #[test]
    fn test_finish_session_survives_repeated_persist_failures() {
        let dir = TempDir::new().unwrap();
        let (store, persistence) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        persistence.set_fail_saves(true);
        store.add_label(ID, "first").unwrap();
        assert!(store.add_label(ID, "second").is_err());

        let session = store
            .finish_session(ID, |s| {
                s.transition_to(SessionStatus::Failed);
                Ok(())
            })
            .unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(persistence.stored(ID).unwrap().status, SessionStatus::Active);

        // A failed mutation is still rejected
        assert!(store
            .finish_session(ID, |s| {
                s.status = SessionStatus::Active;
                Ok(())
            })
            .is_err());

        persistence.set_fail_saves(false);
        assert_eq!(store.flush().unwrap(), 1);
        assert_eq!(persistence.stored(ID).unwrap().status, SessionStatus::Failed);
    }

    #[test]
    fn test_reopen_loads_live_sessions_and_drops_stale() {
        let dir = TempDir::new().unwrap();
        let records = dir.path().join("records");
        let settings = StoreSettings::with_workspace_root(dir.path().join("ws"));

        {
            let store = SessionStore::open(
                settings.clone(),
                Arc::new(FilePersistence::new(&records).unwrap()),
            )
            .unwrap();
            store.get_or_create("session-0001").unwrap();
            store.add_label("session-0001", "keep").unwrap();
            store.get_or_create("session-0002").unwrap();
            store
                .set_status("session-0002", SessionStatus::Suspended)
                .unwrap();
            store
                .set_status("session-0002", SessionStatus::Deleted)
                .unwrap();
            store
                .update_session("session-0002", |s| {
                    s.expires_at = s.created_at + Duration::seconds(1);
                    Ok(())
                })
                .unwrap();
        }

        let mut short_grace = settings;
        short_grace.deleted_grace = Duration::zero();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let store =
            SessionStore::open(short_grace, Arc::new(FilePersistence::new(&records).unwrap()))
                .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store
            .get_session("session-0001")
            .unwrap()
            .labels
            .contains("keep"));
    }

    #[test]
    fn test_stage_tracking_and_stats() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create(ID).unwrap();

        let first = store.track_stage_execution(ID, "build").unwrap();
        store
            .complete_stage_execution(ID, first, false, Some("exit 1".to_string()), 5)
            .unwrap();
        let second = store.track_stage_execution(ID, "build").unwrap();
        let session = store
            .complete_stage_execution(ID, second, true, None, 0)
            .unwrap();

        assert_eq!(session.stage_history.len(), 2);
        assert_eq!(session.stage_history[1].attempt, 2);
        assert_eq!(session.stages_completed(), 1);

        store.track_error(ID, "boom").unwrap();
        let stats = store.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.by_status.get("active"), Some(&1));
    }

    #[test]
    fn test_create_session_generates_id() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);

        let session = store.create_session(None).unwrap();
        assert_eq!(session.session_id.len(), 32);
        assert_eq!(session.status, SessionStatus::Inactive);
        assert!(store.create_session(Some(&session.session_id)).is_err());
    }

    #[test]
    fn test_find_session_by_repo() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.get_or_create("repo-session-a").unwrap();
        store
            .update_session("repo-session-a", |s| {
                s.repo_url = Some("https://example.com/app.git".to_string());
                Ok(())
            })
            .unwrap();
        store.get_or_create("repo-session-b").unwrap();

        let found = store.find_session_by_repo("https://example.com/app.git").unwrap();
        assert_eq!(found.session_id, "repo-session-a");
        assert!(store.find_session_by_repo("/elsewhere").is_none());
    }
}
