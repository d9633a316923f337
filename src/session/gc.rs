//! Background garbage collection for the session store.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::session::store::SessionStore;

/// Periodic cleanup task; stopped explicitly or when dropped
pub struct GarbageCollector {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    runs: Arc<AtomicU64>,
}

impl GarbageCollector {
    /// Spawn the collection loop. The first pass runs immediately.
    pub fn start(store: Arc<SessionStore>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();

        let handle = tokio::spawn(async move {
            info!("Session garbage collector started, interval: {:?}", interval);
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Record deletion and workspace removal hit the filesystem
                        let pass = store.clone();
                        match tokio::task::spawn_blocking(move || pass.collect_garbage(Utc::now())).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!("Session garbage collection failed: {}", e),
                            Err(e) => error!("Session garbage collection task failed: {}", e),
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = &mut shutdown_rx => {
                        info!("Session garbage collector shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            runs,
        }
    }

    /// Completed collection passes
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop and wait for it to exit. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Session garbage collector task failed: {}", e);
            }
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl SessionStore {
    /// Start periodic garbage collection on the current runtime
    pub fn start_gc(self: &Arc<Self>, interval: Duration) -> GarbageCollector {
        GarbageCollector::start(self.clone(), interval)
    }
}
