//! Concurrency and persistence properties of the session store
//!
//! Every test uses its own temporary directory for session records and
//! workspaces, so they are safe to run in parallel.

use std::collections::BTreeSet;
use std::sync::Arc;

use tempfile::TempDir;

use stevedore::session::{FilePersistence, SessionStatus, SessionStore, StoreSettings};

const WRITERS: usize = 8;
const UPDATES_PER_WRITER: usize = 25;

fn open_store(dir: &TempDir) -> Arc<SessionStore> {
    let persistence = FilePersistence::new(dir.path().join("sessions")).unwrap();
    Arc::new(
        SessionStore::open(
            StoreSettings::with_workspace_root(dir.path().join("workspaces")),
            Arc::new(persistence),
        )
        .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.get_or_create("counter-session").unwrap();

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..UPDATES_PER_WRITER {
                store
                    .update_session("counter-session", |session| {
                        session.error_count += 1;
                        Ok(())
                    })
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let expected = (WRITERS * UPDATES_PER_WRITER) as u32;
    assert_eq!(store.get_session("counter-session").unwrap().error_count, expected);

    // The persisted record matches the in-memory one
    store.flush().unwrap();
    let reopened = open_store(&dir);
    assert_eq!(
        reopened.get_session("counter-session").unwrap().error_count,
        expected
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_creates_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.get_or_create("shared-session").unwrap()
        }));
    }

    let mut created_at = BTreeSet::new();
    for handle in handles {
        let session = handle.await.unwrap();
        assert_eq!(session.session_id, "shared-session");
        created_at.insert(session.created_at);
    }

    assert_eq!(store.created_count(), 1);
    assert_eq!(store.len(), 1);
    assert_eq!(created_at.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_label_writers_on_distinct_sessions() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("labelled-{i:04}");
            store.get_or_create(&id).unwrap();
            store.add_label(&id, "fleet").unwrap();
            store.add_label(&id, &format!("Shard-{}", i % 2)).unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.get_sessions_by_label("fleet").unwrap().len(), WRITERS);
    assert_eq!(store.get_sessions_by_label("shard-0").unwrap().len(), WRITERS / 2);
    assert_eq!(
        store.get_all_labels().into_iter().collect::<Vec<_>>(),
        vec!["fleet", "shard-0", "shard-1"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_racing_updates_never_resurrects() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.get_or_create("doomed-session").unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut applied = 0;
            for _ in 0..200 {
                let result = store.update_session("doomed-session", |session| {
                    session.error_count += 1;
                    Ok(())
                });
                if result.is_err() {
                    break;
                }
                applied += 1;
                tokio::task::yield_now().await;
            }
            applied
        })
    };
    tokio::task::yield_now().await;
    store.delete_session("doomed-session").unwrap();
    writer.await.unwrap();

    assert!(store.get_session("doomed-session").is_err());
    store.flush().unwrap();
    assert!(open_store(&dir).get_session("doomed-session").is_err());
}

#[tokio::test]
async fn test_status_machine_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.create_session(Some("status-session")).unwrap();
        store
            .set_status("status-session", SessionStatus::Active)
            .unwrap();
        store
            .set_status("status-session", SessionStatus::Suspended)
            .unwrap();
    }

    let store = open_store(&dir);
    let session = store.get_session("status-session").unwrap();
    assert_eq!(session.status, SessionStatus::Suspended);
    assert!(store
        .set_status("status-session", SessionStatus::Completed)
        .is_err());
    store
        .set_status("status-session", SessionStatus::Active)
        .unwrap();
}
