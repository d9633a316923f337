//! Persistent, concurrent session management.

pub mod gc;
pub mod model;
pub mod persistence;
pub mod store;
pub mod validation;

pub use gc::GarbageCollector;
pub use model::{
    JobInfo, JobStatus, Session, SessionFilter, SessionStatus, SessionSummary, StoreStats,
};
pub use persistence::{FilePersistence, MemoryPersistence, SessionPersistence};
pub use store::{SessionStore, StoreSettings};
