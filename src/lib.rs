//! jobtrack-sync - local-first sync layer for a job-application tracker.
//!
//! Records are written to memory and a durable local store first, then
//! mirrored to a REST backend. Writes made while the backend is
//! unreachable are queued and replayed once it comes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  SyncEngine                    │
//! │  ┌───────────┐  ┌──────────────┐  ┌─────────┐  │
//! │  │ RecordSet │─▶│ PendingQueue │─▶│ Replay  │  │
//! │  └─────┬─────┘  └──────┬───────┘  └────┬────┘  │
//! │        ▼               ▼               ▼       │
//! │   LocalStore      LocalStore      RemoteApi    │
//! └───────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod remote;
pub mod store;

#[cfg(feature = "server")]
pub mod server;

pub use config::Config;
pub use engine::{Mutation, ReplayReport, SyncEngine, SyncEvent, WriteStatus};
pub use error::{RemoteError, Result, StoreError, SyncError};
pub use models::{
    BulkSnapshot, ConnectivityState, Fields, Operation, PendingOperation, Record, RecordType,
    RemoteRecord,
};
pub use remote::{HttpRemote, RemoteApi, RetryPolicy};
pub use store::{FileStore, LocalStore, MemoryStore};
