//! # Till Sync Engine
//!
//! A local-first sync engine for the Till point-of-sale client.
//!
//! The client keeps a replica of the back-office collections (products,
//! clients, sales, taxes, users, translations, ...) so the till keeps
//! working when the network does not. Writes land locally first and reach
//! the origin later; reads never wait on the network.
//!
//! ## Components
//!
//! - [`ReplicaStore`]: the local copy of every collection, in SQLite.
//! - [`Outbox`]: durable, ordered log of mutations not yet acknowledged by
//!   the origin. Drained head first by the [`Flusher`].
//! - [`Reconciler`]: pulls snapshots from the origin and merges them with
//!   last-writer-wins on `updatedAt`. A pull never deletes.
//! - [`Bus`]: recomputes subscriber views whenever the replica changes.
//! - [`LifecycleController`]: runs the pull cadence and connectivity
//!   listener for as long as a [`Session`] is active.
//!
//! [`SyncEngine`] wires them together.
//!
//! ## Data flow
//!
//! ```text
//! UI write -> replica (optimistic) -> outbox -> origin (when online)
//!                 |
//!                 +-> bus -> subscribers
//!
//! cadence / reconnect -> pull -> merge -> replica -> bus
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use till_sync_engine::{MemoryOrigin, Selector, Session, SyncConfig, SyncEngine};
//!
//! # async fn demo() -> till_sync_engine::Result<()> {
//! let engine = SyncEngine::builder(SyncConfig::default().with_database_url("sqlite::memory:"))
//!     .origin(Arc::new(MemoryOrigin::new()))
//!     .build()
//!     .await?;
//!
//! engine.start(Session::new("u-1", "token")).await;
//!
//! let client = engine.create("client", json!({"name": "Ana"})).await?;
//! assert!(client.id.starts_with("tmp-"));
//!
//! engine
//!     .subscribe(Selector::collection("clients"), |state| {
//!         println!("clients changed: {state:?}");
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod flush;
pub mod lifecycle;
pub mod operation;
pub mod origin;
pub mod outbox;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod status;
pub mod store;
pub mod translation;

// Re-export main types at crate root
pub use bus::{Bus, Selector, SubscriptionHandle, View, ViewState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use engine::{EngineBuilder, SyncEngine};
pub use error::{Error, Result};
pub use flush::{DrainReport, Flusher};
pub use lifecycle::{LifecycleController, NetworkStatus, Session};
pub use operation::{Mutation, OperationKind};
pub use origin::{CallKind, HttpOrigin, MemoryOrigin, Origin, OriginCall, RequestContext};
pub use outbox::{Outbox, OutboxEntry};
pub use reconcile::{MergeDecision, MergeReport, PullOutcome, Reconciler};
pub use record::Record;
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use status::{SyncIndicator, SyncStatus};
pub use store::{ChangeEvent, ChangeKind, CollectionWriter, ReplicaStore};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
