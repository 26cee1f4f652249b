//! Storage backends for monitors, results, incidents and recipients
//!
//! ## Design
//!
//! - **Trait-based**: one async trait per collaborator (`MonitorStore`,
//!   `ResultStore`, `IncidentStore`, `RecipientStore`)
//! - **Async**: all operations are async for compatibility with Tokio actors
//! - **Bundled into [`Stores`]**: the engine receives one cloneable bundle
//!
//! ## Backends
//!
//! - **SQLite** (default): embedded database with migrations
//! - **In-Memory**: no persistence, used by tests and the `none` backend
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use uptime_engine::storage::{Stores, sqlite::SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(SqliteStore::new("./uptime.db").await?);
//!     let _stores = Stores::from_backend(backend);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{IncidentStore, MonitorStore, RecipientStore, ResultStore, Stores};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
