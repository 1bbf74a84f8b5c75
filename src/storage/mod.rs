//! Durable store backends.

pub mod traits;
pub mod memory;
pub mod sql;

pub use traits::{DurableStore, StorageError};
pub use memory::InMemoryStore;
pub use sql::SqliteStore;
