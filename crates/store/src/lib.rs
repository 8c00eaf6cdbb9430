//! Durable storage boundary for the learning orchestrator.
//!
//! The orchestrator persists three kinds of data: durable notes written by
//! the memory middleware, progress snapshots used for session recovery, and
//! immutable learning records from the tutor loop. `DurableStore` is the
//! trait boundary; `SqliteStore` is the production implementation and
//! `MemoryStore` backs tests.

mod error;
mod memory;
pub mod models;
mod pool;
mod sqlite;
mod store;

pub use error::*;
pub use memory::MemoryStore;
pub use pool::*;
pub use sqlite::SqliteStore;
pub use store::{DurableNote, DurableStore};
