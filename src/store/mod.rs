//! Persistence adapters
//!
//! Implementations of [`crate::domain::VdqmStore`].

pub mod memory;

pub use memory::{MemoryStore, MemoryStoreConfig, StoreStatsSnapshot};
