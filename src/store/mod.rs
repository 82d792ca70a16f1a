//! Persistence contract and the in-memory reference store.

pub mod memory_store;
pub mod store_trait;

pub use memory_store::MemoryStore;
pub use store_trait::{Store, StoreError};
