//! Persistence boundary for the hivemind coordinator.
//!
//! The hive only needs a namespaced key/value store with optional expiry.
//! [`HiveStore`] abstracts that, so the coordinator can run against any
//! backend; [`MemoryStore`] is the in-process implementation.
//!
//! Typed records go through [`StoreExt`], which wraps payloads in a
//! [`Versioned`] envelope and rejects records written with an unknown
//! schema version.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{HiveStore, Namespace, Result, StoreError, StoreExt, Versioned, SCHEMA_VERSION};
