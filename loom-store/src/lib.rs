//! Storage backends for the Loom route execution engine.
//!
//! Both backends implement [`loom_core::RouteStore`] with the same
//! semantics: slugs unique per kind, counters owned by
//! `record_execution`, and deletes cascading to usage and logs.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
