//! Versioned cache partitions and the caching strategies built on them.
//!
//! This module provides:
//! - Named partitions of GET responses, stored in SQLite
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - A navigation handler that always produces a page, even offline

mod layer;
mod names;
mod navigation;
mod result;
mod storage;

pub use layer::{offline_api_response, CacheLayer, OFFLINE_MESSAGE};
pub use names::CacheNames;
pub use navigation::OFFLINE_HTML;
pub use result::{CacheResult, CacheSource};
pub use storage::{entry_key, CacheStorage, PartitionInfo, SqliteStorage};
