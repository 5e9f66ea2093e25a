//! Named response caches grouped into versioned generations.
//!
//! This module provides the host cache capability the worker builds on:
//! - A cache store of named caches, each mapping request URL to a response snapshot
//! - In-memory and SQLite backends behind one trait
//! - Generation naming, so stale caches from older versions can be recognized

mod generation;
mod storage;

pub use generation::{CacheGeneration, CacheKind};
pub use storage::{CacheStorage, CachedResponse, MemoryStorage, SqliteStorage};
