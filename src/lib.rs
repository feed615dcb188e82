#![deny(missing_docs)]
//! # segkv
//! A small distributed system in two parts: an append-only, segmented
//! key-value store behind an HTTP surface, and a least-connections HTTP
//! load balancer with background health probing.
//!
//! The store keeps one writable "active" segment file and any number of
//! sealed, read-only predecessors; an in-memory index maps each key to
//! the location of its latest record, and a background compactor
//! periodically collapses the sealed segments into one. Reads run in
//! parallel under a read lock; all writes are serialized through a
//! single writer thread.

pub use balancer::{select_least_loaded, Balancer, BalancerConfig, Upstream};
pub use config::StoreConfig;
pub use error::{KvError, Result};
pub use record::{DataType, Record, Value};
pub use server::DbServer;
pub use store::Store;
pub use thread_pool::{NaiveThreadPool, RayonThreadPool, SharedQueueThreadPool, ThreadPool};

pub mod balancer;
pub mod config;
mod error;
pub mod http;
mod index;
pub mod record;
mod segment;
mod server;
mod store;
pub mod thread_pool;
