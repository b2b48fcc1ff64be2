//! reelforge-db: persistence for media, encode profiles, job records,
//! chunk groups and trim requests.
//!
//! SQLite-backed storage with connection pooling, embedded migrations,
//! typed models, and one query module per entity.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
