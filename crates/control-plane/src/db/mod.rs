//! Database module for the NoETL Control Plane server.
//!
//! Provides database connectivity, models, queries, and schema management
//! for PostgreSQL using SQLx.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, DbPool};
