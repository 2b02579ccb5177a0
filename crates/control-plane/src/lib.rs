//! NoETL Control Plane Library
//!
//! This crate provides the server-side execution core for NoETL:
//!
//! - **Catalog**: Versioned, append-only storage of playbook YAML
//! - **Event Log**: Append-only partitioned event table; the source of truth
//!   for execution state
//! - **Job Queue**: Transactional lease/heartbeat/complete/fail queue that
//!   workers drain
//! - **Broker**: Idempotent evaluator that advances executions on every
//!   completion event
//! - **Keychain**: Per-execution credential resolution and TTL'd caching
//!
//! ## Architecture
//!
//! The control plane follows an event-sourcing architecture where all state
//! is derived from events stored in PostgreSQL. Workers are external: they
//! long-poll the queue, execute actions, and post completion events back.
//! The server itself is stateless between requests, so any number of
//! replicas may run concurrently; idempotency comes from the queue's unique
//! `(execution_id, node_id)` constraint and event-log dedup checks, not from
//! locks.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Database connectivity, models, and queries
//! - [`engine`]: Broker evaluation, transitions, and loop orchestration
//! - [`error`]: Custom error types with Axum integration
//! - [`handlers`]: HTTP route handlers
//! - [`services`]: Business logic between handlers and queries
//! - [`state`]: Shared application state

pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod playbook;
pub mod sanitize;
pub mod services;
pub mod snowflake;
pub mod state;
pub mod template;

pub use error::{AppError, AppResult};
