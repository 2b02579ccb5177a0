//! HTTP handlers for the NoETL Control Plane API.
//!
//! Handlers are organized by domain; each sub-router carries its service
//! as Axum state.

pub mod catalog;
pub mod credentials;
pub mod database;
pub mod events;
pub mod execute;
pub mod executions;
pub mod health;
pub mod keychain;
pub mod queue;

pub use events::EventsState;
pub use execute::ExecuteState;
