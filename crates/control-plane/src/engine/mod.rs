//! Workflow execution engine.
//!
//! The broker is modeled as a pure function over the playbook and the
//! execution's event history, producing a list of decisions (events to
//! emit, jobs to enqueue, child executions to start, finalization). A thin
//! async driver commits the decisions transactionally. This keeps the
//! evaluation logic testable without any I/O.

pub mod broker;
pub mod context;
pub mod loops;
pub mod transition;

pub use broker::{Broker, BrokerDecision, ExecutionSnapshot};
pub use context::{build_context, EvalContext};
