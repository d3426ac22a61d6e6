//! Task module - the job record, its state machine and its storage.
//!
//! - `task`: record types and lifecycle enums
//! - `state`: pure transition function (status + billing decision)
//! - `store`: persisted records with conditional (compare-and-swap) updates
//! - `redact`: payload stripping before persistence

pub mod redact;
pub mod state;
pub mod store;
pub mod task;

pub use redact::redact_payload;
pub use state::{apply_poll, expire, PollResult, Transition};
pub use store::{CommitOutcome, StoreError, TaskStore};
pub use task::{Task, TaskAction, TaskDto, TaskPrivateData, TaskProperties, TaskStatus};
