//! # taskgate
//!
//! A billing gateway for asynchronous media-generation jobs.
//!
//! Clients submit video jobs with an API token; the gateway prices the
//! request, reserves quota, forwards it to an upstream provider and records
//! a task. Tasks are then reconciled against the provider, both by a
//! background sweeper and on demand when a client fetches them. Every
//! terminal transition settles or refunds the reservation exactly once.
//!
//! ## Task Flow
//! 1. Resolve channel, model mapping and price; check the balance
//! 2. Submit upstream; persist the task and debit the reservation together
//! 3. Poll and normalize the provider status
//! 4. Commit the transition and its billing effect with a conditional update
//!
//! ## Modules
//! - `account`: users, API tokens and upstream channels
//! - `billing`: model mapping, pricing and the quota ledger
//! - `provider`: per-vendor adaptors behind the `TaskAdaptor` trait
//! - `task`: task records, the state machine and task storage
//! - `relay`: submission, reconciliation and the sweeper
//! - `api`: HTTP routes

pub mod account;
pub mod api;
pub mod billing;
pub mod config;
pub mod error;
pub mod provider;
pub mod relay;
pub mod storage;
pub mod task;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
