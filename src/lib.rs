// ABOUTME: Library root for pg-failover
// ABOUTME: Exposes the failover components, admin adapters and CLI command handlers

pub mod admin;
pub mod commands;
pub mod config;
pub mod error;
pub mod failover;
pub mod health;
pub mod pgbouncer;
pub mod postgres;
pub mod proxy;
pub mod replication;
pub mod sequences;
pub mod utils;

pub use config::FailoverConfig;
pub use error::{FailoverError, Result};
pub use failover::{FailoverOrchestrator, FailoverPlan, FailoverRun, RunOptions, RunOutcome};
