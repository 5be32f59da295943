//! Assist host: per-group run queue and sandboxed agent runner.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod queue;
pub mod runner;
pub mod store;
