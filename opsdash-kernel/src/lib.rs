//! OpsDash kernel: operational state core for an agent-management backend.
//!
//! Reads go through a coalescing TTL cache in front of the backend CLI;
//! triage, operator events and the audit trail are persisted as JSON under
//! the data directory; fix operations run in background tasks and are polled.

pub mod aggregator;
pub mod audit;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fix_ops;
pub mod health;
pub mod http;
pub mod identity;
pub mod ops_core;
pub mod rate_limit;
pub mod review;
pub mod signals;
pub mod state;
pub mod summary;
pub mod tasks;
pub mod triage;

pub use crate::error::{OpsError, OpsResult};
pub use crate::ops_core::OpsCore;
