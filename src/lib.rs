//! rune-deploy - a declarative multi-service deployment planner
//!
//! rune-deploy reads compose-style descriptors and brings a set of services
//! up in dependency order:
//!
//! - Descriptor parsing with env-file interpolation and multi-file merging
//! - Validation that reports every problem at once
//! - Dependency graphs with cycle detection and stable ordering
//! - Health-gated, concurrent startup with timeouts and cancellation
//! - Reconciliation of desired and deployed state by content hash

pub mod backend;
pub mod compose;
pub mod config;
pub mod error;
pub mod project;
pub mod reconcile;
pub mod scheduler;

pub use error::{DeployError, Result};
