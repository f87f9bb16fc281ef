//! Compose descriptor handling
//!
//! Reads compose-style YAML into a [`crate::project::Project`] and drives a
//! project against a backend.

pub mod config;
pub mod duration;
pub mod env;
pub mod orchestrator;
pub mod parser;

pub use env::{load_env_file, EnvMap};
pub use orchestrator::{ApplyReport, ComposeOrchestrator, DestroyFailure, DownReport};
pub use parser::DescriptorParser;
