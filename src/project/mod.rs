//! Typed service graph
//!
//! A [`Project`] is built once from a descriptor, validated, and then used
//! unchanged for one planning or apply pass.

pub mod graph;
pub mod service;
pub mod validate;

pub use graph::DependencyGraph;
pub use service::{
    BuildSpec, DependencyCondition, DependencyEdge, HealthProbe, HealthStatus, MountSource,
    Network, NetworkDriver, PortMapping, ProbeCommand, Project, Protocol, Service, ServiceSource,
    Volume, VolumeMount, DEFAULT_NETWORK,
};
pub use validate::{ValidationError, ValidationKind, ValidationReport, Validator};
