//! Orchestration backends
//!
//! A backend creates and destroys service instances, reports what is
//! currently deployed and runs health probes. The planner only talks to it
//! through [`Backend`].

pub mod local;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use crate::error::Result;
use crate::project::{Service, ServiceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use local::LocalBackend;
#[cfg(any(test, feature = "testing"))]
pub use memory::{BackendCall, MemoryBackend, ScriptedProbe};

/// A deployed service instance as reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedService {
    /// Service name
    pub name: String,
    /// Backend instance ID
    pub instance_id: String,
    /// Hash of the service definition the instance was created from
    pub spec_hash: String,
    /// Services this instance depended on when it was created
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Image the instance runs
    pub image: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ObservedService {
    /// Describe a freshly created instance of `service`
    pub fn from_service(project: &str, service: &Service, spec_hash: &str) -> Self {
        Self {
            name: service.name.clone(),
            instance_id: Uuid::new_v4().to_string().replace('-', "")[..12].to_string(),
            spec_hash: spec_hash.to_string(),
            depends_on: service.depends_on.iter().map(|e| e.to.clone()).collect(),
            image: image_reference(project, service),
            created_at: Utc::now(),
        }
    }
}

/// Image a service runs; built services are tagged after the project
pub fn image_reference(project: &str, service: &Service) -> String {
    match &service.source {
        ServiceSource::Image(image) | ServiceSource::Conflicting { image, .. } => image.clone(),
        ServiceSource::Build(_) | ServiceSource::Unspecified => {
            format!("{}-{}:latest", project, service.name)
        }
    }
}

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

/// Orchestration backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Everything currently deployed for a project
    async fn inspect(&self, project: &str) -> Result<Vec<ObservedService>>;

    /// Create and start an instance of a service
    async fn create(&self, project: &str, service: &Service, spec_hash: &str)
        -> Result<ObservedService>;

    /// Stop and remove the instance of a service
    async fn destroy(&self, project: &str, service: &str) -> Result<()>;

    /// Run the service's health probe once
    async fn probe(&self, project: &str, service: &Service) -> Result<ProbeOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::BuildSpec;

    #[test]
    fn test_image_reference() {
        let built = Service::new("api", ServiceSource::Build(BuildSpec::new(".")));
        assert_eq!(image_reference("shop", &built), "shop-api:latest");

        let pulled = Service::new("db", ServiceSource::Image("postgres:16".to_string()));
        let observed = ObservedService::from_service("shop", &pulled, "abc");
        assert_eq!(observed.image, "postgres:16");
        assert_eq!(observed.instance_id.len(), 12);
    }
}
