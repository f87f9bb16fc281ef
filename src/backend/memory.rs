//! In-memory backend with scripted probe results

use super::{Backend, ObservedService, ProbeOutcome};
use crate::error::{DeployError, Result};
use crate::project::Service;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Scripted result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedProbe {
    Pass,
    Fail,
    /// Never completes
    Hang,
}

/// A call made against the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Inspect,
    Create(String),
    Destroy(String),
    Probe(String),
}

#[derive(Debug, Default)]
struct ProbeScript {
    queue: VecDeque<ScriptedProbe>,
    last: Option<ScriptedProbe>,
}

impl ProbeScript {
    fn next(&mut self) -> ScriptedProbe {
        if let Some(step) = self.queue.pop_front() {
            self.last = Some(step.clone());
            return step;
        }
        self.last.clone().unwrap_or(ScriptedProbe::Pass)
    }
}

/// Backend that keeps everything in memory
///
/// Probes pass unless scripted otherwise. Once a script runs out its last
/// step repeats.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    projects: Mutex<HashMap<String, BTreeMap<String, ObservedService>>>,
    scripts: Mutex<HashMap<String, ProbeScript>>,
    failing_creates: Mutex<HashSet<String>>,
    failing_destroys: Mutex<HashSet<String>>,
    calls: Mutex<Vec<BackendCall>>,
    unavailable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the probe results of a service
    pub fn script_probe(&self, service: &str, steps: Vec<ScriptedProbe>) {
        lock(&self.scripts).insert(
            service.to_string(),
            ProbeScript {
                queue: steps.into(),
                last: None,
            },
        );
    }

    /// Make `create` fail for a service
    pub fn fail_create(&self, service: &str) {
        lock(&self.failing_creates).insert(service.to_string());
    }

    /// Make `destroy` fail for a service
    pub fn fail_destroy(&self, service: &str) {
        lock(&self.failing_destroys).insert(service.to_string());
    }

    /// Toggle availability; an unavailable backend fails every call
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed an already deployed instance
    pub fn seed(&self, project: &str, observed: ObservedService) {
        lock(&self.projects)
            .entry(project.to_string())
            .or_default()
            .insert(observed.name.clone(), observed);
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Number of probes run against a service
    pub fn probe_count(&self, service: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackendCall::Probe(name) if name == service))
            .count()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        lock(&self.calls).push(call);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeployError::BackendUnavailable(
                "memory backend is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn inspect(&self, project: &str) -> Result<Vec<ObservedService>> {
        self.record(BackendCall::Inspect)?;
        Ok(lock(&self.projects)
            .get(project)
            .map(|services| services.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(
        &self,
        project: &str,
        service: &Service,
        spec_hash: &str,
    ) -> Result<ObservedService> {
        self.record(BackendCall::Create(service.name.clone()))?;
        if lock(&self.failing_creates).contains(&service.name) {
            return Err(DeployError::BackendUnavailable(format!(
                "failed to create {}",
                service.name
            )));
        }

        let observed = ObservedService::from_service(project, service, spec_hash);
        self.seed(project, observed.clone());
        Ok(observed)
    }

    async fn destroy(&self, project: &str, service: &str) -> Result<()> {
        self.record(BackendCall::Destroy(service.to_string()))?;
        if lock(&self.failing_destroys).contains(service) {
            return Err(DeployError::BackendUnavailable(format!(
                "failed to destroy {}",
                service
            )));
        }

        lock(&self.projects)
            .get_mut(project)
            .and_then(|services| services.remove(service))
            .map(|_| ())
            .ok_or_else(|| DeployError::ServiceNotFound(service.to_string()))
    }

    async fn probe(&self, _project: &str, service: &Service) -> Result<ProbeOutcome> {
        self.record(BackendCall::Probe(service.name.clone()))?;
        let step = lock(&self.scripts)
            .entry(service.name.clone())
            .or_default()
            .next();

        match step {
            ScriptedProbe::Pass => Ok(ProbeOutcome::Healthy),
            ScriptedProbe::Fail => Ok(ProbeOutcome::Unhealthy("scripted failure".to_string())),
            ScriptedProbe::Hang => {
                std::future::pending::<()>().await;
                Ok(ProbeOutcome::Healthy)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ServiceSource;

    #[tokio::test]
    async fn test_script_repeats_last_step() {
        let backend = MemoryBackend::new();
        let db = Service::new("db", ServiceSource::Image("postgres".to_string()));
        backend.script_probe("db", vec![ScriptedProbe::Fail, ScriptedProbe::Pass]);

        assert!(matches!(
            backend.probe("p", &db).await.unwrap(),
            ProbeOutcome::Unhealthy(_)
        ));
        assert_eq!(backend.probe("p", &db).await.unwrap(), ProbeOutcome::Healthy);
        assert_eq!(backend.probe("p", &db).await.unwrap(), ProbeOutcome::Healthy);
        assert_eq!(backend.probe_count("db"), 3);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        assert!(matches!(
            backend.inspect("p").await,
            Err(DeployError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_destroy() {
        let backend = MemoryBackend::new();
        let db = Service::new("db", ServiceSource::Image("postgres".to_string()));

        backend.create("p", &db, "h").await.unwrap();
        assert_eq!(backend.inspect("p").await.unwrap()[0].spec_hash, "h");

        backend.destroy("p", "db").await.unwrap();
        assert!(backend.inspect("p").await.unwrap().is_empty());
        assert!(backend.destroy("p", "db").await.is_err());
    }
}
