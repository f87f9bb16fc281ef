//! Health-gated startup scheduling
//!
//! Every service gets its own task. A task waits until each dependency
//! reaches the state its edge condition asks for, asks the backend to create
//! the service, then probes it until it passes, fails `retries` times in a
//! row or the global deadline passes. Tasks publish their state on a
//! `watch` channel that dependents subscribe to.

pub mod state;

pub use state::{ServiceState, Transition, TransitionLog};

use crate::backend::{Backend, ProbeOutcome};
use crate::error::{DeployError, ErrorKind, Result};
use crate::project::{DependencyCondition, DependencyGraph, HealthProbe, Project, Service};
use crate::reconcile::spec_hash;
use futures::future::{join_all, select_all};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Global apply timeout used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// What the scheduler asks the backend to do before probing a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Create,
    /// Destroy the deployed instance, then create
    Recreate,
    /// Leave the deployed instance alone
    Keep,
}

/// A failed probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeError {
    /// `ProbeFailure`, `ProbeTimeout`, or the backend's own error kind
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&DeployError> for ProbeError {
    fn from(e: &DeployError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Final state of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub name: String,
    pub state: ServiceState,
    /// Backend action that completed, if any
    pub applied: Option<StartMode>,
    /// Most recent failed probe, kept for services that never passed
    pub last_probe_error: Option<ProbeError>,
}

/// Result of a scheduling pass
#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    /// Outcomes in declaration order
    pub outcomes: Vec<ServiceOutcome>,
    pub transitions: Vec<Transition>,
}

impl ScheduleReport {
    pub fn outcome(&self, service: &str) -> Option<&ServiceOutcome> {
        self.outcomes.iter().find(|o| o.name == service)
    }

    pub fn state(&self, service: &str) -> Option<&ServiceState> {
        self.outcome(service).map(|o| &o.state)
    }

    /// Services that did not end Healthy or Running
    pub fn failures(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.outcomes.iter().filter(|o| !is_success(&o.state))
    }

    pub fn succeeded(&self) -> bool {
        self.failures().next().is_none()
    }

    /// First time `service` entered `state`
    pub fn entered(&self, service: &str, state: &ServiceState) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.service == service && &t.state == state)
    }
}

fn is_success(state: &ServiceState) -> bool {
    matches!(state, ServiceState::Healthy | ServiceState::Running)
}

/// Runs the startup of a project
pub struct Scheduler {
    backend: Arc<dyn Backend>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Deadline for the whole pass, measured from `run`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start every service of `project`
    ///
    /// Services missing from `modes` are created.
    pub async fn run(
        &self,
        project: &Project,
        graph: &DependencyGraph,
        modes: &HashMap<String, StartMode>,
    ) -> Result<ScheduleReport> {
        graph.check_acyclic()?;

        let deadline = Instant::now() + self.timeout;
        let log = TransitionLog::new();

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for service in &project.services {
            let (tx, rx) = watch::channel(ServiceState::Pending);
            log.record(&service.name, &ServiceState::Pending);
            senders.insert(service.name.clone(), tx);
            receivers.insert(service.name.clone(), rx);
        }

        info!(
            "Starting {} services of {} (timeout {:?})",
            project.services.len(),
            project.name,
            self.timeout
        );

        let mut names = Vec::with_capacity(project.services.len());
        let mut tasks = Vec::with_capacity(project.services.len());
        for service in &project.services {
            let Some(state) = senders.remove(&service.name) else {
                continue;
            };
            let dependencies = graph
                .dependencies(&service.name)
                .into_iter()
                .filter_map(|(name, condition)| {
                    receivers.get(&name).map(|rx| Dependency {
                        name,
                        condition,
                        state: rx.clone(),
                    })
                })
                .collect();

            let unit = StartupUnit {
                project: project.name.clone(),
                service: service.clone(),
                mode: modes.get(&service.name).copied().unwrap_or(StartMode::Create),
                dependencies,
                state,
                log: log.clone(),
                backend: self.backend.clone(),
                cancel: self.cancel.child_token(),
                deadline,
            };

            names.push(service.name.clone());
            tasks.push(tokio::spawn(unit.run()));
        }

        let results = join_all(tasks).await;

        let mut outcomes = Vec::with_capacity(names.len());
        for (name, result) in names.into_iter().zip(results) {
            let mut state = receivers
                .get(&name)
                .map(|rx| rx.borrow().clone())
                .unwrap_or(ServiceState::Pending);
            let finished = match result {
                Ok(finished) => finished,
                Err(e) => {
                    tracing::error!("Startup task for {} failed: {}", name, e);
                    if !state.is_terminal() {
                        state = ServiceState::Failed {
                            reason: e.to_string(),
                        };
                    }
                    Finished::default()
                }
            };
            outcomes.push(ServiceOutcome {
                name,
                state,
                applied: finished.applied,
                last_probe_error: finished.last_probe_error,
            });
        }

        Ok(ScheduleReport {
            outcomes,
            transitions: log.snapshot(),
        })
    }
}

struct Dependency {
    name: String,
    condition: DependencyCondition,
    state: watch::Receiver<ServiceState>,
}

enum Gate {
    Ready,
    Blocked(String),
    Cancelled,
}

/// Wait until every dependency satisfies its condition, or one of them
/// can no longer do so
async fn wait_for_dependencies(deps: &mut [Dependency], cancel: &CancellationToken) -> Gate {
    loop {
        let mut ready = true;
        for dep in deps.iter_mut() {
            let state = dep.state.borrow_and_update().clone();
            if state.satisfies(dep.condition) {
                continue;
            }
            let closed = dep.state.has_changed().is_err();
            match state {
                ServiceState::Cancelled => return Gate::Cancelled,
                ServiceState::Blocked { by } => return Gate::Blocked(by),
                s if s.is_terminal() || closed => return Gate::Blocked(dep.name.clone()),
                _ => ready = false,
            }
        }
        if ready {
            return Gate::Ready;
        }

        // closed channels hold final states and never change again
        let changes: Vec<_> = deps
            .iter_mut()
            .filter(|d| d.state.has_changed().is_ok())
            .map(|d| Box::pin(d.state.changed()))
            .collect();

        tokio::select! {
            _ = cancel.cancelled() => return Gate::Cancelled,
            _ = select_all(changes) => {}
        }
    }
}

/// What a startup task hands back
#[derive(Default)]
struct Finished {
    applied: Option<StartMode>,
    last_probe_error: Option<ProbeError>,
}

/// Startup of a single service
struct StartupUnit {
    project: String,
    service: Service,
    mode: StartMode,
    dependencies: Vec<Dependency>,
    state: watch::Sender<ServiceState>,
    log: TransitionLog,
    backend: Arc<dyn Backend>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl StartupUnit {
    fn set(&self, state: ServiceState) {
        if state.is_failure() {
            warn!("Service {} {}", self.service.name, state);
        } else if state.is_terminal() {
            info!("Service {} {}", self.service.name, state);
        } else {
            debug!("Service {} {}", self.service.name, state);
        }
        self.log.record(&self.service.name, &state);
        self.state.send_replace(state);
    }

    async fn run(mut self) -> Finished {
        let mut dependencies = std::mem::take(&mut self.dependencies);
        match wait_for_dependencies(&mut dependencies, &self.cancel).await {
            Gate::Ready => {}
            Gate::Blocked(by) => {
                self.set(ServiceState::Blocked { by });
                return Finished::default();
            }
            Gate::Cancelled => {
                self.set(ServiceState::Cancelled);
                return Finished::default();
            }
        }
        if self.cancel.is_cancelled() {
            self.set(ServiceState::Cancelled);
            return Finished::default();
        }

        self.set(ServiceState::Starting);
        let applied = match self.apply().await {
            Ok(applied) => applied,
            Err(e) => {
                self.set(ServiceState::Failed {
                    reason: e.to_string(),
                });
                return Finished::default();
            }
        };

        let (settled, last_probe_error) = match self.service.healthcheck.clone() {
            None => (ServiceState::Running, None),
            Some(probe) => {
                self.set(ServiceState::Probing);
                self.probe_until_settled(&probe).await
            }
        };
        self.set(settled);
        Finished {
            applied,
            last_probe_error,
        }
    }

    async fn apply(&self) -> Result<Option<StartMode>> {
        let name = &self.service.name;
        match self.mode {
            StartMode::Keep => {
                debug!("Service {} is up to date", name);
                Ok(None)
            }
            StartMode::Create => {
                self.backend
                    .create(&self.project, &self.service, &spec_hash(&self.service))
                    .await?;
                Ok(Some(StartMode::Create))
            }
            StartMode::Recreate => {
                match self.backend.destroy(&self.project, name).await {
                    Ok(()) | Err(DeployError::ServiceNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.backend
                    .create(&self.project, &self.service, &spec_hash(&self.service))
                    .await?;
                Ok(Some(StartMode::Recreate))
            }
        }
    }

    /// Probe until the service settles; the error is the last failed probe
    async fn probe_until_settled(
        &self,
        probe: &HealthProbe,
    ) -> (ServiceState, Option<ProbeError>) {
        let name = &self.service.name;
        let started = Instant::now();
        let mut failures = 0;
        let mut last_error = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return (ServiceState::Cancelled, last_error),
                _ = sleep_until(self.deadline) => return (ServiceState::TimedOut, last_error),
                _ = sleep(probe.interval) => {}
            }

            let result =
                match timeout(probe.timeout, self.backend.probe(&self.project, &self.service)).await
                {
                    Ok(Ok(ProbeOutcome::Healthy)) => Ok(()),
                    Ok(Ok(ProbeOutcome::Unhealthy(reason))) => Err(DeployError::ProbeFailure {
                        service: name.clone(),
                        reason,
                    }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DeployError::ProbeTimeout {
                        service: name.clone(),
                        timeout: probe.timeout,
                    }),
                };

            match result {
                Ok(()) => return (ServiceState::Healthy, None),
                Err(e) if started.elapsed() < probe.start_period => {
                    debug!("{} (start period)", e);
                    last_error = Some(ProbeError::from(&e));
                }
                Err(e) => {
                    failures += 1;
                    debug!("{} ({}/{})", e, failures, probe.retries);
                    last_error = Some(ProbeError::from(&e));
                    if failures >= probe.retries {
                        return (ServiceState::Unhealthy, last_error);
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return (ServiceState::Cancelled, last_error);
            }
            if Instant::now() >= self.deadline {
                return (ServiceState::TimedOut, last_error);
            }
        }
    }
}
