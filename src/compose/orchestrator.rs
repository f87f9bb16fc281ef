//! Compose project orchestrator
//!
//! Ties a validated [`Project`] to a [`Backend`]: plans against what is
//! deployed, tears down removed services and hands the rest to the
//! health-gated [`Scheduler`].

use crate::backend::{Backend, ObservedService};
use crate::error::{DeployError, Result};
use crate::project::{DependencyGraph, Project, Validator};
use crate::reconcile::{ActionKind, Plan, Reconciler};
use crate::scheduler::{ScheduleReport, Scheduler, StartMode, DEFAULT_TIMEOUT};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A destroy that failed or was held back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyFailure {
    pub service: String,
    pub reason: String,
    /// Still-deployed dependent that kept this service from being destroyed
    pub blocked_by: Option<String>,
}

/// Outcome of `up`
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub plan: Plan,
    /// Services destroyed because they left the descriptor
    pub destroyed: Vec<String>,
    pub destroy_failures: Vec<DestroyFailure>,
    pub schedule: ScheduleReport,
}

impl ApplyReport {
    /// Services the backend changed: destroys first, then in declaration order
    pub fn applied(&self) -> Vec<String> {
        self.destroyed
            .iter()
            .cloned()
            .chain(
                self.schedule
                    .outcomes
                    .iter()
                    .filter(|o| o.applied.is_some())
                    .map(|o| o.name.clone()),
            )
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.destroy_failures.is_empty() && self.schedule.succeeded()
    }

    /// 0 when every service ended healthy or running, 2 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            2
        }
    }
}

/// Outcome of `down`
#[derive(Debug, Clone)]
pub struct DownReport {
    pub plan: Plan,
    pub destroyed: Vec<String>,
    pub failures: Vec<DestroyFailure>,
}

/// Compose orchestrator
pub struct ComposeOrchestrator {
    project: Project,
    graph: DependencyGraph,
    backend: Arc<dyn Backend>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ComposeOrchestrator {
    /// Validate a project and bind it to a backend
    ///
    /// Fails before touching the backend when the project is invalid or
    /// cyclic.
    pub fn new(project: Project, backend: Arc<dyn Backend>) -> Result<Self> {
        Validator::validate(&project).into_result()?;
        let graph = DependencyGraph::from_project(&project);
        graph.check_acyclic()?;

        Ok(Self {
            project,
            graph,
            backend,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        })
    }

    /// Global deadline for `up`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Diff the project against the backend
    ///
    /// An unreachable backend is treated as an empty deployment, so every
    /// service plans as a create.
    pub async fn plan(&self) -> Result<Plan> {
        let observed = match self.backend.inspect(&self.project.name).await {
            Ok(observed) => observed,
            Err(DeployError::BackendUnavailable(reason)) => {
                tracing::warn!(
                    "Backend {} unavailable ({}), planning against an empty deployment",
                    self.backend.name(),
                    reason
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Reconciler::plan(&self.project, &self.graph, &observed)
    }

    /// Bring the deployment in line with the project
    pub async fn up(&self) -> Result<ApplyReport> {
        tracing::info!(
            "Applying project {} with the {} backend",
            self.project.name,
            self.backend.name()
        );

        let observed = self.backend.inspect(&self.project.name).await?;
        let plan = Reconciler::plan(&self.project, &self.graph, &observed)?;
        let (destroyed, destroy_failures) = self.destroy_all(&plan, &observed).await;

        let modes: HashMap<String, StartMode> = plan
            .actions
            .iter()
            .filter_map(|a| {
                let mode = match a.kind {
                    ActionKind::Create => StartMode::Create,
                    ActionKind::Recreate => StartMode::Recreate,
                    ActionKind::NoOp => StartMode::Keep,
                    ActionKind::Destroy => return None,
                };
                Some((a.service.clone(), mode))
            })
            .collect();

        let schedule = Scheduler::new(self.backend.clone())
            .with_timeout(self.timeout)
            .with_cancellation(self.cancel.clone())
            .run(&self.project, &self.graph, &modes)
            .await?;

        Ok(ApplyReport {
            plan,
            destroyed,
            destroy_failures,
            schedule,
        })
    }

    /// Destroy everything deployed for the project
    pub async fn down(&self) -> Result<DownReport> {
        tracing::info!("Tearing down project {}", self.project.name);

        let observed = self.backend.inspect(&self.project.name).await?;
        let plan = Reconciler::teardown(&self.project.name, &observed);
        let (destroyed, failures) = self.destroy_all(&plan, &observed).await;

        Ok(DownReport {
            plan,
            destroyed,
            failures,
        })
    }

    /// What is deployed right now
    pub async fn status(&self) -> Result<Vec<ObservedService>> {
        self.backend.inspect(&self.project.name).await
    }

    /// Run the destroys of a plan in order, collecting failures
    ///
    /// Dependents come first, so once a destroy fails everything the failed
    /// service depends on is left in place.
    async fn destroy_all(
        &self,
        plan: &Plan,
        observed: &[ObservedService],
    ) -> (Vec<String>, Vec<DestroyFailure>) {
        let recorded: HashMap<&str, &[String]> = observed
            .iter()
            .map(|o| (o.name.as_str(), o.depends_on.as_slice()))
            .collect();
        let mut destroyed = Vec::new();
        let mut failures = Vec::new();
        let mut left_behind: HashSet<&str> = HashSet::new();

        for action in plan.of_kind(ActionKind::Destroy) {
            let service = action.service.as_str();

            let dependent = plan
                .of_kind(ActionKind::Destroy)
                .map(|a| a.service.as_str())
                .filter(|name| left_behind.contains(name))
                .find(|name| {
                    recorded
                        .get(name)
                        .is_some_and(|deps| deps.iter().any(|d| d == service))
                });
            if let Some(dependent) = dependent {
                tracing::warn!(
                    "Keeping service {}: {} still depends on it",
                    service,
                    dependent
                );
                failures.push(DestroyFailure {
                    service: service.to_string(),
                    reason: format!("still required by '{}'", dependent),
                    blocked_by: Some(dependent.to_string()),
                });
                left_behind.insert(service);
                continue;
            }

            if self.cancel.is_cancelled() {
                failures.push(DestroyFailure {
                    service: service.to_string(),
                    reason: DeployError::Cancelled.to_string(),
                    blocked_by: None,
                });
                left_behind.insert(service);
                continue;
            }

            match self.backend.destroy(&self.project.name, service).await {
                Ok(()) => {
                    tracing::info!("Destroyed service {}", service);
                    destroyed.push(service.to_string());
                }
                Err(e) => {
                    tracing::warn!("Failed to destroy service {}: {}", service, e);
                    failures.push(DestroyFailure {
                        service: service.to_string(),
                        reason: e.to_string(),
                        blocked_by: None,
                    });
                    left_behind.insert(service);
                }
            }
        }

        (destroyed, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, MemoryBackend, ScriptedProbe};
    use crate::compose::parser::DescriptorParser;
    use crate::project::ValidationKind;
    use crate::scheduler::ServiceState;

    const STACK: &str = r#"
name: shop
services:
  web:
    image: nginx
    depends_on:
      - api
  api:
    image: node
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1s
      retries: 3
"#;

    fn orchestrator(yaml: &str, backend: &Arc<MemoryBackend>) -> ComposeOrchestrator {
        let project = DescriptorParser::new().parse_str(yaml).unwrap();
        ComposeOrchestrator::new(project, backend.clone()).unwrap()
    }

    #[test]
    fn test_invalid_project_rejected_before_backend() {
        let yaml = r#"
services:
  a:
    image: nginx
    ports: ["5432:5432"]
  b:
    image: postgres
    ports: ["5432:5432"]
"#;
        let project = DescriptorParser::new().parse_str(yaml).unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let Err(DeployError::Validation(report)) = ComposeOrchestrator::new(project, backend.clone())
        else {
            panic!("expected validation error");
        };
        let conflicts = report.of_kind(ValidationKind::PortConflict);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].detail.contains("'a'") && conflicts[0].detail.contains("'b'"));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
services:
  a:
    image: nginx
    depends_on: [b]
  b:
    image: nginx
    depends_on: [a]
"#;
        let project = DescriptorParser::new().parse_str(yaml).unwrap();
        let result = ComposeOrchestrator::new(project, Arc::new(MemoryBackend::new()));
        assert!(matches!(result, Err(DeployError::CyclicDependency { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_then_reapply_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let orchestrator = orchestrator(STACK, &backend);

        let report = orchestrator.up().await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.applied(), vec!["web", "api", "db"]);
        assert_eq!(report.schedule.state("db"), Some(&ServiceState::Healthy));

        let plan = orchestrator.plan().await.unwrap();
        assert!(plan.is_converged());

        let again = orchestrator.up().await.unwrap();
        assert!(again.applied().is_empty());
        assert_eq!(again.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_exit_code() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script_probe("db", vec![ScriptedProbe::Fail]);
        let report = orchestrator(STACK, &backend).up().await.unwrap();

        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.schedule.state("db"), Some(&ServiceState::Unhealthy));
        assert_eq!(
            report.schedule.state("web"),
            Some(&ServiceState::Blocked {
                by: "db".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_service_destroyed_first() {
        let backend = Arc::new(MemoryBackend::new());
        orchestrator(STACK, &backend).up().await.unwrap();

        let trimmed = r#"
name: shop
services:
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1s
      retries: 3
"#;
        let before = backend.calls().len();
        let report = orchestrator(trimmed, &backend).up().await.unwrap();
        assert_eq!(report.destroyed, vec!["web", "api"]);
        assert_eq!(report.exit_code(), 0);

        let calls = backend.calls()[before..].to_vec();
        assert_eq!(calls[0], BackendCall::Inspect);
        assert_eq!(calls[1], BackendCall::Destroy("web".to_string()));
        assert_eq!(calls[2], BackendCall::Destroy("api".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_failure_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        orchestrator(STACK, &backend).up().await.unwrap();
        backend.fail_destroy("web");

        let report = orchestrator(STACK, &backend).down().await.unwrap();
        assert!(report.destroyed.is_empty());

        let failed: Vec<(&str, Option<&str>)> = report
            .failures
            .iter()
            .map(|f| (f.service.as_str(), f.blocked_by.as_deref()))
            .collect();
        assert_eq!(
            failed,
            vec![("web", None), ("api", Some("web")), ("db", Some("api"))]
        );
        assert_eq!(backend.inspect("shop").await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_failure_spares_only_its_dependencies() {
        let backend = Arc::new(MemoryBackend::new());
        let stack = format!("{}  cache:\n    image: redis\n", STACK);
        orchestrator(&stack, &backend).up().await.unwrap();
        backend.fail_destroy("api");

        let report = orchestrator(&stack, &backend).down().await.unwrap();
        let mut destroyed = report.destroyed.clone();
        destroyed.sort();
        assert_eq!(destroyed, vec!["cache", "web"]);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[1].service, "db");
        assert_eq!(report.failures[1].blocked_by.as_deref(), Some("api"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_empties_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let orchestrator = orchestrator(STACK, &backend);
        orchestrator.up().await.unwrap();

        let report = orchestrator.down().await.unwrap();
        assert_eq!(report.destroyed, vec!["web", "api", "db"]);
        assert!(orchestrator.status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_unavailable_fails_up_but_not_plan() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unavailable(true);
        let orchestrator = orchestrator(STACK, &backend);

        let plan = orchestrator.plan().await.unwrap();
        let creates: Vec<&str> = plan
            .of_kind(ActionKind::Create)
            .map(|a| a.service.as_str())
            .collect();
        assert_eq!(creates, vec!["db", "api", "web"]);
        assert_eq!(plan.actions.len(), 3);

        let result = orchestrator.up().await;
        assert!(matches!(result, Err(DeployError::BackendUnavailable(_))));
    }
}
