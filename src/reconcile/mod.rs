//! Desired versus observed state diffing

pub mod hash;

pub use hash::spec_hash;

use crate::backend::ObservedService;
use crate::error::Result;
use crate::project::{DependencyCondition, DependencyGraph, Project};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// What to do with one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Recreate,
    NoOp,
    Destroy,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Recreate => write!(f, "recreate"),
            ActionKind::NoOp => write!(f, "unchanged"),
            ActionKind::Destroy => write!(f, "destroy"),
        }
    }
}

/// A planned action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub service: String,
    /// Hash of the desired spec, absent for destroys
    pub desired_hash: Option<String>,
    /// Hash of the deployed instance, absent for creates
    pub observed_hash: Option<String>,
}

/// Ordered list of actions
///
/// Destroys come first in reverse dependency order of what is deployed,
/// then every desired service in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub project: String,
    pub actions: Vec<Action>,
}

impl Plan {
    /// Action planned for a service
    pub fn action_for(&self, service: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.service == service)
    }

    /// Actions of one kind, in plan order
    pub fn of_kind(&self, kind: ActionKind) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(move |a| a.kind == kind)
    }

    /// Whether nothing needs to change
    pub fn is_converged(&self) -> bool {
        self.actions.iter().all(|a| a.kind == ActionKind::NoOp)
    }

    /// Number of actions that change something
    pub fn change_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.kind != ActionKind::NoOp)
            .count()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan for project {}:", self.project)?;
        if self.actions.is_empty() {
            return writeln!(f, "  nothing to do");
        }
        for (i, action) in self.actions.iter().enumerate() {
            write!(f, "  {:>2}. {:<10} {}", i + 1, action.kind.to_string(), action.service)?;
            if let Some(hash) = &action.desired_hash {
                write!(f, " ({})", &hash[..hash.len().min(12)])?;
            }
            writeln!(f)?;
        }
        write!(f, "{} to change", self.change_count())
    }
}

/// Computes plans
pub struct Reconciler;

impl Reconciler {
    /// Diff a project against what the backend reports
    pub fn plan(
        project: &Project,
        graph: &DependencyGraph,
        observed: &[ObservedService],
    ) -> Result<Plan> {
        let order = graph.topological_order()?;
        let desired: HashSet<&str> = project.services.iter().map(|s| s.name.as_str()).collect();

        let removed: Vec<&ObservedService> = observed
            .iter()
            .filter(|o| !desired.contains(o.name.as_str()))
            .collect();
        let mut actions = Self::destroy_actions(observed, &removed);

        let deployed: HashMap<&str, &ObservedService> =
            observed.iter().map(|o| (o.name.as_str(), o)).collect();

        for name in &order {
            let Some(service) = project.service(name) else {
                continue;
            };
            let hash = spec_hash(service);
            let (kind, observed_hash) = match deployed.get(name.as_str()) {
                None => (ActionKind::Create, None),
                Some(o) if o.spec_hash == hash => (ActionKind::NoOp, Some(o.spec_hash.clone())),
                Some(o) => (ActionKind::Recreate, Some(o.spec_hash.clone())),
            };
            actions.push(Action {
                kind,
                service: name.clone(),
                desired_hash: Some(hash),
                observed_hash,
            });
        }

        tracing::debug!(
            "Planned {} actions for {}, {} changes",
            actions.len(),
            project.name,
            actions.iter().filter(|a| a.kind != ActionKind::NoOp).count()
        );

        Ok(Plan {
            project: project.name.clone(),
            actions,
        })
    }

    /// Destroy everything deployed for a project
    pub fn teardown(project: &str, observed: &[ObservedService]) -> Plan {
        let all: Vec<&ObservedService> = observed.iter().collect();
        Plan {
            project: project.to_string(),
            actions: Self::destroy_actions(observed, &all),
        }
    }

    /// Destroys ordered dependents first, using the dependencies recorded
    /// on the deployed instances
    fn destroy_actions(observed: &[ObservedService], removed: &[&ObservedService]) -> Vec<Action> {
        if removed.is_empty() {
            return Vec::new();
        }

        let mut graph = DependencyGraph::new();
        for o in observed {
            graph.add_node(&o.name);
        }
        for o in observed {
            for dep in &o.depends_on {
                graph.add_edge(&o.name, dep, DependencyCondition::Started);
            }
        }

        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("Deployed state has inconsistent dependencies: {}", e);
                observed.iter().map(|o| o.name.clone()).collect()
            }
        };

        let removed: HashMap<&str, &ObservedService> =
            removed.iter().map(|o| (o.name.as_str(), *o)).collect();

        order
            .iter()
            .rev()
            .filter_map(|name| removed.get(name.as_str()))
            .map(|o| Action {
                kind: ActionKind::Destroy,
                service: o.name.clone(),
                desired_hash: None,
                observed_hash: Some(o.spec_hash.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Service, ServiceSource};
    use chrono::Utc;

    fn image(name: &str) -> Service {
        Service::new(name, ServiceSource::Image(format!("{}:latest", name)))
    }

    fn deployed(service: &Service) -> ObservedService {
        ObservedService::from_service("shop", service, &spec_hash(service))
    }

    fn project(services: Vec<Service>) -> (Project, DependencyGraph) {
        let mut project = Project::new("shop");
        project.services = services;
        let graph = DependencyGraph::from_project(&project);
        (project, graph)
    }

    fn stack() -> Vec<Service> {
        vec![
            image("web").depends_on("api", DependencyCondition::Started),
            image("api").depends_on("db", DependencyCondition::Healthy),
            image("db"),
        ]
    }

    #[test]
    fn test_fresh_project_creates_in_dependency_order() {
        let (project, graph) = project(stack());
        let plan = Reconciler::plan(&project, &graph, &[]).unwrap();

        let order: Vec<(&str, ActionKind)> = plan
            .actions
            .iter()
            .map(|a| (a.service.as_str(), a.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("db", ActionKind::Create),
                ("api", ActionKind::Create),
                ("web", ActionKind::Create),
            ]
        );
    }

    #[test]
    fn test_no_drift_is_all_noop() {
        let (project, graph) = project(stack());
        let observed: Vec<ObservedService> = project.services.iter().map(deployed).collect();

        let plan = Reconciler::plan(&project, &graph, &observed).unwrap();
        assert!(plan.is_converged());
        assert_eq!(plan.actions.len(), 3);
        assert_eq!(plan.change_count(), 0);
    }

    #[test]
    fn test_changed_service_is_recreated() {
        let (project, graph) = project(stack());
        let mut observed: Vec<ObservedService> = project.services.iter().map(deployed).collect();
        observed[2].spec_hash = "stale".to_string();

        let plan = Reconciler::plan(&project, &graph, &observed).unwrap();
        let db = plan.action_for("db").unwrap();
        assert_eq!(db.kind, ActionKind::Recreate);
        assert_eq!(db.observed_hash.as_deref(), Some("stale"));
        assert_eq!(plan.change_count(), 1);
    }

    #[test]
    fn test_removed_service_destroyed_after_dependents() {
        let (old, _) = project(stack());
        let observed: Vec<ObservedService> = old.services.iter().map(deployed).collect();

        // api goes away; web is rewritten to no longer need it
        let (new, graph) = project(vec![image("web"), image("db")]);
        let plan = Reconciler::plan(&new, &graph, &observed).unwrap();

        let destroys: Vec<&str> = plan
            .of_kind(ActionKind::Destroy)
            .map(|a| a.service.as_str())
            .collect();
        assert_eq!(destroys, vec!["api"]);
        assert_eq!(plan.actions[0].kind, ActionKind::Destroy);
        assert_eq!(plan.action_for("web").unwrap().kind, ActionKind::Recreate);
        assert_eq!(plan.action_for("db").unwrap().kind, ActionKind::NoOp);
    }

    #[test]
    fn test_teardown_reverses_dependency_order() {
        let (old, _) = project(stack());
        let observed: Vec<ObservedService> = old.services.iter().map(deployed).collect();

        let plan = Reconciler::teardown("shop", &observed);
        let order: Vec<&str> = plan.actions.iter().map(|a| a.service.as_str()).collect();
        assert_eq!(order, vec!["web", "api", "db"]);
        assert!(plan.actions.iter().all(|a| a.kind == ActionKind::Destroy));
    }

    #[test]
    fn test_teardown_tolerates_unknown_recorded_dependencies() {
        let orphan = ObservedService {
            name: "worker".to_string(),
            instance_id: "abc".to_string(),
            spec_hash: "h".to_string(),
            depends_on: vec!["gone".to_string()],
            image: "worker".to_string(),
            created_at: Utc::now(),
        };
        let plan = Reconciler::teardown("shop", &[orphan]);
        assert_eq!(plan.actions.len(), 1);
    }

    #[test]
    fn test_plan_display() {
        let (project, graph) = project(vec![image("db")]);
        let plan = Reconciler::plan(&project, &graph, &[]).unwrap();
        let text = plan.to_string();
        assert!(text.contains("Plan for project shop"));
        assert!(text.contains("create"));
        assert!(text.ends_with("1 to change"));
    }
}
