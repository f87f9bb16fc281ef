//! Per-service startup states and the transition log

use crate::project::{DependencyCondition, HealthStatus};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Startup state of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Waiting for dependencies
    Pending,
    /// Being created by the backend
    Starting,
    /// Started, waiting for a passing probe
    Probing,
    /// Started and has no probe
    Running,
    Healthy,
    /// Probe failed `retries` times in a row
    Unhealthy,
    /// Global timeout passed before the probe passed
    TimedOut,
    /// A dependency failed; `by` is the service where the failure started
    Blocked { by: String },
    /// Backend refused to create the service
    Failed { reason: String },
    Cancelled,
}

impl ServiceState {
    /// No further transitions follow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::Running
                | ServiceState::Healthy
                | ServiceState::Unhealthy
                | ServiceState::TimedOut
                | ServiceState::Blocked { .. }
                | ServiceState::Failed { .. }
                | ServiceState::Cancelled
        )
    }

    /// Terminal and not a success
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && !matches!(self, ServiceState::Running | ServiceState::Healthy)
    }

    /// Whether a dependent waiting on `condition` may start
    pub fn satisfies(&self, condition: DependencyCondition) -> bool {
        match condition {
            DependencyCondition::Started => matches!(
                self,
                ServiceState::Starting
                    | ServiceState::Probing
                    | ServiceState::Running
                    | ServiceState::Healthy
            ),
            DependencyCondition::Healthy => matches!(self, ServiceState::Healthy),
        }
    }

    /// Probe-derived health
    pub fn health(&self) -> HealthStatus {
        match self {
            ServiceState::Probing => HealthStatus::Starting,
            ServiceState::Healthy => HealthStatus::Healthy,
            ServiceState::Unhealthy | ServiceState::TimedOut => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Probing => write!(f, "probing"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Unhealthy => write!(f, "unhealthy"),
            ServiceState::TimedOut => write!(f, "timed out"),
            ServiceState::Blocked { by } => write!(f, "blocked by {}", by),
            ServiceState::Failed { reason } => write!(f, "failed: {}", reason),
            ServiceState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Position in the log
    pub seq: u64,
    pub service: String,
    pub state: ServiceState,
    pub at: DateTime<Utc>,
}

/// Shared, append-only record of state changes
///
/// Timestamps strictly increase in log order, so "entered after" holds for
/// both `seq` and `at` even when the clock does not advance between records.
#[derive(Debug, Clone, Default)]
pub struct TransitionLog {
    entries: Arc<Mutex<Vec<Transition>>>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition
    pub fn record(&self, service: &str, state: &ServiceState) -> Transition {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Utc::now();
        let at = match entries.last() {
            Some(last) if now <= last.at => last.at + chrono::Duration::microseconds(1),
            _ => now,
        };

        let transition = Transition {
            seq: entries.len() as u64,
            service: service.to_string(),
            state: state.clone(),
            at,
        };
        entries.push(transition.clone());
        transition
    }

    /// Copy of every transition so far
    pub fn snapshot(&self) -> Vec<Transition> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies() {
        assert!(ServiceState::Starting.satisfies(DependencyCondition::Started));
        assert!(ServiceState::Running.satisfies(DependencyCondition::Started));
        assert!(!ServiceState::Pending.satisfies(DependencyCondition::Started));
        assert!(!ServiceState::Probing.satisfies(DependencyCondition::Healthy));
        assert!(!ServiceState::Running.satisfies(DependencyCondition::Healthy));
        assert!(ServiceState::Healthy.satisfies(DependencyCondition::Healthy));
    }

    #[test]
    fn test_health() {
        assert_eq!(ServiceState::Probing.health(), HealthStatus::Starting);
        assert_eq!(ServiceState::TimedOut.health(), HealthStatus::Unhealthy);
        assert_eq!(ServiceState::Running.health(), HealthStatus::Unknown);
    }

    #[test]
    fn test_failure_states() {
        assert!(!ServiceState::Healthy.is_failure());
        assert!(!ServiceState::Running.is_failure());
        assert!(!ServiceState::Probing.is_failure());
        assert!(ServiceState::TimedOut.is_failure());
        assert!(ServiceState::Blocked { by: "db".to_string() }.is_failure());
        assert_eq!(
            ServiceState::Blocked { by: "db".to_string() }.to_string(),
            "blocked by db"
        );
    }

    #[test]
    fn test_log_timestamps_strictly_increase() {
        let log = TransitionLog::new();
        for i in 0..100 {
            log.record(&format!("s{}", i % 3), &ServiceState::Pending);
        }
        let entries = log.snapshot();
        for pair in entries.windows(2) {
            assert!(pair[0].at < pair[1].at);
            assert_eq!(pair[0].seq + 1, pair[1].seq);
        }
    }
}
