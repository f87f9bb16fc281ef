//! Local backend
//!
//! Keeps the deployed state of each project in a JSON file under the state
//! directory and runs health probes as host commands.

use super::{Backend, ObservedService, ProbeOutcome};
use crate::error::{DeployError, Result};
use crate::project::{ProbeCommand, Service};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;

/// On-disk state of one project
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    project: String,
    updated_at: DateTime<Utc>,
    services: BTreeMap<String, ObservedService>,
}

impl StateFile {
    fn empty(project: &str) -> Self {
        Self {
            project: project.to_string(),
            updated_at: Utc::now(),
            services: BTreeMap::new(),
        }
    }
}

/// File-backed backend
pub struct LocalBackend {
    state_dir: PathBuf,
    /// Serializes read-modify-write cycles on state files
    write_lock: Mutex<()>,
}

impl LocalBackend {
    /// Backend over `state_dir`
    ///
    /// Nothing touches the disk until the first call; the directory is only
    /// created on the first write.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// State directory
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self, project: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", project))
    }

    async fn load(&self, project: &str) -> Result<StateFile> {
        let path = self.state_path(project);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DeployError::BackendUnavailable(format!(
                    "corrupt state file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::empty(project)),
            Err(e) => Err(DeployError::BackendUnavailable(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save(&self, state: &mut StateFile) -> Result<()> {
        state.updated_at = Utc::now();
        let path = self.state_path(&state.project);
        let tmp = path.with_extension("json.tmp");

        fs::create_dir_all(&self.state_dir).await.map_err(|e| {
            DeployError::BackendUnavailable(format!(
                "cannot create state directory {}: {}",
                self.state_dir.display(),
                e
            ))
        })?;

        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, &path).await?;

        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn inspect(&self, project: &str) -> Result<Vec<ObservedService>> {
        let state = self.load(project).await?;
        Ok(state.services.into_values().collect())
    }

    async fn create(
        &self,
        project: &str,
        service: &Service,
        spec_hash: &str,
    ) -> Result<ObservedService> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load(project).await?;

        let observed = ObservedService::from_service(project, service, spec_hash);
        state.services.insert(service.name.clone(), observed.clone());
        self.save(&mut state).await?;

        tracing::debug!(
            "Recorded {} instance {} of {}",
            service.name,
            observed.instance_id,
            observed.image
        );
        Ok(observed)
    }

    async fn destroy(&self, project: &str, service: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load(project).await?;

        if state.services.remove(service).is_none() {
            return Err(DeployError::ServiceNotFound(service.to_string()));
        }
        if state.services.is_empty() {
            let path = self.state_path(project);
            if let Err(e) = fs::remove_file(&path).await {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
            return Ok(());
        }
        self.save(&mut state).await
    }

    async fn probe(&self, _project: &str, service: &Service) -> Result<ProbeOutcome> {
        let probe = service
            .healthcheck
            .as_ref()
            .ok_or_else(|| DeployError::ProbeFailure {
                service: service.name.clone(),
                reason: "service has no healthcheck".to_string(),
            })?;

        let mut cmd = match &probe.test {
            ProbeCommand::Exec(args) => {
                let (program, rest) = args.split_first().ok_or_else(|| DeployError::ProbeFailure {
                    service: service.name.clone(),
                    reason: "empty probe command".to_string(),
                })?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
            ProbeCommand::Shell(script) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(script);
                cmd
            }
        };

        let status = cmd
            .envs(&service.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| DeployError::ProbeFailure {
                service: service.name.clone(),
                reason: format!("failed to run {}: {}", probe.test, e),
            })?;

        if status.success() {
            Ok(ProbeOutcome::Healthy)
        } else {
            Ok(ProbeOutcome::Unhealthy(format!("{} exited with {}", probe.test, status)))
        }
    }
}
