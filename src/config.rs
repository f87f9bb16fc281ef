//! Planner configuration
//!
//! Loaded from an optional YAML file, then overridden by command-line flags.

use crate::compose::duration::parse_duration;
use crate::compose::env::{load_env_file, EnvMap};
use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default global apply timeout
pub const DEFAULT_APPLY_TIMEOUT: &str = "5m";

/// Planner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Reject unknown descriptor keys instead of warning
    pub strict: bool,
    /// Global deadline for `apply`, compose duration syntax
    pub apply_timeout: String,
    /// Where the local backend keeps deployed state
    pub state_dir: PathBuf,
    /// Env files used for interpolation
    pub env_files: Vec<PathBuf>,
    /// Project name override
    pub project_name: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            strict: false,
            apply_timeout: DEFAULT_APPLY_TIMEOUT.to_string(),
            state_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("rune-deploy"),
            env_files: Vec::new(),
            project_name: None,
        }
    }
}

impl PlannerConfig {
    /// Read a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| DeployError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.apply_timeout()?;
        Ok(config)
    }

    /// Parsed apply timeout
    pub fn apply_timeout(&self) -> Result<Duration> {
        parse_duration(&self.apply_timeout).ok_or_else(|| {
            DeployError::InvalidConfig(format!("invalid apply timeout '{}'", self.apply_timeout))
        })
    }

    /// Variables for descriptor interpolation
    ///
    /// Env files are read in order, later files winning. Without configured
    /// files, `.env` in the project directory is used when present. The
    /// process environment overrides both.
    pub fn interpolation_env(&self, project_dir: &Path) -> Result<EnvMap> {
        let mut env = EnvMap::new();

        if self.env_files.is_empty() {
            let default = project_dir.join(".env");
            if default.is_file() {
                env.extend(load_env_file(&default)?);
            }
        } else {
            for path in &self.env_files {
                env.extend(load_env_file(path)?);
            }
        }

        env.extend(std::env::vars());
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PlannerConfig::default();
        assert!(!config.strict);
        assert_eq!(config.apply_timeout().unwrap(), Duration::from_secs(300));
        assert!(config.state_dir.ends_with("rune-deploy"));
    }

    #[test]
    fn test_load_partial_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rune-deploy.yaml");
        std::fs::write(&path, "strict: true\napply_timeout: 90s\n").unwrap();

        let config = PlannerConfig::load(&path).unwrap();
        assert!(config.strict);
        assert_eq!(config.apply_timeout().unwrap(), Duration::from_secs(90));
        assert!(config.env_files.is_empty());
    }

    #[test]
    fn test_load_rejects_bad_timeout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rune-deploy.yaml");
        std::fs::write(&path, "apply_timeout: soon\n").unwrap();

        assert!(matches!(
            PlannerConfig::load(&path),
            Err(DeployError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_interpolation_env_reads_dot_env() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "RUNE_DEPLOY_TEST_ONLY_VAR=from-file\n",
        )
        .unwrap();

        let env = PlannerConfig::default()
            .interpolation_env(temp.path())
            .unwrap();
        assert_eq!(env["RUNE_DEPLOY_TEST_ONLY_VAR"], "from-file");
    }
}
