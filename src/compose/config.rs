//! Raw descriptor shapes
//!
//! Serde targets for one service or top-level entry as written in YAML.
//! Unknown keys are checked against the key lists below before these are
//! deserialized; [`super::parser::DescriptorParser`] turns them into the
//! typed [`crate::project::Project`].

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Keys accepted at the top level of a descriptor
#[rustfmt::skip]
pub const TOP_LEVEL_KEYS: &[&str] = &[
    "version", "name", "services", "networks", "volumes", "secrets", "configs",
];

/// Keys accepted inside a service
///
/// Only the first block feeds the plan. The rest are valid compose fields
/// that strict mode must not reject even though nothing reads them.
#[rustfmt::skip]
pub const SERVICE_KEYS: &[&str] = &[
    "image", "build", "command", "entrypoint", "container_name", "environment", "env_file",
    "ports", "volumes", "networks", "depends_on", "healthcheck", "labels", "restart",
    "working_dir", "user",
    // accepted, not planned
    "annotations", "attach", "blkio_config", "cap_add", "cap_drop", "cgroup", "cgroup_parent",
    "configs", "cpu_count", "cpu_percent", "cpu_period", "cpu_quota", "cpu_rt_period",
    "cpu_rt_runtime", "cpu_shares", "cpus", "cpuset", "credential_spec", "deploy", "develop",
    "device_cgroup_rules", "devices", "dns", "dns_opt", "dns_search", "domainname", "expose",
    "extends", "external_links", "extra_hosts", "group_add", "hostname", "init", "ipc",
    "isolation", "links", "logging", "mac_address", "mem_limit", "mem_reservation",
    "mem_swappiness", "memswap_limit", "network_mode", "oom_kill_disable", "oom_score_adj",
    "pid", "pids_limit", "platform", "privileged", "profiles", "pull_policy", "read_only",
    "runtime", "scale", "secrets", "security_opt", "shm_size", "stdin_open", "stop_grace_period",
    "stop_signal", "storage_opt", "sysctls", "tmpfs", "tty", "ulimits", "userns_mode", "uts",
    "volumes_from",
];

#[rustfmt::skip]
pub const BUILD_KEYS: &[&str] = &[
    "context", "dockerfile", "args", "target",
    // accepted, not planned
    "additional_contexts", "cache_from", "cache_to", "dockerfile_inline", "extra_hosts",
    "isolation", "labels", "network", "no_cache", "platforms", "privileged", "pull", "secrets",
    "shm_size", "ssh", "tags", "ulimits",
];

#[rustfmt::skip]
pub const HEALTHCHECK_KEYS: &[&str] = &[
    "test", "interval", "timeout", "retries", "start_period", "start_interval", "disable",
];

#[rustfmt::skip]
pub const PORT_KEYS: &[&str] = &[
    "target", "published", "host_ip", "protocol", "mode", "name", "app_protocol",
];

#[rustfmt::skip]
pub const MOUNT_KEYS: &[&str] = &[
    "type", "source", "target", "read_only", "bind", "volume", "tmpfs", "consistency",
];

pub const DEPENDS_ON_KEYS: &[&str] = &["condition", "restart", "required"];

#[rustfmt::skip]
pub const NETWORK_KEYS: &[&str] = &[
    "driver", "driver_opts", "external", "internal", "name", "attachable", "enable_ipv6",
    "ipam", "labels",
];

pub const VOLUME_KEYS: &[&str] = &["driver", "driver_opts", "external", "name", "labels"];

/// One entry under `services:`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub image: Option<String>,
    pub build: Option<BuildConfig>,
    pub command: Option<CommandConfig>,
    pub entrypoint: Option<CommandConfig>,
    pub container_name: Option<String>,
    /// Inline variables; these win over `env_file`
    pub environment: Option<EnvironmentConfig>,
    pub env_file: Option<EnvFileConfig>,
    pub ports: Option<Vec<PortConfig>>,
    pub volumes: Option<Vec<VolumeMountConfig>>,
    pub networks: Option<NetworksConfig>,
    pub depends_on: Option<DependsOnConfig>,
    pub healthcheck: Option<HealthcheckConfig>,
    pub labels: Option<LabelsConfig>,
    pub restart: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

/// `build: ./dir` or `build: {context, dockerfile, ...}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    Simple(String),
    Full(BuildConfigFull),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildConfigFull {
    /// Defaults to the descriptor directory
    pub context: Option<String>,
    pub dockerfile: Option<String>,
    pub args: Option<BTreeMap<String, Value>>,
    pub target: Option<String>,
}

/// `command` and `entrypoint`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Run through `/bin/sh -c`
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// `KEY=value` items; a bare `KEY` is looked up in the interpolation env
    Array(Vec<String>),
    /// Scalar values, `null` meaning "take from the interpolation env"
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    Single(String),
    Multiple(Vec<String>),
}

/// A `ports` item
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Container port only, nothing published
    Number(u32),
    /// `[IP:]HOST:CONTAINER[/proto]`, ranges allowed
    Short(String),
    Long(PortConfigLong),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortConfigLong {
    pub target: u32,
    /// Number or numeric string
    #[serde(default)]
    pub published: Option<Value>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    /// Accepted and ignored
    #[serde(default)]
    pub mode: Option<String>,
}

/// A `volumes` item of a service
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VolumeMountConfig {
    /// `SOURCE:TARGET[:ro|rw]` or just `TARGET`
    Short(String),
    Long(VolumeMountLong),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeMountLong {
    /// `volume`, `bind` or `tmpfs`
    #[serde(rename = "type", default)]
    pub mount_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    Array(Vec<String>),
    /// Per-network settings (aliases and such) are not modelled
    Map(BTreeMap<String, Option<Value>>),
}

/// `depends_on` as a list or as a map keeping declaration order
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    Array(Vec<String>),
    Map(Mapping),
}

/// Long form of one `depends_on` entry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DependsOnCondition {
    pub condition: Option<String>,
    pub restart: Option<bool>,
    pub required: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    pub test: Option<HealthcheckTest>,
    /// Durations use compose syntax, e.g. `1m30s`
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
    pub disable: Option<bool>,
}

/// `test: "cmd"` or `test: ["CMD" | "CMD-SHELL" | "NONE", ...]`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    Command(String),
    Array(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, Value>),
}

/// One entry under top-level `networks:`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub driver: Option<String>,
    pub driver_opts: Option<BTreeMap<String, Value>>,
    pub external: Option<ExternalConfig>,
    pub internal: Option<bool>,
    pub name: Option<String>,
}

/// One entry under top-level `volumes:`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub driver: Option<String>,
    pub driver_opts: Option<BTreeMap<String, Value>>,
    pub external: Option<ExternalConfig>,
    pub name: Option<String>,
}

/// `external: true` or the legacy `external: {name: ...}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    Flag(bool),
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Flag(external) => *external,
            ExternalConfig::Named { .. } => true,
        }
    }
}
