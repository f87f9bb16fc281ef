//! Compose descriptor parser

use super::config::{
    BuildConfig, CommandConfig, DependsOnCondition, DependsOnConfig, EnvFileConfig,
    EnvironmentConfig, HealthcheckConfig, HealthcheckTest, LabelsConfig, NetworkConfig,
    NetworksConfig, PortConfig, ServiceConfig, VolumeConfig, VolumeMountConfig, BUILD_KEYS,
    DEPENDS_ON_KEYS, HEALTHCHECK_KEYS, MOUNT_KEYS, NETWORK_KEYS, PORT_KEYS, SERVICE_KEYS,
    TOP_LEVEL_KEYS, VOLUME_KEYS,
};
use super::duration::parse_duration;
use super::env::{interpolate_value, load_env_file, EnvMap};
use crate::error::{DeployError, Result};
use crate::project::{
    BuildSpec, DependencyCondition, DependencyEdge, HealthProbe, MountSource, Network,
    NetworkDriver, PortMapping, ProbeCommand, Project, Protocol, Service, ServiceSource, Volume,
    VolumeMount,
};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Sections whose entries are merged by name across files
const MERGED_SECTIONS: &[&str] = &["services", "networks", "volumes"];

fn malformed(msg: impl Into<String>) -> DeployError {
    DeployError::MalformedDescriptor(msg.into())
}

/// Descriptor parser
///
/// In strict mode unrecognised keys fail with [`DeployError::UnknownField`];
/// otherwise they are logged and ignored. Keys starting with `x-` are
/// extension fields and always accepted.
#[derive(Debug, Clone, Default)]
pub struct DescriptorParser {
    strict: bool,
    env: EnvMap,
    project_name: Option<String>,
}

impl DescriptorParser {
    /// Create a lenient parser with an empty interpolation environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject unknown fields
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Variables used for interpolation and for valueless environment entries
    pub fn with_env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self
    }

    /// Override the project name
    pub fn project_name(mut self, name: Option<String>) -> Self {
        self.project_name = name;
        self
    }

    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Parse compose file from path
    pub fn parse_file(&self, path: &Path) -> Result<Project> {
        self.parse_files(&[path.to_path_buf()])
    }

    /// Parse several compose files, later files overriding earlier ones
    pub fn parse_files(&self, paths: &[PathBuf]) -> Result<Project> {
        let first = paths
            .first()
            .ok_or_else(|| malformed("no compose file given"))?;
        let base_dir = match first.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let value = self.load_value(paths)?;
        let default_name = base_dir
            .canonicalize()
            .unwrap_or_else(|_| base_dir.clone())
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_string();

        self.build_project(value, &base_dir, &default_name)
    }

    /// Parse compose content; relative paths resolve against the current directory
    pub fn parse_str(&self, content: &str) -> Result<Project> {
        let mut value = Self::parse_yaml(content, "<string>")?;
        interpolate_value(&mut value, &self.env)?;
        self.build_project(value, Path::new("."), "default")
    }

    /// Read, merge and interpolate descriptor files into one YAML tree
    pub fn load_value(&self, paths: &[PathBuf]) -> Result<Value> {
        let mut merged = Value::Mapping(Mapping::new());

        for path in paths {
            let content = std::fs::read_to_string(path).map_err(|e| {
                malformed(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let value = Self::parse_yaml(&content, &path.display().to_string())?;
            merged = Self::merge_values(merged, value);
        }

        interpolate_value(&mut merged, &self.env)?;
        Ok(merged)
    }

    fn parse_yaml(content: &str, origin: &str) -> Result<Value> {
        let mut value: Value = serde_yaml::from_str(content)
            .map_err(|e| malformed(format!("{}: Failed to parse YAML: {}", origin, e)))?;
        // resolve `<<: *anchor` merge keys
        value
            .apply_merge()
            .map_err(|e| malformed(format!("{}: {}", origin, e)))?;
        match value {
            Value::Null => Ok(Value::Mapping(Mapping::new())),
            Value::Mapping(_) => Ok(value),
            _ => Err(malformed(format!("{}: top level must be a mapping", origin))),
        }
    }

    /// Merge two descriptor trees
    ///
    /// Services, networks and volumes merge by name with overlay keys winning
    /// inside each entry; any other top-level key is replaced by the overlay.
    pub fn merge_values(base: Value, overlay: Value) -> Value {
        let (Value::Mapping(mut base), Value::Mapping(overlay)) = (base, overlay) else {
            return Value::Null;
        };

        for (key, value) in overlay {
            let is_section = key.as_str().is_some_and(|k| MERGED_SECTIONS.contains(&k));
            if is_section {
                if let (Some(Value::Mapping(existing)), Value::Mapping(entries)) =
                    (base.get_mut(&key), &value)
                {
                    merge_entries(existing, entries);
                    continue;
                }
            }
            base.insert(key, value);
        }

        Value::Mapping(base)
    }

    fn check_keys(&self, location: &str, map: &Mapping, allowed: &[&str]) -> Result<()> {
        for key in map.keys() {
            let Some(key) = key.as_str() else {
                return Err(malformed(format!("{}: keys must be strings", location)));
            };
            if allowed.contains(&key) || key.starts_with("x-") {
                continue;
            }
            if self.strict {
                return Err(DeployError::UnknownField {
                    location: location.to_string(),
                    field: key.to_string(),
                });
            }
            tracing::warn!("Ignoring unknown field '{}' in {}", key, location);
        }
        Ok(())
    }

    fn check_nested(&self, location: &str, value: Option<&Value>, allowed: &[&str]) -> Result<()> {
        match value {
            Some(Value::Mapping(map)) => self.check_keys(location, map, allowed),
            Some(Value::Sequence(items)) => {
                for item in items {
                    if let Value::Mapping(map) = item {
                        self.check_keys(location, map, allowed)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn build_project(&self, value: Value, base_dir: &Path, default_name: &str) -> Result<Project> {
        let Value::Mapping(root) = value else {
            return Err(malformed("top level must be a mapping"));
        };
        self.check_keys("top level", &root, TOP_LEVEL_KEYS)?;

        let name = self
            .project_name
            .clone()
            .or_else(|| root.get("name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| default_name.to_string());
        let mut project = Project::new(&normalize_project_name(&name));

        for (name, value) in section(&root, "services")? {
            let location = format!("service '{}'", name);
            let Value::Mapping(map) = value else {
                return Err(malformed(format!("{} must be a mapping", location)));
            };
            self.check_keys(&location, map, SERVICE_KEYS)?;
            if let Some(Value::Mapping(_)) = map.get("build") {
                self.check_nested(&format!("{} build", location), map.get("build"), BUILD_KEYS)?;
            }
            self.check_nested(
                &format!("{} healthcheck", location),
                map.get("healthcheck"),
                HEALTHCHECK_KEYS,
            )?;
            self.check_nested(&format!("{} ports", location), map.get("ports"), PORT_KEYS)?;
            self.check_nested(&format!("{} volumes", location), map.get("volumes"), MOUNT_KEYS)?;

            let raw: ServiceConfig = serde_yaml::from_value(value.clone())
                .map_err(|e| malformed(format!("{}: {}", location, e)))?;
            let service = self.convert_service(&name, raw, base_dir)?;
            project.services.push(service);
        }

        for (name, value) in section(&root, "networks")? {
            let location = format!("network '{}'", name);
            let raw: NetworkConfig = self.entry(&location, value, NETWORK_KEYS)?;
            project.networks.insert(
                name.clone(),
                Network {
                    name,
                    driver: raw
                        .driver
                        .as_deref()
                        .map(NetworkDriver::from)
                        .unwrap_or_default(),
                    driver_opts: scalar_map(&location, raw.driver_opts)?,
                    external: raw.external.map(|e| e.is_external()).unwrap_or(false),
                    internal: raw.internal.unwrap_or(false),
                },
            );
        }

        for (name, value) in section(&root, "volumes")? {
            let location = format!("volume '{}'", name);
            let raw: VolumeConfig = self.entry(&location, value, VOLUME_KEYS)?;
            project.volumes.insert(
                name.clone(),
                Volume {
                    name,
                    driver: raw.driver,
                    driver_opts: scalar_map(&location, raw.driver_opts)?,
                    external: raw.external.map(|e| e.is_external()).unwrap_or(false),
                },
            );
        }

        tracing::debug!(
            "Parsed project {} with {} services, {} networks, {} volumes",
            project.name,
            project.services.len(),
            project.networks.len(),
            project.volumes.len()
        );

        Ok(project)
    }

    fn entry<T>(&self, location: &str, value: &Value, allowed: &[&str]) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        match value {
            Value::Null => Ok(T::default()),
            Value::Mapping(map) => {
                self.check_keys(location, map, allowed)?;
                serde_yaml::from_value(value.clone())
                    .map_err(|e| malformed(format!("{}: {}", location, e)))
            }
            _ => Err(malformed(format!("{} must be a mapping", location))),
        }
    }

    fn convert_service(&self, name: &str, raw: ServiceConfig, base_dir: &Path) -> Result<Service> {
        let location = format!("service '{}'", name);

        let build = match raw.build {
            None => None,
            Some(BuildConfig::Simple(context)) => Some(BuildSpec::new(&context)),
            Some(BuildConfig::Full(full)) => Some(BuildSpec {
                context: full.context.unwrap_or_else(|| ".".to_string()),
                dockerfile: full.dockerfile,
                args: self.optional_scalar_map(&location, full.args)?,
                target: full.target,
            }),
        };
        let source = match (raw.image, build) {
            (Some(image), Some(build)) => ServiceSource::Conflicting { image, build },
            (Some(image), None) => ServiceSource::Image(image),
            (None, Some(build)) => ServiceSource::Build(build),
            (None, None) => ServiceSource::Unspecified,
        };

        let mut service = Service::new(name, source);
        service.command = raw.command.map(|cmd| match cmd {
            CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s],
            CommandConfig::Exec(arr) => arr,
        });
        service.entrypoint = raw.entrypoint.map(|ep| match ep {
            CommandConfig::Shell(s) => vec![s],
            CommandConfig::Exec(arr) => arr,
        });
        service.container_name = raw.container_name;
        service.restart = raw.restart;
        service.working_dir = raw.working_dir;
        service.user = raw.user;

        let env_files = match raw.env_file {
            None => Vec::new(),
            Some(EnvFileConfig::Single(file)) => vec![file],
            Some(EnvFileConfig::Multiple(files)) => files,
        };
        for file in env_files {
            service.environment.extend(load_env_file(&base_dir.join(file))?);
        }
        match raw.environment {
            None => {}
            Some(EnvironmentConfig::Array(items)) => {
                for item in items {
                    match item.split_once('=') {
                        Some((key, value)) => {
                            service.environment.insert(key.to_string(), value.to_string());
                        }
                        None => {
                            if let Some(value) = self.env.get(&item) {
                                service.environment.insert(item, value.clone());
                            }
                        }
                    }
                }
            }
            Some(EnvironmentConfig::Map(map)) => {
                service
                    .environment
                    .extend(self.optional_scalar_map(&location, Some(map))?);
            }
        }

        for port in raw.ports.unwrap_or_default() {
            let mappings = match port {
                PortConfig::Number(container) => vec![PortMapping {
                    host_ip: None,
                    host: None,
                    container: port_number(&container.to_string())
                        .map_err(|e| malformed(format!("{}: {}", location, e)))?,
                    protocol: Protocol::Tcp,
                }],
                PortConfig::Short(spec) => parse_port_short(&spec)
                    .map_err(|e| malformed(format!("{}: port '{}': {}", location, spec, e)))?,
                PortConfig::Long(long) => {
                    let host = match long.published.as_ref().and_then(scalar_to_string) {
                        Some(p) if !p.is_empty() => Some(
                            port_number(&p).map_err(|e| malformed(format!("{}: {}", location, e)))?,
                        ),
                        _ => None,
                    };
                    vec![PortMapping {
                        host_ip: long.host_ip,
                        host,
                        container: port_number(&long.target.to_string())
                            .map_err(|e| malformed(format!("{}: {}", location, e)))?,
                        protocol: match long.protocol {
                            Some(p) => p
                                .parse()
                                .map_err(|e: String| malformed(format!("{}: {}", location, e)))?,
                            None => Protocol::Tcp,
                        },
                    }]
                }
            };
            service.ports.extend(mappings);
        }

        for mount in raw.volumes.unwrap_or_default() {
            let mount = match mount {
                VolumeMountConfig::Short(spec) => parse_mount_short(&spec)
                    .map_err(|e| malformed(format!("{}: volume '{}': {}", location, spec, e)))?,
                VolumeMountConfig::Long(long) => {
                    let source = match (long.mount_type.as_deref().unwrap_or("volume"), long.source) {
                        ("volume", Some(source)) => MountSource::Volume(source),
                        ("volume", None) | ("tmpfs", _) => MountSource::Anonymous,
                        ("bind", Some(source)) => MountSource::Bind(source),
                        (kind, _) => {
                            return Err(malformed(format!(
                                "{}: unsupported {} mount for target '{}'",
                                location, kind, long.target
                            )))
                        }
                    };
                    VolumeMount {
                        source,
                        target: long.target,
                        read_only: long.read_only.unwrap_or(false),
                    }
                }
            };
            service.volumes.push(mount);
        }

        service.networks = match raw.networks {
            None => BTreeSet::new(),
            Some(NetworksConfig::Array(names)) => names.into_iter().collect(),
            Some(NetworksConfig::Map(map)) => map.into_keys().collect(),
        };

        service.depends_on = self.dependencies(name, raw.depends_on)?;
        service.healthcheck = convert_healthcheck(&location, raw.healthcheck)?;

        service.labels = match raw.labels {
            None => BTreeMap::new(),
            Some(LabelsConfig::Array(items)) => items
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item, String::new()),
                })
                .collect(),
            Some(LabelsConfig::Map(map)) => self.optional_scalar_map(&location, Some(map))?,
        };

        Ok(service)
    }

    fn dependencies(&self, name: &str, raw: Option<DependsOnConfig>) -> Result<Vec<DependencyEdge>> {
        let location = format!("service '{}' depends_on", name);
        let edge = |to: String, condition| DependencyEdge {
            from: name.to_string(),
            to,
            condition,
        };

        match raw {
            None => Ok(Vec::new()),
            Some(DependsOnConfig::Array(targets)) => Ok(targets
                .into_iter()
                .map(|to| edge(to, DependencyCondition::Started))
                .collect()),
            Some(DependsOnConfig::Map(map)) => {
                let mut edges = Vec::with_capacity(map.len());
                for (target, value) in map {
                    let Some(target) = target.as_str().map(str::to_string) else {
                        return Err(malformed(format!("{}: keys must be strings", location)));
                    };
                    let entry_location = format!("{} '{}'", location, target);
                    let entry: DependsOnCondition = match value {
                        Value::Null => DependsOnCondition {
                            condition: None,
                            restart: None,
                            required: None,
                        },
                        Value::Mapping(ref map) => {
                            self.check_keys(&entry_location, map, DEPENDS_ON_KEYS)?;
                            serde_yaml::from_value(value.clone())
                                .map_err(|e| malformed(format!("{}: {}", entry_location, e)))?
                        }
                        _ => return Err(malformed(format!("{} must be a mapping", entry_location))),
                    };
                    let condition = match entry.condition {
                        None => DependencyCondition::Started,
                        Some(c) => c
                            .parse()
                            .map_err(|e: String| malformed(format!("{}: {}", entry_location, e)))?,
                    };
                    edges.push(edge(target, condition));
                }
                Ok(edges)
            }
        }
    }

    /// Scalars become strings; `null` entries are looked up in the environment
    fn optional_scalar_map(
        &self,
        location: &str,
        map: Option<BTreeMap<String, Value>>,
    ) -> Result<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        for (key, value) in map.unwrap_or_default() {
            if value.is_null() {
                if let Some(v) = self.env.get(&key) {
                    result.insert(key, v.clone());
                }
                continue;
            }
            let value = scalar_to_string(&value)
                .ok_or_else(|| malformed(format!("{}: value of '{}' must be a scalar", location, key)))?;
            result.insert(key, value);
        }
        Ok(result)
    }
}

fn merge_entries(existing: &mut Mapping, entries: &Mapping) {
    for (name, entry) in entries {
        if let (Some(Value::Mapping(fields)), Value::Mapping(overrides)) =
            (existing.get_mut(name), entry)
        {
            for (field, value) in overrides {
                fields.insert(field.clone(), value.clone());
            }
            continue;
        }
        existing.insert(name.clone(), entry.clone());
    }
}

/// Ordered `(name, value)` entries of a top-level section
fn section<'a>(root: &'a Mapping, key: &str) -> Result<Vec<(String, &'a Value)>> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Mapping(map)) => map
            .iter()
            .map(|(k, v)| {
                k.as_str()
                    .map(|name| (name.to_string(), v))
                    .ok_or_else(|| malformed(format!("{} names must be strings", key)))
            })
            .collect(),
        Some(_) => Err(malformed(format!("'{}' must be a mapping", key))),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_map(location: &str, map: Option<BTreeMap<String, Value>>) -> Result<BTreeMap<String, String>> {
    map.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            scalar_to_string(&v)
                .map(|s| (k.clone(), s))
                .ok_or_else(|| malformed(format!("{}: value of '{}' must be a scalar", location, k)))
        })
        .collect()
}

fn normalize_project_name(name: &str) -> String {
    let normalized: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if normalized.is_empty() {
        "default".to_string()
    } else {
        normalized
    }
}

fn port_number(s: &str) -> std::result::Result<u16, String> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| format!("invalid port number '{}'", s))
}

fn port_range(s: &str) -> std::result::Result<(u16, u16), String> {
    match s.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (port_number(start)?, port_number(end)?);
            if start > end {
                return Err(format!("invalid port range '{}'", s));
            }
            Ok((start, end))
        }
        None => {
            let port = port_number(s)?;
            Ok((port, port))
        }
    }
}

/// Parse `[IP:][HOST:]CONTAINER[/PROTOCOL]`, expanding ranges
fn parse_port_short(spec: &str) -> std::result::Result<Vec<PortMapping>, String> {
    let (body, protocol) = match spec.rsplit_once('/') {
        Some((body, proto)) => (body, proto.parse::<Protocol>()?),
        None => (spec, Protocol::Tcp),
    };

    let parts: Vec<&str> = body.rsplitn(3, ':').collect();
    let (host_ip, host, container) = match parts.as_slice() {
        [container] => (None, None, *container),
        [container, host] => (None, Some(*host), *container),
        [container, host, ip] => (
            Some(ip.trim_matches(|c| c == '[' || c == ']').to_string()),
            Some(*host).filter(|h| !h.is_empty()),
            *container,
        ),
        _ => return Err("empty port mapping".to_string()),
    };

    let (c_start, c_end) = port_range(container)?;
    let host_range = host.map(port_range).transpose()?;
    if let Some((h_start, h_end)) = host_range {
        if h_end - h_start != c_end - c_start {
            return Err("host and container port ranges differ in length".to_string());
        }
    }

    Ok((0..=(c_end - c_start))
        .map(|offset| PortMapping {
            host_ip: host_ip.clone(),
            host: host_range.map(|(h_start, _)| h_start + offset),
            container: c_start + offset,
            protocol,
        })
        .collect())
}

/// Parse `[SOURCE:]TARGET[:MODE]`
fn parse_mount_short(spec: &str) -> std::result::Result<VolumeMount, String> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [target] => (None, *target, ""),
        [source, target] => (Some(*source), *target, ""),
        [source, target, mode] => (Some(*source), *target, *mode),
        _ => return Err("empty mount".to_string()),
    };
    if target.is_empty() {
        return Err("mount target is empty".to_string());
    }

    let source = match source {
        None => MountSource::Anonymous,
        Some(s) if s.starts_with('.') || s.starts_with('/') || s.starts_with('~') => {
            MountSource::Bind(s.to_string())
        }
        Some(s) => MountSource::Volume(s.to_string()),
    };

    Ok(VolumeMount {
        source,
        target: target.to_string(),
        read_only: mode.split(',').any(|m| m == "ro"),
    })
}

fn convert_healthcheck(location: &str, raw: Option<HealthcheckConfig>) -> Result<Option<HealthProbe>> {
    let Some(raw) = raw else { return Ok(None) };
    if raw.disable.unwrap_or(false) {
        return Ok(None);
    }

    let test = match raw.test {
        None => return Err(malformed(format!("{}: healthcheck requires a test", location))),
        Some(HealthcheckTest::Command(cmd)) => ProbeCommand::Shell(cmd),
        Some(HealthcheckTest::Array(items)) => match items.split_first() {
            Some((first, _)) if first == "NONE" => return Ok(None),
            Some((first, rest)) if first == "CMD" => ProbeCommand::Exec(rest.to_vec()),
            Some((first, rest)) if first == "CMD-SHELL" => ProbeCommand::Shell(rest.join(" ")),
            Some(_) => ProbeCommand::Exec(items.clone()),
            None => return Err(malformed(format!("{}: healthcheck test is empty", location))),
        },
    };

    let duration = |field: &str, value: Option<String>, default: Duration| -> Result<Duration> {
        match value {
            None => Ok(default),
            Some(v) => parse_duration(&v).ok_or_else(|| {
                malformed(format!("{}: invalid healthcheck {} '{}'", location, field, v))
            }),
        }
    };

    Ok(Some(HealthProbe {
        test,
        interval: duration("interval", raw.interval, HealthProbe::DEFAULT_INTERVAL)?,
        timeout: duration("timeout", raw.timeout, HealthProbe::DEFAULT_TIMEOUT)?,
        retries: raw.retries.unwrap_or(HealthProbe::DEFAULT_RETRIES),
        start_period: duration("start_period", raw.start_period, Duration::ZERO)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STACK: &str = r#"
name: mem0
services:
  mem0:
    build: .
    ports:
      - "8888:8000"
    environment:
      PYTHONDONTWRITEBYTECODE: 1
      POSTGRES_HOST: postgres
    networks:
      - mem0_network
    depends_on:
      postgres:
        condition: service_healthy
      neo4j:
        condition: service_healthy
  postgres:
    image: ankane/pgvector:v0.5.1
    healthcheck:
      test: ["CMD", "pg_isready", "-q", "-d", "postgres", "-U", "postgres"]
      interval: 5s
      timeout: 5s
      retries: 5
    volumes:
      - postgres_db:/var/lib/postgresql/data
    ports:
      - "8432:5432"
    networks:
      - mem0_network
  neo4j:
    image: neo4j:5.26.4
    healthcheck:
      test: wget http://localhost:7687 || exit 1
      interval: 1s
      timeout: 10s
      retries: 20
      start_period: 90s
    ports:
      - "8474:7474"
      - "8687:7687"
    volumes:
      - neo4j_data:/data
    networks:
      - mem0_network
networks:
  mem0_network:
    driver: bridge
volumes:
  neo4j_data:
  postgres_db:
"#;

    #[test]
    fn test_parse_stack() {
        let project = DescriptorParser::new().parse_str(STACK).unwrap();

        assert_eq!(project.name, "mem0");
        assert_eq!(project.service_names(), vec!["mem0", "postgres", "neo4j"]);

        let app = project.service("mem0").unwrap();
        assert_eq!(app.source, ServiceSource::Build(BuildSpec::new(".")));
        assert_eq!(app.ports, vec![PortMapping::tcp(8888, 8000)]);
        assert_eq!(app.environment["PYTHONDONTWRITEBYTECODE"], "1");
        assert_eq!(
            app.depends_on,
            vec![
                DependencyEdge {
                    from: "mem0".to_string(),
                    to: "postgres".to_string(),
                    condition: DependencyCondition::Healthy,
                },
                DependencyEdge {
                    from: "mem0".to_string(),
                    to: "neo4j".to_string(),
                    condition: DependencyCondition::Healthy,
                },
            ]
        );

        let pg = project.service("postgres").unwrap().healthcheck.clone().unwrap();
        assert_eq!(
            pg.test,
            ProbeCommand::Exec(
                ["pg_isready", "-q", "-d", "postgres", "-U", "postgres"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            )
        );
        assert_eq!(pg.interval, Duration::from_secs(5));
        assert_eq!(pg.retries, 5);

        let neo = project.service("neo4j").unwrap();
        let probe = neo.healthcheck.as_ref().unwrap();
        assert!(matches!(probe.test, ProbeCommand::Shell(_)));
        assert_eq!(probe.start_period, Duration::from_secs(90));
        assert_eq!(
            neo.volumes[0].source,
            MountSource::Volume("neo4j_data".to_string())
        );

        assert_eq!(project.networks["mem0_network"].driver, NetworkDriver::Bridge);
        assert!(project.volumes.contains_key("postgres_db"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = DescriptorParser::new()
            .parse_str("services:\n  web: [unclosed")
            .unwrap_err();
        assert!(matches!(err, DeployError::MalformedDescriptor(_)));
    }

    #[test]
    fn test_strict_rejects_unknown_field() {
        let yaml = "services:\n  web:\n    image: nginx\n    replicas: 3\n";

        let err = DescriptorParser::new().strict(true).parse_str(yaml).unwrap_err();
        match err {
            DeployError::UnknownField { location, field } => {
                assert_eq!(location, "service 'web'");
                assert_eq!(field, "replicas");
            }
            other => panic!("unexpected error: {}", other),
        }

        let project = DescriptorParser::new().parse_str(yaml).unwrap();
        assert_eq!(project.services.len(), 1);
    }

    #[test]
    fn test_strict_nested_and_extension_fields() {
        let nested = "services:\n  db:\n    image: pg\n    healthcheck:\n      test: true\n      backoff: 2\n";
        assert!(matches!(
            DescriptorParser::new().strict(true).parse_str(nested),
            Err(DeployError::UnknownField { .. })
        ));

        let extension = "x-common: &c\n  restart: always\nservices:\n  web:\n    <<: *c\n    image: nginx\n    x-note: hi\n";
        let project = DescriptorParser::new().strict(true).parse_str(extension).unwrap();
        assert_eq!(project.services[0].restart.as_deref(), Some("always"));
    }

    #[test]
    fn test_demo_stack_parses_in_strict_mode() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/compose.yaml");
        let project = DescriptorParser::new().strict(true).parse_file(&path).unwrap();

        assert_eq!(project.service_names(), vec!["mem0", "postgres", "neo4j"]);
        assert!(crate::project::Validator::validate(&project).is_empty());

        let unmodelled = "services:\n  db:\n    image: pg\n    shm_size: 128mb\n    expose: [\"5432\"]\n    deploy:\n      replicas: 2\n";
        assert!(DescriptorParser::new().strict(true).parse_str(unmodelled).is_ok());
    }

    #[test]
    fn test_port_syntaxes() {
        assert_eq!(
            parse_port_short("127.0.0.1:5432:5432/udp").unwrap(),
            vec![PortMapping {
                host_ip: Some("127.0.0.1".to_string()),
                host: Some(5432),
                container: 5432,
                protocol: Protocol::Udp,
            }]
        );
        assert_eq!(parse_port_short("80").unwrap()[0].host, None);
        let range = parse_port_short("8000-8002:9000-9002").unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[2], PortMapping::tcp(8002, 9002));
        assert!(parse_port_short("8000-8002:9000").is_err());
        assert!(parse_port_short("70000:80").is_err());
    }

    #[test]
    fn test_mount_syntaxes() {
        let bind = parse_mount_short("./data:/data:ro").unwrap();
        assert_eq!(bind.source, MountSource::Bind("./data".to_string()));
        assert!(bind.read_only);

        let anon = parse_mount_short("/cache").unwrap();
        assert_eq!(anon.source, MountSource::Anonymous);
    }

    #[test]
    fn test_both_image_and_build_kept_for_validation() {
        let yaml = "services:\n  app:\n    image: app\n    build: ./app\n";
        let project = DescriptorParser::new().parse_str(yaml).unwrap();
        assert!(matches!(
            project.services[0].source,
            ServiceSource::Conflicting { .. }
        ));
    }

    #[test]
    fn test_depends_on_list_and_bad_condition() {
        let yaml = "services:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: y\n";
        let project = DescriptorParser::new().parse_str(yaml).unwrap();
        assert_eq!(
            project.services[0].depends_on[0].condition,
            DependencyCondition::Started
        );

        let yaml = "services:\n  a:\n    image: x\n    depends_on:\n      b:\n        condition: eventually\n";
        assert!(matches!(
            DescriptorParser::new().parse_str(yaml),
            Err(DeployError::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn test_parse_files_merges_and_reads_env_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "OPENAI_API_KEY=sk-test\n").unwrap();
        std::fs::write(
            dir.path().join("compose.yaml"),
            "services:\n  app:\n    image: app:${TAG:-dev}\n    env_file: .env\n    ports: [\"8000:8000\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("compose.override.yaml"),
            "services:\n  app:\n    ports: [\"9000:8000\"]\n  cache:\n    image: redis\n",
        )
        .unwrap();

        let found = DescriptorParser::find_compose_file(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("compose.yaml"));

        let project = DescriptorParser::new()
            .project_name(Some("Demo Stack".to_string()))
            .parse_files(&[found, dir.path().join("compose.override.yaml")])
            .unwrap();

        assert_eq!(project.name, "demostack");
        let app = project.service("app").unwrap();
        assert_eq!(app.source, ServiceSource::Image("app:dev".to_string()));
        assert_eq!(app.ports, vec![PortMapping::tcp(9000, 8000)]);
        assert_eq!(app.environment["OPENAI_API_KEY"], "sk-test");
        assert_eq!(project.service_names(), vec!["app", "cache"]);
    }
}
