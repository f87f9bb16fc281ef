//! Typed project model built from a parsed descriptor

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Network every service joins when it declares none
pub const DEFAULT_NETWORK: &str = "default";

/// A fully parsed deployment project
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    /// Project name
    pub name: String,
    /// Services in declaration order
    pub services: Vec<Service>,
    /// Declared networks
    pub networks: BTreeMap<String, Network>,
    /// Declared volumes
    pub volumes: BTreeMap<String, Volume>,
}

impl Project {
    /// Create an empty project
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Get a service by name
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Position of a service in declaration order
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.services.iter().position(|s| s.name == name)
    }

    /// Service names in declaration order
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// All dependency edges in declaration order
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.services.iter().flat_map(|s| s.depends_on.iter())
    }
}

/// One deployable unit
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    /// Unique service name
    pub name: String,
    /// Where the service image comes from
    pub source: ServiceSource,
    /// Command override
    pub command: Option<Vec<String>>,
    /// Entrypoint override
    pub entrypoint: Option<Vec<String>>,
    /// Explicit container name
    pub container_name: Option<String>,
    /// Port mappings in declaration order
    pub ports: Vec<PortMapping>,
    /// Environment variables
    pub environment: BTreeMap<String, String>,
    /// Networks joined
    pub networks: BTreeSet<String>,
    /// Volume and bind mounts
    pub volumes: Vec<VolumeMount>,
    /// Health probe
    pub healthcheck: Option<HealthProbe>,
    /// Dependency edges, `from` is always this service
    pub depends_on: Vec<DependencyEdge>,
    /// Restart policy
    pub restart: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// User
    pub user: Option<String>,
}

impl Service {
    /// Create a service with only a source set
    pub fn new(name: &str, source: ServiceSource) -> Self {
        Self {
            name: name.to_string(),
            source,
            command: None,
            entrypoint: None,
            container_name: None,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            networks: BTreeSet::new(),
            volumes: Vec::new(),
            healthcheck: None,
            depends_on: Vec::new(),
            restart: None,
            labels: BTreeMap::new(),
            working_dir: None,
            user: None,
        }
    }

    /// Add a dependency edge
    pub fn depends_on(mut self, target: &str, condition: DependencyCondition) -> Self {
        self.depends_on.push(DependencyEdge {
            from: self.name.clone(),
            to: target.to_string(),
            condition,
        });
        self
    }

    /// Set the health probe
    pub fn healthcheck(mut self, probe: HealthProbe) -> Self {
        self.healthcheck = Some(probe);
        self
    }

    /// Add a port mapping
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    /// Networks the service joins, falling back to the default network
    pub fn effective_networks(&self) -> BTreeSet<String> {
        if self.networks.is_empty() {
            BTreeSet::from([DEFAULT_NETWORK.to_string()])
        } else {
            self.networks.clone()
        }
    }
}

/// Image source of a service
///
/// `build` and `image` are mutually exclusive. The parser keeps both when a
/// descriptor sets both (or neither) so the validator can report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSource {
    /// Pull a prebuilt image
    Image(String),
    /// Build from a local context
    Build(BuildSpec),
    /// Both `image` and `build` were declared
    Conflicting { image: String, build: BuildSpec },
    /// Neither was declared
    Unspecified,
}

/// Build context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSpec {
    /// Context directory
    pub context: String,
    /// Build file relative to the context
    pub dockerfile: Option<String>,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Target stage
    pub target: Option<String>,
}

impl BuildSpec {
    pub fn new(context: &str) -> Self {
        Self {
            context: context.to_string(),
            ..Default::default()
        }
    }
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unsupported protocol '{}'", other)),
        }
    }
}

/// Host to container port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Host interface to bind
    pub host_ip: Option<String>,
    /// Published host port, `None` when only exposed
    pub host: Option<u16>,
    /// Container port
    pub container: u16,
    /// Protocol
    pub protocol: Protocol,
}

impl PortMapping {
    /// `host:container` over TCP
    pub fn tcp(host: u16, container: u16) -> Self {
        Self {
            host_ip: None,
            host: Some(host),
            container,
            protocol: Protocol::Tcp,
        }
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        if let Some(host) = self.host {
            write!(f, "{}:", host)?;
        }
        write!(f, "{}/{}", self.container, self.protocol)
    }
}

/// Source of a mount
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MountSource {
    /// Named volume, must be declared at the top level
    Volume(String),
    /// Host path
    Bind(String),
    /// Anonymous volume
    Anonymous,
}

/// Volume mount of a service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VolumeMount {
    pub source: MountSource,
    /// Path inside the container
    pub target: String,
    pub read_only: bool,
}

/// Network driver kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NetworkDriver {
    #[default]
    Bridge,
    Host,
    None,
    Overlay,
    Macvlan,
    Ipvlan,
    /// Third-party driver
    Custom(String),
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Host => write!(f, "host"),
            NetworkDriver::None => write!(f, "none"),
            NetworkDriver::Overlay => write!(f, "overlay"),
            NetworkDriver::Macvlan => write!(f, "macvlan"),
            NetworkDriver::Ipvlan => write!(f, "ipvlan"),
            NetworkDriver::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for NetworkDriver {
    fn from(s: &str) -> Self {
        match s {
            "bridge" => NetworkDriver::Bridge,
            "host" => NetworkDriver::Host,
            "none" => NetworkDriver::None,
            "overlay" => NetworkDriver::Overlay,
            "macvlan" => NetworkDriver::Macvlan,
            "ipvlan" => NetworkDriver::Ipvlan,
            other => NetworkDriver::Custom(other.to_string()),
        }
    }
}

/// Declared network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub driver: NetworkDriver,
    pub driver_opts: BTreeMap<String, String>,
    /// Managed outside the project
    pub external: bool,
    pub internal: bool,
}

/// Declared volume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub driver: Option<String>,
    pub driver_opts: BTreeMap<String, String>,
    /// Managed outside the project
    pub external: bool,
}

/// Health probe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCommand {
    /// Executed directly (`CMD`)
    Exec(Vec<String>),
    /// Run through the shell (`CMD-SHELL` or a plain string)
    Shell(String),
}

impl std::fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeCommand::Exec(args) => write!(f, "{}", args.join(" ")),
            ProbeCommand::Shell(cmd) => write!(f, "sh -c '{}'", cmd),
        }
    }
}

/// Periodic readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub test: ProbeCommand,
    /// Delay between probes
    pub interval: Duration,
    /// Upper bound for a single probe
    pub timeout: Duration,
    /// Consecutive failures before the service is unhealthy
    pub retries: u32,
    /// Grace period during which failures do not count
    pub start_period: Duration,
}

impl HealthProbe {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Probe with compose default timings
    pub fn new(test: ProbeCommand) -> Self {
        Self {
            test,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: Self::DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

/// Derived health of a probed service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Condition a dependency must reach before the dependent starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyCondition {
    Started,
    Healthy,
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyCondition::Started => write!(f, "service_started"),
            DependencyCondition::Healthy => write!(f, "service_healthy"),
        }
    }
}

impl std::str::FromStr for DependencyCondition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "service_started" | "started" => Ok(DependencyCondition::Started),
            "service_healthy" | "healthy" => Ok(DependencyCondition::Healthy),
            other => Err(format!("unsupported dependency condition '{}'", other)),
        }
    }
}

/// `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub condition: DependencyCondition,
}
