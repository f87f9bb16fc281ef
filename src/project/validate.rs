//! Project validation
//!
//! Every check runs to completion so one pass reports the complete set of
//! problems in a descriptor.

use super::service::{
    DependencyCondition, MountSource, Project, Protocol, ServiceSource, DEFAULT_NETWORK,
};
use crate::error::{DeployError, Result};
use std::time::Duration;

/// Category of a validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    UnknownDependency,
    SelfDependency,
    UndeclaredNetwork,
    UndeclaredVolume,
    PortConflict,
    ConflictingSource,
    MissingSource,
    MissingHealthcheck,
    InvalidValue,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::UnknownDependency => "unknown_dependency",
            ValidationKind::SelfDependency => "self_dependency",
            ValidationKind::UndeclaredNetwork => "undeclared_network",
            ValidationKind::UndeclaredVolume => "undeclared_volume",
            ValidationKind::PortConflict => "port_conflict",
            ValidationKind::ConflictingSource => "conflicting_source",
            ValidationKind::MissingSource => "missing_source",
            ValidationKind::MissingHealthcheck => "missing_healthcheck",
            ValidationKind::InvalidValue => "invalid_value",
        }
    }
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ValidationKind,
    /// Offending service
    pub service: String,
    pub detail: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] service '{}': {}", self.kind, self.service, self.detail)
    }
}

/// All failures found in a project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Errors of one kind
    pub fn of_kind(&self, kind: ValidationKind) -> Vec<&ValidationError> {
        self.errors.iter().filter(|e| e.kind == kind).collect()
    }

    fn push(&mut self, kind: ValidationKind, service: &str, detail: String) {
        self.errors.push(ValidationError {
            kind,
            service: service.to_string(),
            detail,
        });
    }

    /// Convert into a `Result`, failing when any error was collected
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DeployError::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} validation error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  {}", error)?;
        }
        Ok(())
    }
}

/// Project validator
pub struct Validator;

impl Validator {
    /// Validate a project, returning every violation found
    pub fn validate(project: &Project) -> ValidationReport {
        let mut report = ValidationReport::default();
        // (host ip, port, protocol, owner) of every published port so far
        let mut published: Vec<(Option<&str>, u16, Protocol, &str)> = Vec::new();

        for service in &project.services {
            let name = service.name.as_str();

            match &service.source {
                ServiceSource::Conflicting { image, build } => report.push(
                    ValidationKind::ConflictingSource,
                    name,
                    format!(
                        "both image '{}' and build context '{}' are set",
                        image, build.context
                    ),
                ),
                ServiceSource::Unspecified => report.push(
                    ValidationKind::MissingSource,
                    name,
                    "either 'image' or 'build' must be specified".to_string(),
                ),
                ServiceSource::Image(image) if image.trim().is_empty() => report.push(
                    ValidationKind::InvalidValue,
                    name,
                    "image reference is empty".to_string(),
                ),
                _ => {}
            }

            for edge in &service.depends_on {
                if edge.to == name {
                    report.push(
                        ValidationKind::SelfDependency,
                        name,
                        "service depends on itself".to_string(),
                    );
                    continue;
                }
                match project.service(&edge.to) {
                    None => report.push(
                        ValidationKind::UnknownDependency,
                        name,
                        format!("depends on unknown service '{}'", edge.to),
                    ),
                    Some(target)
                        if edge.condition == DependencyCondition::Healthy
                            && target.healthcheck.is_none() =>
                    {
                        report.push(
                            ValidationKind::MissingHealthcheck,
                            name,
                            format!(
                                "waits for '{}' to be healthy but '{}' has no healthcheck",
                                edge.to, edge.to
                            ),
                        )
                    }
                    Some(_) => {}
                }
            }

            for network in &service.networks {
                if network != DEFAULT_NETWORK && !project.networks.contains_key(network) {
                    report.push(
                        ValidationKind::UndeclaredNetwork,
                        name,
                        format!("references undeclared network '{}'", network),
                    );
                }
            }

            for mount in &service.volumes {
                if let MountSource::Volume(volume) = &mount.source {
                    if !project.volumes.contains_key(volume) {
                        report.push(
                            ValidationKind::UndeclaredVolume,
                            name,
                            format!("references undeclared volume '{}'", volume),
                        );
                    }
                }
            }

            for port in &service.ports {
                if port.container == 0 || port.host == Some(0) {
                    report.push(
                        ValidationKind::InvalidValue,
                        name,
                        format!("port mapping '{}' uses port 0", port),
                    );
                    continue;
                }
                let Some(host) = port.host else { continue };
                let host_ip = port.host_ip.as_deref();
                let owner = published
                    .iter()
                    .find(|(ip, p, proto, _)| {
                        *p == host && *proto == port.protocol && binds_overlap(*ip, host_ip)
                    })
                    .map(|(_, _, _, owner)| *owner);
                match owner {
                    Some(owner) if owner == name => report.push(
                        ValidationKind::PortConflict,
                        name,
                        format!("host port {}/{} is published twice", host, port.protocol),
                    ),
                    Some(owner) => report.push(
                        ValidationKind::PortConflict,
                        name,
                        format!(
                            "host port {}/{} is already published by service '{}' (conflict between '{}' and '{}')",
                            host, port.protocol, owner, owner, name
                        ),
                    ),
                    None => published.push((host_ip, host, port.protocol, name)),
                }
            }

            if let Some(probe) = &service.healthcheck {
                if probe.retries == 0 {
                    report.push(
                        ValidationKind::InvalidValue,
                        name,
                        "healthcheck retries must be at least 1".to_string(),
                    );
                }
                if probe.interval == Duration::ZERO {
                    report.push(
                        ValidationKind::InvalidValue,
                        name,
                        "healthcheck interval must be greater than zero".to_string(),
                    );
                }
                if probe.timeout == Duration::ZERO {
                    report.push(
                        ValidationKind::InvalidValue,
                        name,
                        "healthcheck timeout must be greater than zero".to_string(),
                    );
                }
            }
        }

        report
    }
}

/// An unset, `0.0.0.0` or `::` host ip binds every interface
fn is_wildcard(ip: Option<&str>) -> bool {
    matches!(ip, None | Some("0.0.0.0") | Some("::") | Some("[::]") | Some(""))
}

/// Two host bindings of the same port and protocol collide
fn binds_overlap(a: Option<&str>, b: Option<&str>) -> bool {
    is_wildcard(a) || is_wildcard(b) || a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::service::{
        BuildSpec, HealthProbe, MountSource, Network, PortMapping, ProbeCommand, Service,
        VolumeMount,
    };

    fn image(name: &str) -> Service {
        Service::new(name, ServiceSource::Image(format!("{}:latest", name)))
    }

    #[test]
    fn test_valid_project() {
        let mut project = Project::new("test");
        project.services.push(
            image("db").healthcheck(HealthProbe::new(ProbeCommand::Shell("true".to_string()))),
        );
        project
            .services
            .push(image("api").depends_on("db", DependencyCondition::Healthy));

        assert!(Validator::validate(&project).is_empty());
    }

    #[test]
    fn test_port_conflict_names_both_services() {
        let mut project = Project::new("test");
        project.services.push(image("postgres").port(PortMapping::tcp(5432, 5432)));
        project.services.push(image("replica").port(PortMapping::tcp(5432, 5432)));

        let report = Validator::validate(&project);
        let conflicts = report.of_kind(ValidationKind::PortConflict);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].service, "replica");
        assert!(conflicts[0].detail.contains("'postgres'"));
        assert!(conflicts[0].detail.contains("'replica'"));
    }

    fn bound(ip: Option<&str>, host: u16) -> PortMapping {
        let mut mapping = PortMapping::tcp(host, host);
        mapping.host_ip = ip.map(str::to_string);
        mapping
    }

    #[test]
    fn test_wildcard_bind_conflicts_with_any_ip() {
        let mut project = Project::new("test");
        project.services.push(image("a").port(bound(None, 5432)));
        project.services.push(image("b").port(bound(Some("0.0.0.0"), 5432)));
        project.services.push(image("c").port(bound(Some("127.0.0.1"), 5432)));

        let report = Validator::validate(&project);
        let conflicts = report.of_kind(ValidationKind::PortConflict);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].service, "b");
        assert!(conflicts[0].detail.contains("'a'"));
        assert_eq!(conflicts[1].service, "c");
    }

    #[test]
    fn test_distinct_host_ips_do_not_conflict() {
        let mut project = Project::new("test");
        project.services.push(image("a").port(bound(Some("127.0.0.1"), 8080)));
        project.services.push(image("b").port(bound(Some("10.0.0.2"), 8080)));

        assert!(Validator::validate(&project).is_empty());
    }

    #[test]
    fn test_same_port_different_protocol_is_allowed() {
        let mut project = Project::new("test");
        project.services.push(image("dns").port(PortMapping::tcp(53, 53)));
        let mut udp = PortMapping::tcp(53, 53);
        udp.protocol = Protocol::Udp;
        project.services.push(image("dns-udp").port(udp));

        assert!(Validator::validate(&project).is_empty());
    }

    #[test]
    fn test_collects_all_violations() {
        let mut project = Project::new("test");
        let mut broken = Service::new(
            "broken",
            ServiceSource::Conflicting {
                image: "app".to_string(),
                build: BuildSpec::new("."),
            },
        )
        .depends_on("ghost", DependencyCondition::Started);
        broken.networks.insert("backend".to_string());
        broken.volumes.push(VolumeMount {
            source: MountSource::Volume("data".to_string()),
            target: "/data".to_string(),
            read_only: false,
        });
        project.services.push(broken);
        project
            .services
            .push(Service::new("empty", ServiceSource::Unspecified));

        let report = Validator::validate(&project);
        let kinds: Vec<ValidationKind> = report.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ValidationKind::ConflictingSource,
                ValidationKind::UnknownDependency,
                ValidationKind::UndeclaredNetwork,
                ValidationKind::UndeclaredVolume,
                ValidationKind::MissingSource,
            ]
        );
        assert!(matches!(
            report.into_result(),
            Err(DeployError::Validation(r)) if r.len() == 5
        ));
    }

    #[test]
    fn test_declared_network_and_default() {
        let mut project = Project::new("test");
        project.networks.insert(
            "backend".to_string(),
            Network {
                name: "backend".to_string(),
                ..Default::default()
            },
        );
        let mut svc = image("api");
        svc.networks.insert("backend".to_string());
        svc.networks.insert(DEFAULT_NETWORK.to_string());
        project.services.push(svc);

        assert!(Validator::validate(&project).is_empty());
    }

    #[test]
    fn test_healthy_condition_requires_healthcheck() {
        let mut project = Project::new("test");
        project.services.push(image("db"));
        project
            .services
            .push(image("api").depends_on("db", DependencyCondition::Healthy));

        let report = Validator::validate(&project);
        assert_eq!(report.of_kind(ValidationKind::MissingHealthcheck).len(), 1);
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut project = Project::new("test");
        project.services.push(
            image("db").healthcheck(
                HealthProbe::new(ProbeCommand::Shell("true".to_string())).retries(0),
            ),
        );

        let report = Validator::validate(&project);
        assert_eq!(report.of_kind(ValidationKind::InvalidValue).len(), 1);
    }
}
