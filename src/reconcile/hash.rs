//! Content hash of a service definition

use crate::project::{
    BuildSpec, HealthProbe, MountSource, ProbeCommand, Service, ServiceSource,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

fn build_value(build: &BuildSpec) -> Value {
    json!({
        "context": build.context,
        "dockerfile": build.dockerfile,
        "args": build.args,
        "target": build.target,
    })
}

fn probe_value(probe: &HealthProbe) -> Value {
    let test = match &probe.test {
        ProbeCommand::Exec(args) => json!({ "exec": args }),
        ProbeCommand::Shell(cmd) => json!({ "shell": cmd }),
    };
    json!({
        "test": test,
        "interval_ms": probe.interval.as_millis() as u64,
        "timeout_ms": probe.timeout.as_millis() as u64,
        "retries": probe.retries,
        "start_period_ms": probe.start_period.as_millis() as u64,
    })
}

/// Canonical form of a service
///
/// Object keys serialize sorted. Maps and sets (environment, labels,
/// networks, mounts, dependencies) are order-insensitive; ports, command and
/// entrypoint keep their declared order.
fn canonical(service: &Service) -> Value {
    let source = match &service.source {
        ServiceSource::Image(image) => json!({ "image": image }),
        ServiceSource::Build(build) => json!({ "build": build_value(build) }),
        ServiceSource::Conflicting { image, build } => {
            json!({ "image": image, "build": build_value(build) })
        }
        ServiceSource::Unspecified => Value::Null,
    };

    let mut mounts: Vec<Value> = service
        .volumes
        .iter()
        .map(|m| {
            let source = match &m.source {
                MountSource::Volume(name) => json!({ "volume": name }),
                MountSource::Bind(path) => json!({ "bind": path }),
                MountSource::Anonymous => Value::Null,
            };
            json!({ "source": source, "target": m.target, "read_only": m.read_only })
        })
        .collect();
    mounts.sort_by_key(|m| m.to_string());

    let mut depends_on: Vec<(String, String)> = service
        .depends_on
        .iter()
        .map(|e| (e.to.clone(), e.condition.to_string()))
        .collect();
    depends_on.sort();

    json!({
        "source": source,
        "command": service.command,
        "entrypoint": service.entrypoint,
        "container_name": service.container_name,
        "ports": service.ports.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        "environment": service.environment,
        "networks": service.effective_networks(),
        "volumes": mounts,
        "healthcheck": service.healthcheck.as_ref().map(probe_value),
        "depends_on": depends_on,
        "restart": service.restart,
        "labels": service.labels,
        "working_dir": service.working_dir,
        "user": service.user,
    })
}

/// SHA-256 over the canonical JSON form of a service, hex encoded
///
/// The service name is identity, not content, and is left out.
pub fn spec_hash(service: &Service) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical(service).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{DependencyCondition, PortMapping, VolumeMount};

    fn base() -> Service {
        Service::new("api", ServiceSource::Image("api:1".to_string()))
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(spec_hash(&base()), spec_hash(&base()));
        assert_eq!(spec_hash(&base()).len(), 64);
    }

    #[test]
    fn test_hash_ignores_map_and_set_order() {
        let mount = |target: &str| VolumeMount {
            source: MountSource::Anonymous,
            target: target.to_string(),
            read_only: false,
        };

        let mut a = base()
            .depends_on("db", DependencyCondition::Healthy)
            .depends_on("cache", DependencyCondition::Started);
        a.environment.insert("A".to_string(), "1".to_string());
        a.environment.insert("B".to_string(), "2".to_string());
        a.volumes = vec![mount("/data"), mount("/cache")];

        let mut b = base()
            .depends_on("cache", DependencyCondition::Started)
            .depends_on("db", DependencyCondition::Healthy);
        b.environment.insert("B".to_string(), "2".to_string());
        b.environment.insert("A".to_string(), "1".to_string());
        b.volumes = vec![mount("/cache"), mount("/data")];

        assert_eq!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn test_hash_tracks_content() {
        let renamed = Service {
            name: "other".to_string(),
            ..base()
        };
        assert_eq!(spec_hash(&base()), spec_hash(&renamed));

        let retagged = Service::new("api", ServiceSource::Image("api:2".to_string()));
        assert_ne!(spec_hash(&base()), spec_hash(&retagged));

        let ab = base().port(PortMapping::tcp(80, 80)).port(PortMapping::tcp(443, 443));
        let ba = base().port(PortMapping::tcp(443, 443)).port(PortMapping::tcp(80, 80));
        assert_ne!(spec_hash(&ab), spec_hash(&ba));
    }
}
