//! Project, service and peer descriptors
//!
//! These are the typed values handed to the runtime. Loading them from the on-disk
//! YAML files happens elsewhere; here they are deserializable, defaulted and validated.

use crate::error::{Error, Result};
use crate::naming::sanitize_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default in-container working directory
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// Default image descriptor, relative to the project root
pub const DEFAULT_DOCKERFILE: &str = ".iso/Dockerfile";

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

fn default_dockerfile() -> String {
    DEFAULT_DOCKERFILE.to_string()
}

// ============================================================================
// ProjectDescriptor
// ============================================================================

/// Shell container configuration for a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDescriptor {
    /// Image descriptor path relative to the build context (the project root)
    pub dockerfile: String,
    /// In-container mount point of the project root
    pub workdir: String,
    pub privileged: bool,
    /// Container paths backed by session-scoped volumes
    pub volumes: Vec<String>,
    /// Container paths backed by cache volumes shared across worktrees
    pub cache: Vec<String>,
    /// Raw `host:container[:opts]` bind specs; `~` expands to the caller's home
    pub binds: Vec<String>,
    /// `host:ip` entries added to /etc/hosts
    pub extra_hosts: Vec<String>,
    /// Default environment for every exec
    pub environment: BTreeMap<String, String>,
}

impl Default for ProjectDescriptor {
    fn default() -> Self {
        Self {
            dockerfile: default_dockerfile(),
            workdir: default_workdir(),
            privileged: false,
            volumes: Vec::new(),
            cache: Vec::new(),
            binds: Vec::new(),
            extra_hosts: Vec::new(),
            environment: BTreeMap::new(),
        }
    }
}

impl ProjectDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_volume(mut self, path: impl Into<String>) -> Self {
        self.volumes.push(path.into());
        self
    }

    pub fn with_cache(mut self, path: impl Into<String>) -> Self {
        self.cache.push(path.into());
        self
    }

    pub fn with_bind(mut self, spec: impl Into<String>) -> Self {
        self.binds.push(spec.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Check required fields and normalise empty values to defaults
    pub fn validate(&mut self) -> Result<()> {
        if self.workdir.is_empty() {
            self.workdir = default_workdir();
        }
        if self.dockerfile.is_empty() {
            self.dockerfile = default_dockerfile();
        }
        if !self.workdir.starts_with('/') {
            return Err(Error::Config(format!(
                "workdir {:?} must be an absolute container path",
                self.workdir
            )));
        }
        for path in self.volumes.iter().chain(self.cache.iter()) {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "volume path {:?} must be an absolute container path",
                    path
                )));
            }
            if sanitize_path(path).is_empty() {
                return Err(Error::Config(format!(
                    "volume path {:?} does not name a directory below /",
                    path
                )));
            }
        }
        for spec in &self.binds {
            if !spec.contains(':') {
                return Err(Error::Config(format!(
                    "bind {:?} must have the form host:container[:opts]",
                    spec
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// ServiceSpec
// ============================================================================

/// Auxiliary container reachable by DNS name from the shell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub image: String,
    /// Overrides the image's default command when non-empty
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// TCP port the supervisor waits on before running the user command
    pub port: Option<u16>,
    pub extra_hosts: Vec<String>,
}

impl ServiceSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::Config(format!(
                "service {:?} is missing required 'image' field",
                name
            )));
        }
        if self.port == Some(0) {
            return Err(Error::Config(format!("service {:?} has port 0", name)));
        }
        Ok(())
    }
}

// ============================================================================
// Peers
// ============================================================================

/// A published port, `hostPort:containerPort` or a bare port used for both
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn parse(spec: &str) -> Result<Self> {
        let parse_port = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port mapping {:?}", spec)))
        };

        match spec.split_once(':') {
            Some((host, container)) => Ok(Self {
                host: parse_port(host)?,
                container: parse_port(container)?,
            }),
            None => {
                let port = parse_port(spec)?;
                Ok(Self {
                    host: port,
                    container: port,
                })
            }
        }
    }
}

/// One symmetric node of a multi-node setup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSpec {
    pub hostname: String,
    pub environment: BTreeMap<String, String>,
    /// `hostPort:containerPort` or `port`
    pub ports: Vec<String>,
}

impl PeerSpec {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, spec: impl Into<String>) -> Self {
        self.ports.push(spec.into());
        self
    }

    pub fn port_mappings(&self) -> Result<Vec<PortMapping>> {
        self.ports.iter().map(|p| PortMapping::parse(p)).collect()
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::Config(format!(
                "peer {:?} is missing required 'hostname' field",
                name
            )));
        }
        self.port_mappings().map(|_| ())
    }
}

/// Peer collection plus the optional shared network override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersSpec {
    pub network: Option<String>,
    pub peers: BTreeMap<String, PeerSpec>,
}

impl PeersSpec {
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(Error::Config(
                "peers descriptor must define at least one peer".to_string(),
            ));
        }
        for (name, peer) in &self.peers {
            peer.validate(name)?;
        }
        Ok(())
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Everything loaded from a project's `.iso` directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Descriptors {
    pub project: ProjectDescriptor,
    pub services: BTreeMap<String, ServiceSpec>,
    pub peers: Option<PeersSpec>,
}

impl Descriptors {
    pub fn new(project: ProjectDescriptor) -> Self {
        Self {
            project,
            ..Default::default()
        }
    }

    pub fn with_service(mut self, name: impl Into<String>, spec: ServiceSpec) -> Self {
        self.services.insert(name.into(), spec);
        self
    }

    pub fn with_peers(mut self, peers: PeersSpec) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Parse descriptors serialized as JSON (used by embedders and tests)
    pub fn from_json(json: &str) -> Result<Self> {
        let mut descriptors: Descriptors = serde_json::from_str(json)?;
        descriptors.validate()?;
        Ok(descriptors)
    }

    pub fn validate(&mut self) -> Result<()> {
        self.project.validate()?;
        for (name, service) in &self.services {
            service.validate(name)?;
        }
        if let Some(peers) = &self.peers {
            peers.validate()?;
        }
        Ok(())
    }

    pub fn has_services(&self) -> bool {
        !self.services.is_empty()
    }

    /// `name:port` list for services that declare a readiness port
    pub fn readiness_list(&self) -> String {
        self.services
            .iter()
            .filter_map(|(name, svc)| svc.port.map(|port| format!("{}:{}", name, port)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_defaults() {
        let mut project: ProjectDescriptor = serde_json::from_str("{}").unwrap();
        project.validate().unwrap();
        assert_eq!(project.workdir, "/workspace");
        assert_eq!(project.dockerfile, ".iso/Dockerfile");
        assert!(!project.privileged);

        let mut project = ProjectDescriptor::new().with_workdir("");
        project.validate().unwrap();
        assert_eq!(project.workdir, "/workspace");
    }

    #[test]
    fn test_project_rejects_relative_workdir() {
        let mut project = ProjectDescriptor::new().with_workdir("src");
        assert!(matches!(project.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_project_rejects_root_volume() {
        for path in ["/", "//"] {
            let mut volume = ProjectDescriptor::new().with_volume(path);
            assert!(matches!(volume.validate(), Err(Error::Config(_))));

            let mut cache = ProjectDescriptor::new().with_cache(path);
            assert!(matches!(cache.validate(), Err(Error::Config(_))));
        }
        assert!(ProjectDescriptor::new().with_volume("/data").validate().is_ok());
    }

    #[test]
    fn test_service_requires_image() {
        let err = ServiceSpec::default().validate("db").unwrap_err();
        assert!(err.to_string().contains("'image'"));
        assert!(ServiceSpec::new("postgres:16").with_port(5432).validate("db").is_ok());
    }

    #[test]
    fn test_peers_validation() {
        let empty = PeersSpec::default();
        assert!(empty.validate().is_err());

        let mut peers = PeersSpec::default();
        peers.peers.insert("a".into(), PeerSpec::default());
        assert!(peers.validate().unwrap_err().to_string().contains("hostname"));

        peers.peers.insert("a".into(), PeerSpec::new("node-a").with_port("8080:80"));
        peers.validate().unwrap();

        peers.peers.insert("b".into(), PeerSpec::new("node-b").with_port("http"));
        assert!(peers.validate().is_err());
    }

    #[test]
    fn test_port_mapping() {
        assert_eq!(
            PortMapping::parse("8080:80").unwrap(),
            PortMapping { host: 8080, container: 80 }
        );
        assert_eq!(
            PortMapping::parse("9000").unwrap(),
            PortMapping { host: 9000, container: 9000 }
        );
        assert!(PortMapping::parse("a:b").is_err());
    }

    #[test]
    fn test_readiness_list() {
        let d = Descriptors::default()
            .with_service("db", ServiceSpec::new("postgres").with_port(5432))
            .with_service("cache", ServiceSpec::new("redis").with_port(6379))
            .with_service("mail", ServiceSpec::new("mailhog"));
        assert_eq!(d.readiness_list(), "cache:6379,db:5432");
    }

    #[test]
    fn test_from_json() {
        let d = Descriptors::from_json(
            r#"{
                "project": { "workdir": "/src", "cache": ["/root/.cargo"] },
                "services": { "db": { "image": "postgres:16", "port": 5432 } }
            }"#,
        )
        .unwrap();
        assert_eq!(d.project.workdir, "/src");
        assert_eq!(d.services["db"].port, Some(5432));

        let err = Descriptors::from_json(r#"{ "services": { "db": {} } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
