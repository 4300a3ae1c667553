//! Resource Client
//!
//! The runtime's only view of the container engine. Every mutation of containers,
//! networks, volumes and images goes through [`ResourceClient`]; the reconciler,
//! orchestrators and garbage collector never talk to an engine directly.
//!
//! Implementations:
//! - [`DockerClient`] - local engine through bollard
//! - [`MemoryClient`] - in-process engine for tests and dry runs

mod docker;
mod managed;
mod memory;

pub use docker::{ContainerRuntime, DockerClient};
pub use managed::{
    absorb, find_container, list_managed, stop_and_remove, ManagedContainer, ManagedFilter, Owner,
    Role,
};
pub use memory::{ExecCall, ExecResult, MemoryClient};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use iso_foundation::{PortMapping, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

// ============================================================================
// Images
// ============================================================================

/// Image build from a context directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context (the project root)
    pub context: PathBuf,
    /// Descriptor path relative to the context
    pub dockerfile: String,
    pub tag: String,
}

// ============================================================================
// Containers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    /// Created, exited, paused or dead
    Stopped,
}

impl ContainerState {
    /// Map an engine state string
    pub fn from_engine(state: &str) -> Self {
        match state {
            "running" | "restarting" => Self::Running,
            _ => Self::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Name without the engine's leading `/`
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
    pub created: Option<DateTime<Utc>>,
}

/// Container listing query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include stopped containers
    pub all: bool,
    /// Engine label filters, `key` or `key=value`
    pub labels: Vec<String>,
}

impl ContainerFilter {
    pub fn all() -> Self {
        Self {
            all: true,
            labels: Vec::new(),
        }
    }

    pub fn running() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push(format!("{}={}", key, value));
        self
    }

    pub fn has_label(mut self, key: &str) -> Self {
        self.labels.push(key.to_string());
        self
    }

    /// Whether `labels` satisfies every filter
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|filter| match filter.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(filter),
        })
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    /// Overrides the image command when non-empty
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// `source:target[:opts]`; a source without `/` is a named volume
    pub binds: Vec<String>,
    /// Network attached at creation time
    pub network: Option<String>,
    /// DNS aliases on `network`
    pub aliases: Vec<String>,
    pub auto_remove: bool,
    pub privileged: bool,
    pub extra_hosts: Vec<String>,
    /// Published on `0.0.0.0/tcp`
    pub ports: Vec<PortMapping>,
}

// ============================================================================
// Exec
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// Request a pseudo-terminal
    pub tty: bool,
}

/// One chunk of exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    StdOut(Bytes),
    StdErr(Bytes),
    /// Pseudo-terminal output (stdout and stderr combined)
    Console(Bytes),
}

/// Attached exec streams
pub struct ExecAttachment {
    pub output: BoxStream<'static, Result<ExecOutput>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for ExecAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecAttachment").finish_non_exhaustive()
    }
}

// ============================================================================
// ResourceClient
// ============================================================================

/// Effectful operations against a container engine.
///
/// Failures are reported as [`iso_foundation::Error::Engine`] with a structured
/// [`iso_foundation::EngineErrorKind`], which is what callers use for race absorption.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    // --- images ---
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build an image and return the complete build log
    async fn build_image(&self, request: &BuildRequest) -> Result<String>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    // --- containers ---
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>>;

    /// Create a container and return its id
    async fn create_container(&self, request: &ContainerRequest) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    // --- exec ---
    async fn create_exec(&self, container: &str, request: &ExecRequest) -> Result<String>;

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<ExecAttachment>;

    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<()>;

    /// Exit code, `None` while the exec has not reported one
    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>>;

    // --- networks ---
    /// Network names; `unused_only` restricts to networks without endpoints
    async fn list_networks(&self, unused_only: bool) -> Result<Vec<String>>;

    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Create a bridge network
    async fn create_network(&self, name: &str) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn connect_network(&self, network: &str, container: &str, aliases: &[String]) -> Result<()>;

    // --- volumes ---
    /// Volume names; `dangling_only` restricts to volumes no container references
    async fn list_volumes(&self, dangling_only: bool) -> Result<Vec<String>>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("iso.managed".to_string(), "true".to_string());
        labels.insert("iso.session".to_string(), "dev".to_string());

        assert!(ContainerFilter::all().label("iso.managed", "true").matches_labels(&labels));
        assert!(ContainerFilter::all().has_label("iso.session").matches_labels(&labels));
        assert!(!ContainerFilter::all()
            .label("iso.managed", "true")
            .label("iso.session", "prod")
            .matches_labels(&labels));
        assert!(!ContainerFilter::all().has_label("iso.peer").matches_labels(&labels));
    }

    #[test]
    fn test_container_state() {
        assert!(ContainerState::from_engine("running").is_running());
        assert!(!ContainerState::from_engine("exited").is_running());
        assert!(!ContainerState::from_engine("created").is_running());
    }
}
