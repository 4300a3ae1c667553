//! Label-based discovery of managed containers and race-tolerant teardown helpers

use super::{ContainerFilter, ContainerState, ContainerSummary, ResourceClient};
use chrono::{DateTime, Utc};
use iso_foundation::naming::{labels, SHELL_ROLE};
use iso_foundation::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// What a managed container is for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Role {
    Shell,
    Service(String),
    Peer(String),
}

impl Role {
    fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let flag = |key: &str| labels.get(key).map(String::as_str) == Some(labels::TRUE);
        let value = |key: &str| labels.get(key).cloned().unwrap_or_default();

        if flag(labels::PEER) {
            Role::Peer(value(labels::PEER_NAME))
        } else if flag(labels::SERVICE) {
            Role::Service(value(labels::SERVICE_NAME))
        } else {
            Role::Shell
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Role::Service(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Shell => f.write_str(SHELL_ROLE),
            Role::Service(name) => write!(f, "service:{}", name),
            Role::Peer(name) => write!(f, "peer:{}", name),
        }
    }
}

/// Process that created an ephemeral container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub pid: u32,
    pub host: String,
}

/// A container carrying `iso.managed=true`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub role: Role,
    /// Worktree project name
    pub project: String,
    /// Project root recorded at creation
    pub project_dir: PathBuf,
    pub session: String,
    pub state: ContainerState,
    pub ephemeral: bool,
    pub fresh: bool,
    pub owner: Option<Owner>,
    pub created: Option<DateTime<Utc>>,
}

impl ManagedContainer {
    fn from_summary(summary: ContainerSummary) -> Self {
        let label = |key: &str| summary.labels.get(key).cloned().unwrap_or_default();
        let flag = |key: &str| summary.labels.get(key).map(String::as_str) == Some(labels::TRUE);

        let owner = summary
            .labels
            .get(labels::OWNER_PID)
            .and_then(|pid| pid.parse().ok())
            .map(|pid| Owner {
                pid,
                host: label(labels::OWNER_HOST),
            });

        Self {
            role: Role::from_labels(&summary.labels),
            project: label(labels::PROJECT_NAME),
            project_dir: PathBuf::from(label(labels::PROJECT_DIR)),
            session: label(labels::SESSION),
            ephemeral: flag(labels::EPHEMERAL),
            fresh: flag(labels::FRESH),
            owner,
            id: summary.id,
            name: summary.name,
            state: summary.state,
            created: summary.created,
        }
    }

    /// First 12 characters of the id
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Query over ownership labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedFilter {
    pub project: Option<String>,
    pub session: Option<String>,
    pub ephemeral: Option<bool>,
    pub peers_only: bool,
    pub running_only: bool,
}

impl ManagedFilter {
    /// Every managed container on the engine
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Default::default()
        }
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = Some(ephemeral);
        self
    }

    pub fn peers(mut self) -> Self {
        self.peers_only = true;
        self
    }

    pub fn running(mut self) -> Self {
        self.running_only = true;
        self
    }

    fn to_container_filter(&self) -> ContainerFilter {
        let mut filter = if self.running_only {
            ContainerFilter::running()
        } else {
            ContainerFilter::all()
        }
        .label(labels::MANAGED, labels::TRUE);

        if let Some(project) = &self.project {
            filter = filter.label(labels::PROJECT_NAME, project);
        }
        if let Some(session) = &self.session {
            filter = filter.label(labels::SESSION, session);
        }
        if let Some(ephemeral) = self.ephemeral {
            let value = if ephemeral { labels::TRUE } else { labels::FALSE };
            filter = filter.label(labels::EPHEMERAL, value);
        }
        if self.peers_only {
            filter = filter.label(labels::PEER, labels::TRUE);
        }
        filter
    }
}

/// List managed containers matching `filter`, ordered by name
pub async fn list_managed(
    client: &dyn ResourceClient,
    filter: &ManagedFilter,
) -> Result<Vec<ManagedContainer>> {
    let mut containers: Vec<ManagedContainer> = client
        .list_containers(&filter.to_container_filter())
        .await?
        .into_iter()
        .map(ManagedContainer::from_summary)
        .collect();
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(containers)
}

/// Container with exactly this name, running or not
pub async fn find_container(
    client: &dyn ResourceClient,
    name: &str,
) -> Result<Option<ContainerSummary>> {
    Ok(client
        .list_containers(&ContainerFilter::all())
        .await?
        .into_iter()
        .find(|c| c.name == name))
}

/// Treat race outcomes (already gone, already exists, in progress, not modified) as success
pub fn absorb(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_race_absorbable() => {
            debug!("Absorbed engine race: {}", err);
            Ok(())
        }
        other => other,
    }
}

/// Stop then remove a container, absorbing races with concurrent teardown
pub async fn stop_and_remove(
    client: &dyn ResourceClient,
    id: &str,
    timeout: Duration,
) -> Result<()> {
    absorb(client.stop_container(id, timeout).await)?;
    absorb(client.remove_container(id, false).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: "0123456789abcdef".to_string(),
            name: "demo-shell".to_string(),
            image: "demo-shell".to_string(),
            state: ContainerState::Running,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created: None,
        }
    }

    #[test]
    fn test_role_from_labels() {
        let shell = ManagedContainer::from_summary(summary(&[(labels::NAME, "shell")]));
        assert_eq!(shell.role, Role::Shell);
        assert_eq!(shell.role.to_string(), "shell");

        let svc = ManagedContainer::from_summary(summary(&[
            (labels::SERVICE, "true"),
            (labels::SERVICE_NAME, "db"),
        ]));
        assert_eq!(svc.role.to_string(), "service:db");

        let peer = ManagedContainer::from_summary(summary(&[
            (labels::PEER, "true"),
            (labels::PEER_NAME, "a"),
        ]));
        assert_eq!(peer.role, Role::Peer("a".to_string()));
    }

    #[test]
    fn test_ownership_labels() {
        let c = ManagedContainer::from_summary(summary(&[
            (labels::PROJECT_NAME, "demo"),
            (labels::PROJECT_DIR, "/src/demo"),
            (labels::SESSION, "eph-x"),
            (labels::EPHEMERAL, "true"),
            (labels::OWNER_PID, "42"),
            (labels::OWNER_HOST, "box"),
        ]));
        assert_eq!(c.project, "demo");
        assert_eq!(c.project_dir, PathBuf::from("/src/demo"));
        assert!(c.ephemeral);
        assert!(!c.fresh);
        assert_eq!(c.owner, Some(Owner { pid: 42, host: "box".to_string() }));
        assert_eq!(c.short_id(), "0123456789ab");
    }

    #[test]
    fn test_filter_labels() {
        let filter = ManagedFilter::project("demo").session("dev").ephemeral(false);
        let f = filter.to_container_filter();
        assert!(f.all);
        assert_eq!(
            f.labels,
            vec![
                "iso.managed=true",
                "iso.project.name=demo",
                "iso.session=dev",
                "iso.ephemeral=false",
            ]
        );
        assert!(!ManagedFilter::everything().running().to_container_filter().all);
    }
}
