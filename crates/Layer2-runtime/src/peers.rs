//! Peer containers
//!
//! Peers are symmetric nodes built from the shell image with the shell's mounts. Each
//! one gets its own hostname and joins a shared peers network, together with any
//! persistent services.

use crate::client::{absorb, find_container, list_managed, stop_and_remove, ContainerRequest, ManagedFilter};
use crate::exec::ExecIo;
use crate::reconcile::{init_command, Environment};
use iso_foundation::config::env::{ISO_PEER_HOSTNAME, ISO_PEER_NAME, ISO_SESSION, ISO_WORKDIR};
use iso_foundation::naming::{labels, PEERS_SESSION};
use iso_foundation::{Error, PeerSpec, PeersSpec, Result};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Shell started by [`Environment::peer_shell`]
const PEER_SHELL: &str = "bash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Running,
    Stopped,
    NotCreated,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerState::Running => "running",
            PeerState::Stopped => "stopped",
            PeerState::NotCreated => "not created",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub hostname: String,
    /// Short container id, when the container exists
    pub container_id: Option<String>,
    pub state: PeerState,
}

impl Environment {
    fn peers_spec(&self) -> Result<&PeersSpec> {
        self.descriptors
            .peers
            .as_ref()
            .ok_or_else(|| Error::Config("no peers configured".to_string()))
    }

    fn peer_spec(&self, name: &str) -> Result<&PeerSpec> {
        self.peers_spec()?
            .peers
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown peer: {}", name)))
    }

    pub fn peers_network(&self) -> String {
        let overridden = self.descriptors.peers.as_ref().and_then(|p| p.network.as_deref());
        self.naming.peers_network(overridden)
    }

    /// Create the shared peers network if absent
    pub async fn ensure_peers_network(&self) -> Result<()> {
        self.peers_spec()?;
        self.ensure_named_network(&self.peers_network()).await
    }

    /// Start the named peers, or all of them when `names` is empty; returns container ids
    pub async fn peers_up(&self, names: &[String]) -> Result<Vec<String>> {
        let peers = self.peers_spec()?;
        let selected: Vec<(&str, &PeerSpec)> = if names.is_empty() {
            peers.peers.iter().map(|(n, s)| (n.as_str(), s)).collect()
        } else {
            names
                .iter()
                .map(|n| self.peer_spec(n).map(|s| (n.as_str(), s)))
                .collect::<Result<_>>()?
        };

        self.ensure_image().await?;
        self.ensure_peers_network().await?;
        let network = self.peers_network();

        if self.descriptors.has_services() {
            self.start_all_services().await?;
            for name in self.descriptors.services.keys() {
                let container = self.naming.service_container(name);
                let Some(c) = find_container(self.client.as_ref(), &container).await? else {
                    warn!("Service {} has no container to connect", name);
                    continue;
                };
                let aliases = [name.clone()];
                if let Err(e) = absorb(self.client.connect_network(&network, &c.id, &aliases).await) {
                    warn!("Failed to connect service {} to {}: {}", name, network, e);
                }
            }
        }

        let mut ids = Vec::with_capacity(selected.len());
        for (name, spec) in selected {
            info!("Starting peer {} ({})", name, spec.hostname);
            ids.push(self.start_peer(name, spec).await?);
        }
        Ok(ids)
    }

    async fn start_peer(&self, name: &str, spec: &PeerSpec) -> Result<String> {
        let container = self.naming.peer_container(name);
        match find_container(self.client.as_ref(), &container).await? {
            Some(c) if c.state.is_running() => Ok(c.id),
            Some(c) => {
                absorb(self.client.start_container(&c.id).await)?;
                Ok(c.id)
            }
            None => {
                self.ensure_volumes().await?;
                let request = self.peer_request(name, spec, container)?;
                self.start_container(&request).await
            }
        }
    }

    fn peer_request(&self, name: &str, spec: &PeerSpec, container: String) -> Result<ContainerRequest> {
        let project = &self.descriptors.project;

        let mut env = vec![
            format!("{}={}", ISO_WORKDIR, project.workdir),
            format!("{}={}", ISO_SESSION, PEERS_SESSION),
            format!("{}={}", ISO_PEER_NAME, name),
            format!("{}={}", ISO_PEER_HOSTNAME, spec.hostname),
        ];
        env.extend(spec.environment.iter().map(|(k, v)| format!("{}={}", k, v)));

        let mut peer_labels = self.ownership_labels(PEERS_SESSION, name);
        peer_labels.insert(labels::PEER.to_string(), labels::TRUE.to_string());
        peer_labels.insert(labels::PEER_NAME.to_string(), name.to_string());

        Ok(ContainerRequest {
            name: container,
            image: self.naming.image(),
            cmd: init_command(),
            env,
            working_dir: Some(project.workdir.clone()),
            hostname: Some(spec.hostname.clone()),
            labels: peer_labels,
            binds: self.shell_binds()?,
            network: Some(self.peers_network()),
            aliases: vec![spec.hostname.clone()],
            privileged: project.privileged,
            extra_hosts: project.extra_hosts.clone(),
            ports: spec.port_mappings()?,
            ..Default::default()
        })
    }

    /// Remove every peer container, the persistent services and the peers network
    pub async fn peers_down(&self) -> Result<()> {
        if self.descriptors.peers.is_none() {
            return Ok(());
        }

        let filter = ManagedFilter::project(&self.project.identity.worktree).peers();
        let peers = list_managed(self.client.as_ref(), &filter).await?;
        if peers.is_empty() {
            info!("No peer containers to stop");
            return Ok(());
        }

        for c in &peers {
            debug!("Stopping peer {}", c.name);
            if let Err(e) = stop_and_remove(self.client.as_ref(), &c.id, self.settings.stop_timeout).await {
                warn!("Failed to stop peer {}: {}", c.name, e);
            }
        }

        if self.descriptors.has_services() {
            if let Err(e) = self.stop_all_services().await {
                warn!("Failed to stop services: {}", e);
            }
        }

        tokio::time::sleep(self.settings.network_settle_delay).await;
        self.remove_network_quietly(&self.peers_network()).await;
        Ok(())
    }

    /// Run a command in a running peer and return its exit code
    pub async fn peer_exec(
        &self,
        name: &str,
        command: &[String],
        env: &[String],
        io: ExecIo,
    ) -> Result<i64> {
        self.peer_spec(name)?;
        if command.is_empty() {
            return Err(Error::InvalidInput("no command given".to_string()));
        }

        let container = self.naming.peer_container(name);
        let peer = find_container(self.client.as_ref(), &container)
            .await?
            .filter(|c| c.state.is_running())
            .ok_or_else(|| {
                Error::InvalidInput(format!("peer {} is not running, bring peers up first", name))
            })?;

        let env = self.exec_env(PEERS_SESSION, &[(ISO_PEER_NAME, name)], env, io.interactive)?;
        self.exec_in(&peer.id, command, env, io).await
    }

    /// Interactive shell in a running peer
    pub async fn peer_shell(&self, name: &str, io: ExecIo) -> Result<i64> {
        self.peer_exec(name, &[PEER_SHELL.to_string()], &[], io).await
    }

    /// State of every declared peer, in name order
    pub async fn peers_status(&self) -> Result<Vec<PeerStatus>> {
        let peers = self.peers_spec()?;
        let mut statuses = Vec::with_capacity(peers.peers.len());

        for (name, spec) in &peers.peers {
            let container = self.naming.peer_container(name);
            let found = find_container(self.client.as_ref(), &container).await?;
            let state = match &found {
                None => PeerState::NotCreated,
                Some(c) if c.state.is_running() => PeerState::Running,
                Some(_) => PeerState::Stopped,
            };
            statuses.push(PeerStatus {
                name: name.clone(),
                hostname: spec.hostname.clone(),
                container_id: found.map(|c| c.id.chars().take(12).collect()),
                state,
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_display() {
        assert_eq!(PeerState::Running.to_string(), "running");
        assert_eq!(PeerState::NotCreated.to_string(), "not created");
    }
}
