//! Garbage collector
//!
//! - [`sweep_stale`] runs on every session open and reaps ephemeral leftovers of the
//!   project unless their owning process is alive on this host.
//! - [`find_orphaned`] / [`cleanup_orphaned`] work system-wide: a (project directory,
//!   session) group whose directory was deleted is orphaned.
//! - [`stop_all`] / [`stop_all_sessions`] are the operator's big hammers.
//!
//! Teardown here is best-effort: races with concurrent teardown are absorbed and other
//! failures are logged, never returned.

use crate::client::{
    absorb, list_managed, stop_and_remove, ManagedContainer, ManagedFilter, Owner, ResourceClient,
};
use iso_foundation::naming::{session_network, DEFAULT_SESSION};
use iso_foundation::{Identity, Result, Settings};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

// ============================================================================
// Stale sweep
// ============================================================================

/// Reap ephemeral containers of `identity` whose owner is gone, plus dangling ephemeral
/// volumes and unused ephemeral networks of sessions with no live owner. Returns the
/// number of containers reaped.
pub async fn sweep_stale(
    client: &dyn ResourceClient,
    identity: &Identity,
    settings: &Settings,
) -> Result<usize> {
    let filter = ManagedFilter::project(&identity.worktree).ephemeral(true);
    let (live, stale): (Vec<ManagedContainer>, Vec<ManagedContainer>) = list_managed(client, &filter)
        .await?
        .into_iter()
        .partition(|c| owner_alive(c.owner.as_ref(), &settings.owner_host));

    if !stale.is_empty() {
        debug!("Found {} stale ephemeral containers", stale.len());
    }
    for c in &stale {
        debug!("Removing stale container {} (session {})", c.name, c.session);
        if let Err(e) = stop_and_remove(client, &c.id, settings.fast_stop_timeout).await {
            debug!("Failed to remove stale container {}: {}", c.name, e);
        }
    }

    let prefixes = identity.ephemeral_prefixes();
    let live_scopes: BTreeSet<String> = live
        .iter()
        .map(|c| format!("{}-", identity.naming(&c.session).scope()))
        .collect();
    let reapable = |name: &str| {
        prefixes.iter().any(|p| name.starts_with(p.as_str()))
            && !live_scopes.iter().any(|s| name.starts_with(s.as_str()))
    };

    for volume in client.list_volumes(true).await?.iter().filter(|v| reapable(v)) {
        debug!("Removing dangling ephemeral volume {}", volume);
        if let Err(e) = absorb(client.remove_volume(volume).await) {
            debug!("Failed to remove dangling volume {}: {}", volume, e);
        }
    }

    for network in client.list_networks(true).await?.iter().filter(|n| reapable(n)) {
        debug!("Removing unused ephemeral network {}", network);
        if let Err(e) = absorb(client.remove_network(network).await) {
            debug!("Failed to remove unused network {}: {}", network, e);
        }
    }

    Ok(stale.len())
}

/// Only a local owner whose process still exists keeps its containers. Owners on another
/// host (a crashed container or VM, a renamed machine) cannot be checked and are reaped,
/// as are containers without owner labels.
fn owner_alive(owner: Option<&Owner>, local_host: &str) -> bool {
    match owner {
        Some(owner) if owner.host == local_host => process_alive(owner.pid),
        _ => false,
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the process exists and may be signalled
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

// ============================================================================
// Orphans
// ============================================================================

/// A session whose recorded project directory no longer exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedSession {
    pub project_dir: PathBuf,
    pub project: String,
    pub session: String,
    pub containers: Vec<ManagedContainer>,
}

impl OrphanedSession {
    pub fn network(&self) -> String {
        session_network(&self.project, &self.session)
    }
}

/// Every managed container on the engine, all projects
pub async fn list_all(client: &dyn ResourceClient) -> Result<Vec<ManagedContainer>> {
    list_managed(client, &ManagedFilter::everything()).await
}

/// Group managed containers by (project directory, session) and keep the groups whose
/// directory is gone
pub async fn find_orphaned(client: &dyn ResourceClient) -> Result<Vec<OrphanedSession>> {
    let mut groups: BTreeMap<(PathBuf, String), Vec<ManagedContainer>> = BTreeMap::new();
    for c in list_all(client).await? {
        groups
            .entry((c.project_dir.clone(), c.session.clone()))
            .or_default()
            .push(c);
    }

    Ok(groups
        .into_iter()
        .filter(|((dir, _), _)| !dir.exists())
        .map(|((project_dir, session), containers)| OrphanedSession {
            project: containers
                .first()
                .map(|c| c.project.clone())
                .unwrap_or_default(),
            project_dir,
            session,
            containers,
        })
        .collect())
}

/// Find and remove orphaned sessions; returns the number of containers affected
pub async fn cleanup_orphaned(
    client: &dyn ResourceClient,
    settings: &Settings,
    dry_run: bool,
) -> Result<usize> {
    let orphaned = find_orphaned(client).await?;
    Ok(cleanup_sessions(client, settings, &orphaned, dry_run).await)
}

/// Remove the given orphaned sessions; dry runs only count
pub async fn cleanup_sessions(
    client: &dyn ResourceClient,
    settings: &Settings,
    sessions: &[OrphanedSession],
    dry_run: bool,
) -> usize {
    let mut total = 0;
    let mut networks = BTreeSet::new();

    for session in sessions {
        info!(
            "Cleaning up orphaned session {}/{} ({}, {} containers)",
            session.project,
            session.session,
            session.project_dir.display(),
            session.containers.len()
        );
        if dry_run {
            total += session.containers.len();
            continue;
        }

        for c in &session.containers {
            if let Err(e) = stop_and_remove(client, &c.id, settings.stop_timeout).await {
                warn!("Failed to remove container {}: {}", c.name, e);
            }
            total += 1;
        }
        networks.insert(session.network());
    }

    remove_networks(client, settings, &networks).await;
    total
}

// ============================================================================
// Stop everything
// ============================================================================

/// Remove every managed container, then each project's default network
pub async fn stop_all(client: &dyn ResourceClient, settings: &Settings) -> Result<usize> {
    let containers = list_all(client).await?;
    if containers.is_empty() {
        info!("No managed containers to stop");
        return Ok(0);
    }

    let mut networks = BTreeSet::new();
    for c in &containers {
        info!("Stopping {} ({})", c.name, c.project);
        if let Err(e) = stop_and_remove(client, &c.id, settings.stop_timeout).await {
            warn!("Failed to remove container {}: {}", c.name, e);
        }
        networks.insert(session_network(&c.project, DEFAULT_SESSION));
    }

    remove_networks(client, settings, &networks).await;
    info!("Stopped {} managed containers", containers.len());
    Ok(containers.len())
}

/// Remove every container of every session of one project, then each session network
pub async fn stop_all_sessions(
    client: &dyn ResourceClient,
    identity: &Identity,
    settings: &Settings,
) -> Result<usize> {
    let containers = list_managed(client, &ManagedFilter::project(&identity.worktree)).await?;
    if containers.is_empty() {
        info!("No containers to stop for {}", identity.worktree);
        return Ok(0);
    }

    let mut networks = BTreeSet::new();
    for c in &containers {
        info!("Stopping {} (session {})", c.name, c.session);
        if let Err(e) = stop_and_remove(client, &c.id, settings.stop_timeout).await {
            warn!("Failed to remove container {}: {}", c.name, e);
        }
        networks.insert(session_network(&identity.worktree, &c.session));
    }

    remove_networks(client, settings, &networks).await;
    info!("Stopped {} containers of {}", containers.len(), identity.worktree);
    Ok(containers.len())
}

/// Remove networks after the settle delay; the engine detaches endpoints asynchronously
async fn remove_networks(client: &dyn ResourceClient, settings: &Settings, networks: &BTreeSet<String>) {
    if networks.is_empty() {
        return;
    }
    tokio::time::sleep(settings.network_settle_delay).await;
    for name in networks {
        if let Err(e) = absorb(client.remove_network(name).await) {
            warn!("Failed to remove network {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_alive() {
        let me = Owner {
            pid: std::process::id(),
            host: "here".to_string(),
        };
        assert!(owner_alive(Some(&me), "here"));
        assert!(!owner_alive(None, "here"));

        let remote = Owner {
            pid: std::process::id(),
            host: "elsewhere".to_string(),
        };
        assert!(!owner_alive(Some(&remote), "here"));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive_bounds() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_orphan_network_name() {
        let session = OrphanedSession {
            project_dir: PathBuf::from("/gone"),
            project: "demo".to_string(),
            session: DEFAULT_SESSION.to_string(),
            containers: vec![],
        };
        assert_eq!(session.network(), "demo-network");

        let named = OrphanedSession {
            session: "dev".to_string(),
            ..session
        };
        assert_eq!(named.network(), "demo-dev-network");
    }
}
