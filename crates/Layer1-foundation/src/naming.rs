//! Naming & identity
//!
//! Every engine resource name is a pure function of the project [`Identity`], the
//! session id and a role or container path:
//!
//! | Resource | Name |
//! |----------|------|
//! | image | `<worktree>-shell` |
//! | shell container | `<worktree>[-<session>]-shell` |
//! | session network | `<worktree>[-<session>]-network` |
//! | session volume | `<worktree>[-<session>]-<sanitized path>` |
//! | cache volume | `<base>-cache-<sanitized path>` |
//! | service | `<worktree>[-<session>]_<service>` |
//! | fresh service | `<worktree>[-<session>]_<service>-fresh-<run id>` |
//! | peer | `<worktree>-iso-peer-<peer>` |
//! | peers network | `<worktree>-iso-peers` unless overridden |
//!
//! The `default` session omits the session segment.

use std::fmt;

/// Session id whose resources carry no session segment
pub const DEFAULT_SESSION: &str = "default";

/// Session label value recorded on peer containers
pub const PEERS_SESSION: &str = "peers";

/// Container role label for the shell container
pub const SHELL_ROLE: &str = "shell";

/// Ownership labels set on every managed container
pub mod labels {
    pub const MANAGED: &str = "iso.managed";
    pub const PROJECT_NAME: &str = "iso.project.name";
    pub const PROJECT_DIR: &str = "iso.project.dir";
    pub const SESSION: &str = "iso.session";
    pub const NAME: &str = "iso.name";
    pub const EPHEMERAL: &str = "iso.ephemeral";
    pub const SERVICE: &str = "iso.service";
    pub const SERVICE_NAME: &str = "iso.service.name";
    pub const FRESH: &str = "iso.fresh";
    pub const PEER: &str = "iso.peer";
    pub const PEER_NAME: &str = "iso.peer.name";
    pub const OWNER_PID: &str = "iso.owner.pid";
    pub const OWNER_HOST: &str = "iso.owner.host";

    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
}

/// Trim leading/trailing `/` and replace the remaining ones with `-`
pub fn sanitize_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "-")
}

// ============================================================================
// Identity
// ============================================================================

/// Project identity: cache scope (base) and isolation scope (worktree)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Base repository name, shared by all of its worktrees
    pub base: String,
    /// Worktree (or plain checkout) name
    pub worktree: String,
}

impl Identity {
    pub fn new(base: impl Into<String>, worktree: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            worktree: worktree.into(),
        }
    }

    /// Identity of a checkout that is not a linked worktree
    pub fn single(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            base: name.clone(),
            worktree: name,
        }
    }

    pub fn is_worktree(&self) -> bool {
        self.base != self.worktree
    }

    pub fn image(&self) -> String {
        format!("{}-shell", self.worktree)
    }

    pub fn cache_volume(&self, path: &str) -> String {
        format!("{}-cache-{}", self.base, sanitize_path(path))
    }

    pub fn peer_container(&self, peer: &str) -> String {
        format!("{}-iso-peer-{}", self.worktree, peer)
    }

    pub fn peers_network(&self, overridden: Option<&str>) -> String {
        match overridden {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}-iso-peers", self.worktree),
        }
    }

    /// Name prefixes of resources left behind by ephemeral sessions
    pub fn ephemeral_prefixes(&self) -> [String; 2] {
        [
            format!("{}-eph-", self.worktree),
            format!("{}-ephemeral-", self.worktree),
        ]
    }

    /// Names scoped to one session of this identity
    pub fn naming(&self, session: &str) -> Naming {
        Naming::new(self.clone(), session)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_worktree() {
            write!(f, "{} (worktree of {})", self.worktree, self.base)
        } else {
            f.write_str(&self.worktree)
        }
    }
}

// ============================================================================
// Naming
// ============================================================================

/// Session-scoped names for one (identity, session) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    identity: Identity,
    session: String,
}

impl Naming {
    pub fn new(identity: Identity, session: impl Into<String>) -> Self {
        Self {
            identity,
            session: session.into(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// `<worktree>` for the default session, `<worktree>-<session>` otherwise
    pub fn scope(&self) -> String {
        session_scope(&self.identity.worktree, &self.session)
    }

    pub fn image(&self) -> String {
        self.identity.image()
    }

    pub fn shell_container(&self) -> String {
        format!("{}-shell", self.scope())
    }

    pub fn network(&self) -> String {
        format!("{}-network", self.scope())
    }

    pub fn session_volume(&self, path: &str) -> String {
        format!("{}-{}", self.scope(), sanitize_path(path))
    }

    /// Prefix shared by this session's volumes
    pub fn session_volume_prefix(&self) -> String {
        format!("{}-", self.scope())
    }

    pub fn cache_volume(&self, path: &str) -> String {
        self.identity.cache_volume(path)
    }

    pub fn service_container(&self, service: &str) -> String {
        format!("{}_{}", self.scope(), service)
    }

    pub fn fresh_service_container(&self, service: &str, run_id: &str) -> String {
        format!("{}_{}-fresh-{}", self.scope(), service, run_id)
    }

    pub fn peer_container(&self, peer: &str) -> String {
        self.identity.peer_container(peer)
    }

    pub fn peers_network(&self, overridden: Option<&str>) -> String {
        self.identity.peers_network(overridden)
    }
}

/// Network name of a (project, session) pair as recorded in container labels
pub fn session_network(project: &str, session: &str) -> String {
    format!("{}-network", session_scope(project, session))
}

fn session_scope(project: &str, session: &str) -> String {
    if session == DEFAULT_SESSION {
        project.to_string()
    } else {
        format!("{}-{}", project, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/a/b/"), "a-b");
        assert_eq!(sanitize_path("/root/.cache/go-build"), "root-.cache-go-build");
        assert_eq!(sanitize_path("data"), "data");
    }

    #[test]
    fn test_default_session_names() {
        let naming = Identity::single("demo").naming(DEFAULT_SESSION);
        assert_eq!(naming.image(), "demo-shell");
        assert_eq!(naming.shell_container(), "demo-shell");
        assert_eq!(naming.network(), "demo-network");
        assert_eq!(naming.session_volume("/var/lib/data"), "demo-var-lib-data");
        assert_eq!(naming.service_container("db"), "demo_db");
        assert_eq!(naming.fresh_service_container("db", "r1"), "demo_db-fresh-r1");
    }

    #[test]
    fn test_named_session_names() {
        let naming = Identity::single("demo").naming("eph-abc");
        assert_eq!(naming.image(), "demo-shell");
        assert_eq!(naming.shell_container(), "demo-eph-abc-shell");
        assert_eq!(naming.network(), "demo-eph-abc-network");
        assert_eq!(naming.session_volume("/data/"), "demo-eph-abc-data");
        assert_eq!(naming.service_container("db"), "demo-eph-abc_db");
        assert_eq!(naming.session_volume_prefix(), "demo-eph-abc-");
    }

    #[test]
    fn test_names_are_stable() {
        let a = Identity::new("repo", "feature").naming("s1");
        let b = Identity::new("repo", "feature").naming("s1");
        assert_eq!(a.shell_container(), b.shell_container());
        assert_eq!(a.session_volume("/x"), b.session_volume("/x"));
    }

    #[test]
    fn test_cache_shared_across_worktrees() {
        let main = Identity::new("repo", "repo").naming("default");
        let feature = Identity::new("repo", "repo-feature").naming("default");

        assert_eq!(
            main.cache_volume("/root/.cargo"),
            feature.cache_volume("/root/.cargo")
        );
        assert_eq!(main.cache_volume("/root/.cargo"), "repo-cache-root-.cargo");
        assert_ne!(
            main.session_volume("/root/.cargo"),
            feature.session_volume("/root/.cargo")
        );
    }

    #[test]
    fn test_peer_names() {
        let id = Identity::single("demo");
        assert_eq!(id.peer_container("a"), "demo-iso-peer-a");
        assert_eq!(id.peers_network(None), "demo-iso-peers");
        assert_eq!(id.peers_network(Some("")), "demo-iso-peers");
        assert_eq!(id.peers_network(Some("lab")), "lab");
    }

    #[test]
    fn test_ephemeral_prefixes() {
        let [eph, long] = Identity::single("demo").ephemeral_prefixes();
        assert_eq!(eph, "demo-eph-");
        assert_eq!(long, "demo-ephemeral-");
    }

    #[test]
    fn test_session_network() {
        assert_eq!(session_network("demo", "default"), "demo-network");
        assert_eq!(session_network("demo", "dev"), "demo-dev-network");
    }
}
