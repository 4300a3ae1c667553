//! Lifecycle reconciler
//!
//! [`Environment`] binds one (project, session) pair to a [`ResourceClient`]. Every
//! `ensure_*` operation is check-then-act against an engine that other processes
//! mutate concurrently; "already exists" from a racing writer counts as success.
//!
//! ```text
//! run ─┬─ fresh services (when persistent ones are not all running)
//!      ├─ ensure_shell: running → reuse | stopped → start | absent → image + create
//!      ├─ ExecProxy::run
//!      ├─ stop fresh services (always)
//!      └─ stop session (ephemeral only, always)
//! ```

use crate::client::{
    absorb, find_container, list_managed, stop_and_remove, BuildRequest, ContainerRequest,
    ManagedContainer, ManagedFilter, ResourceClient,
};
use crate::exec::{wrap_command, ExecEnv, ExecIo, ExecProxy, ExecSpec, HELPER_MOUNT};
use crate::gc;
use iso_foundation::config::env::{ISO_GID, ISO_SERVICES, ISO_SESSION, ISO_UID, ISO_WORKDIR, TERM};
use iso_foundation::naming::{labels, SHELL_ROLE};
use iso_foundation::{
    sanitize_path, Descriptors, Error, Naming, Project, Result, Session, Settings,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Presence of the session's shell container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    Missing,
    Running,
    Stopped,
}

/// Image and shell container of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub image: String,
    pub image_exists: bool,
    pub container: String,
    pub state: ShellState,
}

/// One session of one project
pub struct Environment {
    pub(crate) client: Arc<dyn ResourceClient>,
    pub(crate) project: Project,
    pub(crate) descriptors: Descriptors,
    pub(crate) session: Session,
    pub(crate) settings: Settings,
    pub(crate) naming: Naming,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("project", &self.project)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Validate descriptors, derive names and sweep stale ephemeral resources
    pub async fn open(
        client: Arc<dyn ResourceClient>,
        project: Project,
        mut descriptors: Descriptors,
        session: Session,
        settings: Settings,
    ) -> Result<Self> {
        descriptors.validate()?;

        let dockerfile = project.dockerfile_path(&descriptors.project.dockerfile);
        if !dockerfile.is_file() {
            return Err(Error::Config(format!(
                "image descriptor not found at {}",
                dockerfile.display()
            )));
        }
        if !settings.helper_path.exists() {
            return Err(Error::Config(format!(
                "helper binary not found at {}",
                settings.helper_path.display()
            )));
        }

        let naming = project.identity.naming(&session.id);
        debug!("Opening session {} of {}", session, project.identity);

        let env = Self {
            client,
            project,
            descriptors,
            session,
            settings,
            naming,
            cancel: CancellationToken::new(),
        };

        if let Err(e) = gc::sweep_stale(env.client.as_ref(), &env.project.identity, &env.settings).await {
            debug!("Stale resource sweep failed: {}", e);
        }
        Ok(env)
    }

    /// [`Environment::open`] on the project containing `settings.cwd`
    pub async fn discover(
        client: Arc<dyn ResourceClient>,
        descriptors: Descriptors,
        session: Session,
        settings: Settings,
    ) -> Result<Self> {
        let project = Project::discover(&settings.cwd)?;
        Self::open(client, project, descriptors, session, settings).await
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    /// Cancelling this token aborts any in-flight exec of this environment
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ========================================================================
    // Ensure operations
    // ========================================================================

    /// Build the project image unless it already exists
    pub async fn ensure_image(&self) -> Result<()> {
        let image = self.naming.image();
        if self.client.image_exists(&image).await? {
            debug!("Image {} exists", image);
            return Ok(());
        }
        self.build_image(&image).await
    }

    async fn build_image(&self, image: &str) -> Result<()> {
        info!("Building image {}", image);
        let log = self
            .client
            .build_image(&BuildRequest {
                context: self.project.root.clone(),
                dockerfile: self.descriptors.project.dockerfile.clone(),
                tag: image.to_string(),
            })
            .await?;
        debug!("Build log for {}:\n{}", image, log);
        Ok(())
    }

    /// Create missing session and cache volumes
    pub async fn ensure_volumes(&self) -> Result<()> {
        let project = &self.descriptors.project;
        let mut names: Vec<String> = project
            .volumes
            .iter()
            .map(|path| self.naming.session_volume(path))
            .collect();
        if self.settings.cache_dir.is_none() {
            names.extend(project.cache.iter().map(|path| self.naming.cache_volume(path)));
        }

        for name in names {
            if self.client.volume_exists(&name).await? {
                continue;
            }
            debug!("Creating volume {}", name);
            absorb(self.client.create_volume(&name).await)?;
        }
        Ok(())
    }

    /// Create the session network if absent
    pub async fn ensure_network(&self) -> Result<()> {
        self.ensure_named_network(&self.naming.network()).await
    }

    pub(crate) async fn ensure_named_network(&self, name: &str) -> Result<()> {
        if self.client.network_exists(name).await? {
            return Ok(());
        }
        debug!("Creating network {}", name);
        absorb(self.client.create_network(name).await)
    }

    /// Running shell container id: reuse, restart or create
    pub async fn ensure_shell(&self) -> Result<String> {
        let name = self.naming.shell_container();
        match find_container(self.client.as_ref(), &name).await? {
            Some(c) if c.state.is_running() => {
                debug!("Reusing running container {}", name);
                Ok(c.id)
            }
            Some(c) => {
                info!("Starting container {}", name);
                absorb(self.client.start_container(&c.id).await)?;
                Ok(c.id)
            }
            None => {
                self.ensure_image().await?;
                self.create_shell().await
            }
        }
    }

    async fn create_shell(&self) -> Result<String> {
        self.ensure_volumes().await?;

        let network = if self.descriptors.has_services() {
            self.ensure_network().await?;
            Some(self.naming.network())
        } else {
            None
        };

        let project = &self.descriptors.project;
        let mut env = vec![format!("{}={}", ISO_WORKDIR, project.workdir)];
        let readiness = self.descriptors.readiness_list();
        if !readiness.is_empty() {
            env.push(format!("{}={}", ISO_SERVICES, readiness));
        }

        let request = ContainerRequest {
            name: self.naming.shell_container(),
            image: self.naming.image(),
            cmd: init_command(),
            env,
            working_dir: Some(project.workdir.clone()),
            labels: self.base_labels(SHELL_ROLE),
            binds: self.shell_binds()?,
            network,
            auto_remove: self.session.ephemeral,
            privileged: project.privileged,
            extra_hosts: project.extra_hosts.clone(),
            ..Default::default()
        };
        info!("Creating container {}", request.name);
        self.start_container(&request).await
    }

    /// Create and start a container; a same-named container created concurrently is adopted
    pub async fn start_container(&self, request: &ContainerRequest) -> Result<String> {
        let id = match self.create_container(request).await {
            Ok(id) => id,
            Err(e) if e.is_already_exists() => {
                debug!("Container {} was created concurrently", request.name);
                find_container(self.client.as_ref(), &request.name)
                    .await?
                    .map(|c| c.id)
                    .ok_or_else(|| Error::NotFound(request.name.clone()))?
            }
            Err(e) => return Err(e),
        };
        absorb(self.client.start_container(&id).await)?;
        Ok(id)
    }

    /// Create a container. A network removed between its ensure and this create (another
    /// process's startup sweep) is recreated once.
    pub(crate) async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        match self.client.create_container(request).await {
            Err(e) if e.is_not_found() => {
                let Some(network) = &request.network else {
                    return Err(e);
                };
                if self.client.network_exists(network).await? {
                    return Err(e);
                }
                debug!("Network {} vanished before {} was created", network, request.name);
                self.ensure_named_network(network).await?;
                self.client.create_container(request).await
            }
            other => other,
        }
    }

    /// Bind mounts shared by the shell and peer containers
    pub(crate) fn shell_binds(&self) -> Result<Vec<String>> {
        let project = &self.descriptors.project;
        let mut binds = vec![
            format!("{}:{}", self.project.root.display(), project.workdir),
            format!("{}:{}:ro", self.settings.helper_path.display(), HELPER_MOUNT),
        ];

        for path in &project.volumes {
            binds.push(format!("{}:{}", self.naming.session_volume(path), path));
        }

        for path in &project.cache {
            match &self.settings.cache_dir {
                Some(dir) => {
                    let host = dir.join(sanitize_path(path));
                    std::fs::create_dir_all(&host)?;
                    binds.push(format!("{}:{}", host.display(), path));
                }
                None => binds.push(format!("{}:{}", self.naming.cache_volume(path), path)),
            }
        }

        for spec in &project.binds {
            binds.push(expand_bind(spec, &self.settings)?);
        }
        Ok(binds)
    }

    /// Labels recorded on every container, regardless of session
    pub(crate) fn ownership_labels(&self, session: &str, name: &str) -> BTreeMap<String, String> {
        [
            (labels::MANAGED, labels::TRUE.to_string()),
            (labels::PROJECT_NAME, self.project.identity.worktree.clone()),
            (labels::PROJECT_DIR, self.project.root.display().to_string()),
            (labels::SESSION, session.to_string()),
            (labels::NAME, name.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Ownership labels of this session; ephemeral sessions also record their owner
    pub(crate) fn base_labels(&self, name: &str) -> BTreeMap<String, String> {
        let mut map = self.ownership_labels(&self.session.id, name);
        let ephemeral = if self.session.ephemeral {
            map.insert(labels::OWNER_PID.to_string(), self.settings.owner_pid.to_string());
            map.insert(labels::OWNER_HOST.to_string(), self.settings.owner_host.clone());
            labels::TRUE
        } else {
            labels::FALSE
        };
        map.insert(labels::EPHEMERAL.to_string(), ephemeral.to_string());
        map
    }

    /// Exec environment: fixed values < project defaults < caller overrides
    pub(crate) fn exec_env(
        &self,
        session: &str,
        extra: &[(&str, &str)],
        overrides: &[String],
        interactive: bool,
    ) -> Result<Vec<String>> {
        let mut env = ExecEnv::new();
        env.set(ISO_WORKDIR, self.descriptors.project.workdir.clone())
            .set(ISO_SESSION, session)
            .set(ISO_UID, self.settings.uid.to_string())
            .set(ISO_GID, self.settings.gid.to_string());
        for (key, value) in extra {
            env.set(*key, *value);
        }
        if interactive {
            if let Some(term) = &self.settings.term {
                env.set(TERM, term.clone());
            }
        }
        env.extend_map(&self.descriptors.project.environment);
        env.apply_assignments(overrides)?;
        Ok(env.into_vec())
    }

    pub(crate) fn exec_working_dir(&self) -> String {
        map_workdir(&self.project, &self.settings.cwd, &self.descriptors.project.workdir)
    }

    pub(crate) async fn exec_in(
        &self,
        container: &str,
        command: &[String],
        env: Vec<String>,
        io: ExecIo,
    ) -> Result<i64> {
        let spec = ExecSpec {
            cmd: wrap_command(command),
            env,
            working_dir: self.exec_working_dir(),
        };
        ExecProxy::new(self.client.clone(), self.cancel.clone())
            .run(container, spec, io)
            .await
    }

    /// Remove a network, absorbing "not found"; other failures are logged
    pub(crate) async fn remove_network_quietly(&self, name: &str) {
        if let Err(e) = absorb(self.client.remove_network(name).await) {
            warn!("Failed to remove network {}: {}", name, e);
        }
    }

    // ========================================================================
    // Session operations
    // ========================================================================

    /// Run a command; ephemeral sessions are torn down afterwards whatever the outcome
    pub async fn run(&self, command: &[String], env: &[String], io: ExecIo) -> Result<i64> {
        let result = self.run_command(command, env, io).await;
        if self.session.ephemeral {
            if let Err(e) = self.stop().await {
                warn!("Failed to clean up ephemeral session {}: {}", self.session, e);
            }
        }
        result
    }

    /// Run a command in the shell container and return its exit code
    pub async fn run_command(&self, command: &[String], env: &[String], io: ExecIo) -> Result<i64> {
        if command.is_empty() {
            return Err(Error::InvalidInput("no command given".to_string()));
        }

        let mut fresh = Vec::new();
        let result = self.run_with_services(command, env, io, &mut fresh).await;
        self.stop_fresh_services(&fresh).await;
        result
    }

    async fn run_with_services(
        &self,
        command: &[String],
        env: &[String],
        io: ExecIo,
        fresh: &mut Vec<String>,
    ) -> Result<i64> {
        let env = self.exec_env(&self.session.id, &[], env, io.interactive)?;

        if self.descriptors.has_services() && !self.persistent_services_running().await? {
            self.start_fresh_services(&new_run_id(), fresh).await?;
        }

        let container = self.ensure_shell().await?;
        self.exec_in(&container, command, env, io).await
    }

    /// Bring up a persistent session: image, services, shell
    pub async fn start(&self) -> Result<String> {
        self.ensure_image().await?;
        if self.descriptors.has_services() {
            self.start_all_services().await?;
        }
        self.ensure_shell().await
    }

    pub async fn build(&self) -> Result<()> {
        self.ensure_image().await
    }

    /// Remove the image and build it again
    pub async fn rebuild(&self) -> Result<()> {
        let image = self.naming.image();
        if self.client.image_exists(&image).await? {
            info!("Removing image {}", image);
            absorb(self.client.remove_image(&image).await)?;
        }
        self.build_image(&image).await
    }

    /// Remove the shell container only; services and volumes stay
    pub async fn reset(&self) -> Result<()> {
        let name = self.naming.shell_container();
        match find_container(self.client.as_ref(), &name).await? {
            Some(c) => {
                stop_and_remove(self.client.as_ref(), &c.id, self.settings.stop_timeout).await?;
                info!("Container {} reset, it will be recreated on next run", name);
            }
            None => info!("Container {} does not exist", name),
        }
        Ok(())
    }

    /// Tear down every container, the network and the volumes of this session
    pub async fn stop(&self) -> Result<()> {
        let filter = ManagedFilter::project(&self.project.identity.worktree).session(&self.session.id);
        let containers = list_managed(self.client.as_ref(), &filter).await?;

        if containers.is_empty() {
            info!("No containers to stop for {}", self.naming.scope());
        }
        for c in &containers {
            debug!("Stopping {} ({})", c.name, c.role);
            if let Err(e) = stop_and_remove(self.client.as_ref(), &c.id, self.settings.stop_timeout).await {
                warn!("Failed to remove {}, continuing cleanup: {}", c.name, e);
            }
        }

        if !containers.is_empty() {
            tokio::time::sleep(self.settings.network_settle_delay).await;
        }
        self.remove_network_quietly(&self.naming.network()).await;

        for path in &self.descriptors.project.volumes {
            let name = self.naming.session_volume(path);
            match self.client.volume_exists(&name).await {
                Ok(true) => {
                    debug!("Removing volume {}", name);
                    if let Err(e) = absorb(self.client.remove_volume(&name).await) {
                        warn!("Failed to remove volume {}: {}", name, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to check volume {}: {}", name, e),
            }
        }

        if self.session.ephemeral {
            let prefix = self.naming.session_volume_prefix();
            match self.client.list_volumes(true).await {
                Ok(dangling) => {
                    for name in dangling.iter().filter(|v| v.starts_with(&prefix)) {
                        debug!("Removing dangling volume {}", name);
                        if let Err(e) = absorb(self.client.remove_volume(name).await) {
                            debug!("Failed to remove dangling volume {}: {}", name, e);
                        }
                    }
                }
                Err(e) => debug!("Failed to list dangling volumes: {}", e),
            }
        }
        Ok(())
    }

    /// Remove the cache volumes of the declared cache paths, returning the names removed
    pub async fn prune(&self) -> Result<Vec<String>> {
        let cache = &self.descriptors.project.cache;
        if cache.is_empty() {
            info!("No cache volumes configured");
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for path in cache {
            let name = self.naming.cache_volume(path);
            if !self.client.volume_exists(&name).await? {
                debug!("Cache volume {} does not exist", name);
                continue;
            }
            info!("Removing cache volume {} ({})", name, path);
            match absorb(self.client.remove_volume(&name).await) {
                Ok(()) => removed.push(name),
                Err(e) => warn!("Failed to remove cache volume {}: {}", name, e),
            }
        }
        Ok(removed)
    }

    pub async fn status(&self) -> Result<Status> {
        let image = self.naming.image();
        let container = self.naming.shell_container();
        let image_exists = self.client.image_exists(&image).await?;
        let state = match find_container(self.client.as_ref(), &container).await? {
            None => ShellState::Missing,
            Some(c) if c.state.is_running() => ShellState::Running,
            Some(_) => ShellState::Stopped,
        };
        Ok(Status {
            image,
            image_exists,
            container,
            state,
        })
    }

    /// Managed containers of this project, every session
    pub async fn list(&self) -> Result<Vec<ManagedContainer>> {
        list_managed(
            self.client.as_ref(),
            &ManagedFilter::project(&self.project.identity.worktree),
        )
        .await
    }
}

/// PID 1 of shell and peer containers
pub(crate) fn init_command() -> Vec<String> {
    vec![HELPER_MOUNT.to_string(), "_internal-init".to_string()]
}

fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// In-container working directory for a caller at `cwd`
pub fn map_workdir(project: &Project, cwd: &Path, workdir: &str) -> String {
    match project.relative_offset(cwd) {
        Some(rel) if !rel.as_os_str().is_empty() => {
            format!("{}/{}", workdir.trim_end_matches('/'), rel.display())
        }
        _ => workdir.to_string(),
    }
}

/// Expand `~` in the host part of a `host:container[:opts]` bind
pub fn expand_bind(spec: &str, settings: &Settings) -> Result<String> {
    match spec.split_once(':') {
        Some((host, rest)) => Ok(format!("{}:{}", settings.expand_home(host)?, rest)),
        None => Ok(spec.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iso_foundation::Identity;

    #[test]
    fn test_map_workdir() {
        let project = Project::new("/p", Identity::single("p"));
        assert_eq!(map_workdir(&project, Path::new("/p/sub"), "/workspace"), "/workspace/sub");
        assert_eq!(map_workdir(&project, Path::new("/p/a/b"), "/workspace/"), "/workspace/a/b");
        assert_eq!(map_workdir(&project, Path::new("/p"), "/workspace"), "/workspace");
        assert_eq!(map_workdir(&project, Path::new("/other"), "/workspace"), "/workspace");
        assert_eq!(map_workdir(&project, Path::new("/p/../etc"), "/workspace"), "/workspace");
    }

    #[test]
    fn test_expand_bind() {
        let settings = Settings::for_dir("/p").with_home("/home/dev");
        assert_eq!(
            expand_bind("~/.ssh:/root/.ssh:ro", &settings).unwrap(),
            "/home/dev/.ssh:/root/.ssh:ro"
        );
        assert_eq!(expand_bind("~:/h", &settings).unwrap(), "/home/dev:/h");
        assert_eq!(expand_bind("/data:/data", &settings).unwrap(), "/data:/data");
        assert!(expand_bind("~/x:/x", &Settings::for_dir("/p")).is_err());
    }

    #[test]
    fn test_run_id_shape() {
        let a = new_run_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, new_run_id());
    }
}
