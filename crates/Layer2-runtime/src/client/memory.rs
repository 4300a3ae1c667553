//! In-memory engine
//!
//! Behaves like the real engine where the runtime depends on it: unique container
//! names, auto-remove on stop, network endpoint bookkeeping, named volumes created on
//! first mount, dangling/unused listing filters and engine-style error categories.
//! Exec results are scripted through an [`ExecResult`] handler, and every successful
//! mutating call is recorded so tests can assert idempotency.

use super::{
    BuildRequest, ContainerFilter, ContainerRequest, ContainerState, ContainerSummary,
    ExecAttachment, ExecOutput, ExecRequest, ResourceClient,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{stream, StreamExt};
use iso_foundation::{EngineErrorKind, Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One exec as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    /// Name of the target container
    pub container: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
}

impl ExecCall {
    /// The command after the supervisor's `--` separator
    pub fn user_command(&self) -> &[String] {
        match self.cmd.iter().position(|arg| arg == "--") {
            Some(pos) => &self.cmd[pos + 1..],
            None => &self.cmd,
        }
    }

    /// Effective value of `key` (last assignment wins)
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Scripted outcome of an exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Never reach EOF
    pub hang: bool,
    /// Inspections that report no exit code yet, after EOF
    pub exit_delay: u32,
}

impl ExecResult {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn stdout(output: impl Into<String>) -> Self {
        Self {
            stdout: output.into(),
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, output: impl Into<String>) -> Self {
        self.stderr = output.into();
        self
    }

    pub fn with_exit(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// The engine records the exit code only after `inspections` more inspects
    pub fn with_exit_delay(mut self, inspections: u32) -> Self {
        self.exit_delay = inspections;
        self
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }
}

type ExecHandler = Arc<dyn Fn(&ExecCall) -> ExecResult + Send + Sync>;

/// A handful of shell builtins, enough to script lifecycle scenarios
fn builtin_exec(call: &ExecCall) -> ExecResult {
    let cmd = call.user_command();
    let args = cmd.get(1..).unwrap_or_default();
    let parse_code = |s: &str| s.trim().parse::<i64>().unwrap_or(0);

    match cmd.first().map(String::as_str) {
        Some("echo") => ExecResult::stdout(format!("{}\n", args.join(" "))),
        Some("true") => ExecResult::exit(0),
        Some("false") => ExecResult::exit(1),
        Some("exit") => ExecResult::exit(args.first().map(|a| parse_code(a.as_str())).unwrap_or(0)),
        Some("pwd") => ExecResult::stdout(format!(
            "{}\n",
            call.working_dir.as_deref().unwrap_or("/")
        )),
        Some("printenv") => match args.first().and_then(|key| call.env_value(key)) {
            Some(value) => ExecResult::stdout(format!("{}\n", value)),
            None => ExecResult::exit(1),
        },
        Some("sh") if args.len() == 2 && args[0] == "-c" => match args[1].strip_prefix("exit ") {
            Some(code) => ExecResult::exit(parse_code(code)),
            None => ExecResult::exit(0),
        },
        _ => ExecResult::exit(0),
    }
}

fn not_found(op: &str, what: &str, name: &str) -> Error {
    Error::engine(
        op,
        EngineErrorKind::NotFound,
        format!("No such {}: {}", what, name),
    )
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone)]
struct MemContainer {
    id: String,
    state: ContainerState,
    created: chrono::DateTime<Utc>,
    request: ContainerRequest,
}

impl MemContainer {
    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.request.name.clone(),
            image: self.request.image.clone(),
            state: self.state,
            labels: self.request.labels.clone(),
            created: Some(self.created),
        }
    }

    fn mounts_volume(&self, volume: &str) -> bool {
        self.request
            .binds
            .iter()
            .any(|bind| bind.split(':').next() == Some(volume))
    }
}

#[derive(Debug)]
struct MemExec {
    container_id: String,
    call: ExecCall,
    exit_code: Option<i64>,
    pending_inspects: u32,
}

#[derive(Debug, Default)]
struct State {
    images: BTreeSet<String>,
    containers: Vec<MemContainer>,
    /// Network name -> attached container ids
    networks: BTreeMap<String, BTreeSet<String>>,
    volumes: BTreeSet<String>,
    execs: HashMap<String, MemExec>,
    exec_calls: Vec<ExecCall>,
    resizes: Vec<(u16, u16)>,
    mutations: Vec<String>,
    build_failure: Option<String>,
}

impl State {
    fn position(&self, id_or_name: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.id == id_or_name || c.request.name == id_or_name)
    }

    fn remove_at(&mut self, index: usize) -> MemContainer {
        let container = self.containers.remove(index);
        for members in self.networks.values_mut() {
            members.remove(&container.id);
        }
        container
    }

    fn record(&mut self, op: &str, target: &str) {
        self.mutations.push(format!("{} {}", op, target));
    }
}

// ============================================================================
// MemoryClient
// ============================================================================

pub struct MemoryClient {
    state: Mutex<State>,
    handler: ExecHandler,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            handler: Arc::new(builtin_exec),
        }
    }

    /// Script exec outcomes
    pub fn with_exec_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ExecCall) -> ExecResult + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Pre-existing image
    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.state.lock().images.insert(image.into());
        self
    }

    /// Make every build fail with `log`
    pub fn fail_builds(&self, log: impl Into<String>) {
        self.state.lock().build_failure = Some(log.into());
    }

    // --- inspection ---

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.state.lock().containers.iter().map(MemContainer::summary).collect()
    }

    pub fn container(&self, name: &str) -> Option<ContainerSummary> {
        let state = self.state.lock();
        state.position(name).map(|i| state.containers[i].summary())
    }

    /// Creation request of a container, by name
    pub fn request(&self, name: &str) -> Option<ContainerRequest> {
        let state = self.state.lock();
        state.position(name).map(|i| state.containers[i].request.clone())
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().images.iter().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    /// Names of containers attached to `network`
    pub fn network_members(&self, network: &str) -> Vec<String> {
        let state = self.state.lock();
        let Some(ids) = state.networks.get(network) else {
            return Vec::new();
        };
        state
            .containers
            .iter()
            .filter(|c| ids.contains(&c.id))
            .map(|c| c.request.name.clone())
            .collect()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state.lock().volumes.iter().cloned().collect()
    }

    /// Successful mutating calls, `"<op> <target>"`
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state.lock().exec_calls.clone()
    }

    /// Terminal sizes sent to execs, `(width, height)`
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.state.lock().resizes.clone()
    }

    /// Names of all resources (containers, networks, volumes) containing `needle`
    pub fn resources_matching(&self, needle: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .containers
            .iter()
            .map(|c| c.request.name.clone())
            .chain(state.networks.keys().cloned())
            .chain(state.volumes.iter().cloned())
            .filter(|name| name.contains(needle))
            .collect()
    }
}

#[async_trait]
impl ResourceClient for MemoryClient {
    // ========================================================================
    // Images
    // ========================================================================

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().images.contains(image))
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(log) = state.build_failure.clone() {
            return Err(Error::engine("build image", EngineErrorKind::Other, log));
        }
        state.images.insert(request.tag.clone());
        state.record("build_image", &request.tag);
        Ok(format!(
            "Step 1/1 : FROM {}\nSuccessfully tagged {}:latest\n",
            request.dockerfile, request.tag
        ))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.images.insert(image.to_string());
        state.record("pull_image", image);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.images.remove(image) {
            return Err(not_found("remove image", "image", image));
        }
        state.record("remove_image", image);
        Ok(())
    }

    // ========================================================================
    // Containers
    // ========================================================================

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|c| filter.all || c.state.is_running())
            .filter(|c| filter.matches_labels(&c.request.labels))
            .map(MemContainer::summary)
            .collect())
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        let mut state = self.state.lock();
        const OP: &str = "create container";

        if state.position(&request.name).is_some() {
            return Err(Error::engine(
                OP,
                EngineErrorKind::AlreadyExists,
                format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    request.name
                ),
            ));
        }
        if !state.images.contains(&request.image) {
            return Err(not_found(OP, "image", &request.image));
        }
        if let Some(network) = &request.network {
            if !state.networks.contains_key(network) {
                return Err(not_found(OP, "network", network));
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        for bind in &request.binds {
            if let Some(source) = bind.split(':').next() {
                if !source.starts_with('/') {
                    state.volumes.insert(source.to_string());
                }
            }
        }
        if let Some(network) = &request.network {
            if let Some(members) = state.networks.get_mut(network) {
                members.insert(id.clone());
            }
        }

        state.containers.push(MemContainer {
            id: id.clone(),
            state: ContainerState::Stopped,
            created: Utc::now(),
            request: request.clone(),
        });
        state.record("create_container", &request.name);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .position(id)
            .ok_or_else(|| not_found("start container", "container", id))?;

        let container = &mut state.containers[index];
        if container.state.is_running() {
            return Err(Error::engine(
                "start container",
                EngineErrorKind::NotModified,
                "container already started",
            ));
        }
        container.state = ContainerState::Running;
        let name = container.request.name.clone();
        state.record("start_container", &name);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .position(id)
            .ok_or_else(|| not_found("stop container", "container", id))?;

        if !state.containers[index].state.is_running() {
            return Err(Error::engine(
                "stop container",
                EngineErrorKind::NotModified,
                "container already stopped",
            ));
        }

        let name = state.containers[index].request.name.clone();
        if state.containers[index].request.auto_remove {
            state.remove_at(index);
        } else {
            state.containers[index].state = ContainerState::Stopped;
        }
        state.record("stop_container", &name);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .position(id)
            .ok_or_else(|| not_found("remove container", "container", id))?;

        if state.containers[index].state.is_running() && !force {
            return Err(Error::engine(
                "remove container",
                EngineErrorKind::Conflict,
                "You cannot remove a running container. Stop the container before attempting removal or force remove",
            ));
        }

        let removed = state.remove_at(index);
        state.record("remove_container", &removed.request.name);
        Ok(())
    }

    // ========================================================================
    // Exec
    // ========================================================================

    async fn create_exec(&self, container: &str, request: &ExecRequest) -> Result<String> {
        let mut state = self.state.lock();
        let index = state
            .position(container)
            .ok_or_else(|| not_found("create exec", "container", container))?;

        let target = &state.containers[index];
        if !target.state.is_running() {
            return Err(Error::engine(
                "create exec",
                EngineErrorKind::Conflict,
                format!("Container {} is not running", target.id),
            ));
        }

        let call = ExecCall {
            container: target.request.name.clone(),
            cmd: request.cmd.clone(),
            env: request.env.clone(),
            working_dir: request.working_dir.clone(),
            tty: request.tty,
        };
        let exec_id = Uuid::new_v4().simple().to_string();
        let container_id = target.id.clone();

        state.exec_calls.push(call.clone());
        state.execs.insert(
            exec_id.clone(),
            MemExec {
                container_id,
                call,
                exit_code: None,
                pending_inspects: 0,
            },
        );
        Ok(exec_id)
    }

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<ExecAttachment> {
        let call = {
            let state = self.state.lock();
            let exec = state
                .execs
                .get(exec_id)
                .ok_or_else(|| not_found("attach exec", "exec instance", exec_id))?;
            if state.position(&exec.container_id).is_none() {
                return Err(not_found("attach exec", "container", &exec.container_id));
            }
            exec.call.clone()
        };

        let result = (self.handler)(&call);

        let mut chunks = Vec::new();
        if tty {
            let combined = format!("{}{}", result.stdout, result.stderr);
            if !combined.is_empty() {
                chunks.push(ExecOutput::Console(Bytes::from(combined)));
            }
        } else {
            if !result.stdout.is_empty() {
                chunks.push(ExecOutput::StdOut(Bytes::from(result.stdout.clone())));
            }
            if !result.stderr.is_empty() {
                chunks.push(ExecOutput::StdErr(Bytes::from(result.stderr.clone())));
            }
        }

        let output = stream::iter(chunks.into_iter().map(Ok));
        let output = if result.hang {
            output.chain(stream::pending()).boxed()
        } else {
            if let Some(exec) = self.state.lock().execs.get_mut(exec_id) {
                exec.exit_code = Some(result.exit_code);
                exec.pending_inspects = result.exit_delay;
            }
            output.boxed()
        };

        Ok(ExecAttachment {
            output,
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<()> {
        let mut state = self.state.lock();
        if !state.execs.contains_key(exec_id) {
            return Err(not_found("resize exec", "exec instance", exec_id));
        }
        state.resizes.push((width, height));
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock();
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| not_found("inspect exec", "exec instance", exec_id))?;
        if exec.pending_inspects > 0 {
            exec.pending_inspects -= 1;
            return Ok(None);
        }
        Ok(exec.exit_code)
    }

    // ========================================================================
    // Networks
    // ========================================================================

    async fn list_networks(&self, unused_only: bool) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .networks
            .iter()
            .filter(|(_, members)| !unused_only || members.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().networks.contains_key(name))
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.networks.contains_key(name) {
            return Err(Error::engine(
                "create network",
                EngineErrorKind::AlreadyExists,
                format!("network with name {} already exists", name),
            ));
        }
        state.networks.insert(name.to_string(), BTreeSet::new());
        state.record("create_network", name);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.networks.get(name) {
            None => return Err(not_found("remove network", "network", name)),
            Some(members) if !members.is_empty() => {
                return Err(Error::engine(
                    "remove network",
                    EngineErrorKind::Conflict,
                    format!("error while removing network: network {} has active endpoints", name),
                ))
            }
            Some(_) => {}
        }
        state.networks.remove(name);
        state.record("remove_network", name);
        Ok(())
    }

    async fn connect_network(&self, network: &str, container: &str, _aliases: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .position(container)
            .ok_or_else(|| not_found("connect network", "container", container))?;
        let id = state.containers[index].id.clone();
        let name = state.containers[index].request.name.clone();

        let members = state
            .networks
            .get_mut(network)
            .ok_or_else(|| not_found("connect network", "network", network))?;
        if !members.insert(id) {
            return Err(Error::engine(
                "connect network",
                EngineErrorKind::AlreadyExists,
                format!("endpoint with name {} already exists in network {}", name, network),
            ));
        }
        state.record("connect_network", &format!("{} {}", network, name));
        Ok(())
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    async fn list_volumes(&self, dangling_only: bool) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .volumes
            .iter()
            .filter(|v| !dangling_only || !state.containers.iter().any(|c| c.mounts_volume(v)))
            .cloned()
            .collect())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().volumes.contains(name))
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.volumes.insert(name.to_string());
        state.record("create_volume", name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.volumes.contains(name) {
            return Err(not_found("remove volume", "volume", name));
        }
        if state.containers.iter().any(|c| c.mounts_volume(name)) {
            return Err(Error::engine(
                "remove volume",
                EngineErrorKind::Conflict,
                format!("remove {}: volume is in use", name),
            ));
        }
        state.volumes.remove(name);
        state.record("remove_volume", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> ContainerRequest {
        ContainerRequest {
            name: name.to_string(),
            image: "img".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_container_names_are_unique() {
        let client = MemoryClient::new().with_image("img");
        client.create_container(&request("a")).await.unwrap();
        let err = client.create_container(&request("a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_auto_remove_on_stop() {
        let client = MemoryClient::new().with_image("img");
        let mut req = request("a");
        req.auto_remove = true;
        let id = client.create_container(&req).await.unwrap();
        client.start_container(&id).await.unwrap();
        client.stop_container(&id, Duration::ZERO).await.unwrap();

        assert!(client.containers().is_empty());
        let err = client.remove_container(&id, false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_network_endpoints() {
        let client = MemoryClient::new().with_image("img");
        client.create_network("net").await.unwrap();
        let mut req = request("a");
        req.network = Some("net".to_string());
        let id = client.create_container(&req).await.unwrap();

        assert_eq!(client.network_members("net"), vec!["a"]);
        assert!(client.list_networks(true).await.unwrap().is_empty());
        let err = client.remove_network("net").await.unwrap_err();
        assert_eq!(err.engine_kind(), Some(EngineErrorKind::Conflict));

        let err = client.connect_network("net", "a", &[]).await.unwrap_err();
        assert!(err.is_already_exists());

        client.remove_container(&id, true).await.unwrap();
        assert_eq!(client.list_networks(true).await.unwrap(), vec!["net"]);
        client.remove_network("net").await.unwrap();
    }

    #[tokio::test]
    async fn test_named_volumes_created_on_mount() {
        let client = MemoryClient::new().with_image("img");
        let mut req = request("a");
        req.binds = vec!["data:/data".to_string(), "/host:/host".to_string()];
        let id = client.create_container(&req).await.unwrap();

        assert_eq!(client.volumes(), vec!["data"]);
        assert!(client.list_volumes(true).await.unwrap().is_empty());
        client.remove_container(&id, true).await.unwrap();
        assert_eq!(client.list_volumes(true).await.unwrap(), vec!["data"]);
    }

    #[tokio::test]
    async fn test_scripted_exec() {
        let client = MemoryClient::new()
            .with_image("img")
            .with_exec_handler(|call| ExecResult::stdout(call.user_command().join(" ")).with_exit(3));
        let id = client.create_container(&request("a")).await.unwrap();
        client.start_container(&id).await.unwrap();

        let exec = client
            .create_exec(
                &id,
                &ExecRequest {
                    cmd: vec!["/iso".into(), "--".into(), "make".into(), "test".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let attachment = client.attach_exec(&exec, false).await.unwrap();
        let chunks: Vec<_> = attachment.output.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(client.inspect_exec(&exec).await.unwrap(), Some(3));
        assert_eq!(client.exec_calls()[0].user_command(), ["make", "test"]);
    }

    #[test]
    fn test_builtin_exec() {
        let call = |cmd: &[&str]| ExecCall {
            container: "a".into(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            env: vec!["A=1".into(), "A=2".into()],
            working_dir: Some("/workspace/sub".into()),
            tty: false,
        };
        assert_eq!(builtin_exec(&call(&["echo", "hi"])).stdout, "hi\n");
        assert_eq!(builtin_exec(&call(&["false"])).exit_code, 1);
        assert_eq!(builtin_exec(&call(&["sh", "-c", "exit 7"])).exit_code, 7);
        assert_eq!(builtin_exec(&call(&["printenv", "A"])).stdout, "2\n");
        assert_eq!(builtin_exec(&call(&["pwd"])).stdout, "/workspace/sub\n");
    }
}
