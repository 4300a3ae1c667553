//! In-container supervisor
//!
//! The library side of the helper binary mounted at `/iso` in every container:
//! `in-env run` ([`Supervisor::run`]) and `_internal-init` ([`init_loop`]).

use iso_foundation::config::env::{ISO_GID, ISO_SERVICES, ISO_SESSION, ISO_UID, ISO_WORKDIR};
use iso_foundation::config::DEFAULT_WORKDIR;
use iso_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// Hook run before the main command, relative to the workdir
pub const PRE_RUN_HOOK: &str = ".iso/pre-run.sh";
/// Hook run after the main command, relative to the workdir
pub const POST_RUN_HOOK: &str = ".iso/post-run.sh";

/// `name:port` entry of the readiness list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub name: String,
    pub port: u16,
}

/// Parse a comma-separated `name:port` list
pub fn parse_readiness(list: &str) -> Result<Vec<ServiceEndpoint>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || {
                Error::InvalidInput(format!(
                    "invalid service spec: {} (expected format: service:port)",
                    entry
                ))
            };
            let (name, port) = entry.split_once(':').ok_or_else(invalid)?;
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            if name.is_empty() {
                return Err(invalid());
            }
            Ok(ServiceEndpoint {
                name: name.to_string(),
                port,
            })
        })
        .collect()
}

/// What the supervisor reads from its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEnv {
    pub workdir: PathBuf,
    pub session: Option<String>,
    /// Target user of the main command
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub services: Vec<ServiceEndpoint>,
}

impl SupervisorEnv {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            session: None,
            uid: None,
            gid: None,
            services: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let id = |key: &str| var(key).and_then(|v| v.parse::<u32>().ok());

        Ok(Self {
            workdir: PathBuf::from(var(ISO_WORKDIR).unwrap_or_else(|| DEFAULT_WORKDIR.to_string())),
            session: var(ISO_SESSION),
            uid: id(ISO_UID),
            gid: id(ISO_GID),
            services: match var(ISO_SERVICES) {
                Some(list) => parse_readiness(&list)?,
                None => Vec::new(),
            },
        })
    }

    pub fn with_services(mut self, services: Vec<ServiceEndpoint>) -> Self {
        self.services = services;
        self
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }
}

// ============================================================================
// Readiness
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

/// Wait until every service accepts TCP connections
pub async fn wait_for_services(services: &[ServiceEndpoint], policy: &ReadinessPolicy) -> Result<()> {
    let attempts = policy.attempts.max(1);

    for service in services {
        debug!("Waiting for service {} on port {}", service.name, service.port);
        let mut attempt = 1;
        loop {
            let connect = TcpStream::connect((service.name.as_str(), service.port));
            match tokio::time::timeout(policy.connect_timeout, connect).await {
                Ok(Ok(_)) => {
                    debug!("Service {} ready", service.name);
                    break;
                }
                Ok(Err(e)) => debug!("Service {} not ready: {}", service.name, e),
                Err(_) => debug!("Service {} connect timed out", service.name),
            }

            if attempt >= attempts {
                return Err(Error::ReadinessTimeout {
                    service: service.name.clone(),
                    attempts,
                });
            }
            attempt += 1;
            tokio::time::sleep(policy.interval).await;
        }
    }
    Ok(())
}

// ============================================================================
// in-env run
// ============================================================================

#[derive(Debug, Clone)]
pub struct Supervisor {
    env: SupervisorEnv,
    policy: ReadinessPolicy,
}

impl Supervisor {
    pub fn new(env: SupervisorEnv) -> Self {
        Self {
            env,
            policy: ReadinessPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Readiness wait, pre-run hook, main command, post-run hook.
    ///
    /// Returns the main command's exit code, or the pre-run hook's when it fails.
    pub async fn run(&self, command: &[String]) -> Result<i32> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("no command specified".to_string()))?;

        wait_for_services(&self.env.services, &self.policy).await?;

        let pre = self.env.workdir.join(PRE_RUN_HOOK);
        if pre.is_file() {
            let code = run_hook(&pre).await?;
            if code != 0 {
                debug!("pre-run hook exited with {}", code);
                return Ok(code);
            }
        }

        let mut main = Command::new(program);
        main.args(args);
        self.drop_privileges(&mut main);
        let code = exit_code(main.status().await?);

        let post = self.env.workdir.join(POST_RUN_HOOK);
        if post.is_file() {
            match run_hook(&post).await {
                Ok(0) => {}
                Ok(code) => warn!("post-run hook exited with code {}", code),
                Err(e) => warn!("Failed to run post-run hook: {}", e),
            }
        }
        Ok(code)
    }

    #[cfg(unix)]
    fn drop_privileges(&self, command: &mut Command) {
        let (Some(uid), Some(gid)) = (self.env.uid, self.env.gid) else {
            return;
        };
        // SAFETY: geteuid has no preconditions
        let euid = unsafe { libc::geteuid() };
        if euid == 0 && uid != 0 {
            debug!("Running command as {}:{}", uid, gid);
            command.uid(uid).gid(gid);
        }
    }

    #[cfg(not(unix))]
    fn drop_privileges(&self, _command: &mut Command) {}
}

async fn run_hook(path: &Path) -> Result<i32> {
    let status = Command::new("bash").arg(path).status().await?;
    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

// ============================================================================
// _internal-init
// ============================================================================

/// PID 1 loop: reap children on SIGCHLD and every second, exit on SIGTERM or SIGINT
#[cfg(unix)]
pub async fn init_loop() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut child = signal(SignalKind::child())?;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
            _ = child.recv() => {
                reap_zombies();
            }
            _ = ticker.tick() => {
                reap_zombies();
            }
        }
    }
    debug!("init loop exiting");
    Ok(())
}

/// Collect every exited child without blocking; returns how many were reaped
#[cfg(unix)]
pub fn reap_zombies() -> usize {
    let mut reaped = 0;
    loop {
        let mut status = 0;
        // SAFETY: WNOHANG never blocks and `status` outlives the call
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped += 1;
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn fast_policy(attempts: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts,
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
        }
    }

    fn cmd(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_readiness() {
        let services = parse_readiness("db:5432, cache:6379,").unwrap();
        assert_eq!(
            services,
            vec![
                ServiceEndpoint { name: "db".to_string(), port: 5432 },
                ServiceEndpoint { name: "cache".to_string(), port: 6379 },
            ]
        );
        assert!(parse_readiness("").unwrap().is_empty());
        assert!(parse_readiness("db").is_err());
        assert!(parse_readiness("db:http").is_err());
        assert!(parse_readiness(":80").is_err());
    }

    #[tokio::test]
    async fn test_ready_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let services = vec![ServiceEndpoint { name: "127.0.0.1".to_string(), port }];

        wait_for_services(&services, &fast_policy(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let services = vec![ServiceEndpoint { name: "127.0.0.1".to_string(), port }];

        let err = wait_for_services(&services, &fast_policy(3)).await.unwrap_err();
        match err {
            Error::ReadinessTimeout { service, attempts } => {
                assert_eq!(service, "127.0.0.1");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_readiness_failure_skips_command() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let env = SupervisorEnv::new(dir.path())
            .with_services(vec![ServiceEndpoint { name: "127.0.0.1".to_string(), port }]);

        let result = Supervisor::new(env)
            .with_policy(fast_policy(2))
            .run(&cmd(&["touch", marker.to_str().unwrap()]))
            .await;

        assert!(matches!(result, Err(Error::ReadinessTimeout { .. })));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_exit_code_is_mirrored() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(SupervisorEnv::new(dir.path()));

        assert_eq!(supervisor.run(&cmd(&["sh", "-c", "exit 7"])).await.unwrap(), 7);
        assert_eq!(supervisor.run(&cmd(&["true"])).await.unwrap(), 0);
        assert!(supervisor.run(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_pre_hook_aborts() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".iso")).unwrap();
        std::fs::write(dir.path().join(PRE_RUN_HOOK), "exit 3\n").unwrap();
        let marker = dir.path().join("ran");

        let code = Supervisor::new(SupervisorEnv::new(dir.path()))
            .run(&cmd(&["touch", marker.to_str().unwrap()]))
            .await
            .unwrap();

        assert_eq!(code, 3);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failing_post_hook_keeps_main_code() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".iso")).unwrap();
        std::fs::write(dir.path().join(PRE_RUN_HOOK), "true\n").unwrap();
        std::fs::write(dir.path().join(POST_RUN_HOOK), "exit 9\n").unwrap();

        let code = Supervisor::new(SupervisorEnv::new(dir.path()))
            .run(&cmd(&["sh", "-c", "exit 4"]))
            .await
            .unwrap();
        assert_eq!(code, 4);
    }
}
