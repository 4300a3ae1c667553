//! Exec proxy
//!
//! Runs one command inside a running container and proxies the caller's terminal:
//!
//! ```text
//! create exec -> attach -> [interactive: raw mode + initial size]
//!             -> { stdin pump | output drain | resize listener } -> inspect exit code
//! ```
//!
//! The output drain is raced against the client's cancellation token; cancellation
//! returns [`Error::Cancelled`] without waiting for the remaining output. Raw mode is
//! restored on every exit path by a drop guard.

use crate::client::{ExecOutput, ExecRequest, ResourceClient};
use futures::StreamExt;
use iso_foundation::config::parse_assignment;
use iso_foundation::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// In-container path of the mounted helper binary
pub const HELPER_MOUNT: &str = "/iso";

/// Exit code reported when the engine never recorded one
pub const UNKNOWN_EXIT_CODE: i64 = -1;

/// The engine may report EOF before it records the exit code
const EXIT_POLL_ATTEMPTS: u32 = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wrap a user command with the in-container supervisor
pub fn wrap_command(command: &[String]) -> Vec<String> {
    [HELPER_MOUNT, "in-env", "run", "--"]
        .iter()
        .map(|s| s.to_string())
        .chain(command.iter().cloned())
        .collect()
}

// ============================================================================
// Environment layering
// ============================================================================

/// Ordered exec environment where later assignments override earlier ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecEnv {
    entries: Vec<(String, String)>,
}

impl ExecEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn extend_map(&mut self, map: &BTreeMap<String, String>) -> &mut Self {
        for (key, value) in map {
            self.set(key.clone(), value.clone());
        }
        self
    }

    /// Apply caller-supplied `KEY=VALUE` words
    pub fn apply_assignments(&mut self, assignments: &[String]) -> Result<&mut Self> {
        for word in assignments {
            let (key, value) = parse_assignment(word).ok_or_else(|| {
                Error::InvalidInput(format!("invalid environment assignment {:?}", word))
            })?;
            self.set(key, value);
        }
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

// ============================================================================
// Caller I/O
// ============================================================================

/// The caller's side of an exec
pub struct ExecIo {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
    /// Raw mode, pseudo-terminal and resize forwarding
    pub interactive: bool,
}

impl ExecIo {
    /// Process stdio; interactive when stdin is a terminal
    pub fn stdio() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            interactive: std::io::stdin().is_terminal(),
        }
    }

    /// Non-interactive I/O over arbitrary streams
    pub fn piped(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            interactive: false,
        }
    }

    /// Empty stdin, discarded output
    pub fn null() -> Self {
        Self::piped(tokio::io::empty(), tokio::io::sink(), tokio::io::sink())
    }
}

impl std::fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecIo")
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

/// Shared in-memory sink, for capturing exec output
#[derive(Debug, Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl AsyncWrite for Capture {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// Terminal
// ============================================================================

/// Restores cooked mode when dropped
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

#[cfg(unix)]
async fn forward_resizes(client: Arc<dyn ResourceClient>, exec_id: String, stop: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!("Cannot listen for terminal resizes: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = winch.recv() => {
                if received.is_none() {
                    break;
                }
                if let Ok((width, height)) = crossterm::terminal::size() {
                    if let Err(e) = client.resize_exec(&exec_id, width, height).await {
                        debug!("Resize failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn forward_resizes(_client: Arc<dyn ResourceClient>, _exec_id: String, stop: CancellationToken) {
    stop.cancelled().await;
}

// ============================================================================
// ExecProxy
// ============================================================================

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
}

pub struct ExecProxy {
    client: Arc<dyn ResourceClient>,
    cancel: CancellationToken,
}

impl ExecProxy {
    pub fn new(client: Arc<dyn ResourceClient>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Run `spec` in `container` and return the command's exit code
    pub async fn run(&self, container: &str, spec: ExecSpec, io: ExecIo) -> Result<i64> {
        let ExecIo {
            mut stdin,
            mut stdout,
            mut stderr,
            interactive,
        } = io;

        let request = ExecRequest {
            cmd: spec.cmd,
            env: spec.env,
            working_dir: Some(spec.working_dir),
            tty: interactive,
        };
        let exec_id = self.client.create_exec(container, &request).await?;
        let attachment = self.client.attach_exec(&exec_id, interactive).await?;
        debug!("Attached exec {} (interactive: {})", exec_id, interactive);

        let _raw_mode = if interactive {
            Some(RawModeGuard::enable()?)
        } else {
            None
        };

        let stop = CancellationToken::new();
        if interactive {
            match crossterm::terminal::size() {
                Ok((width, height)) => {
                    if let Err(e) = self.client.resize_exec(&exec_id, width, height).await {
                        warn!("Failed to set initial terminal size: {}", e);
                    }
                }
                Err(e) => debug!("Terminal size unavailable: {}", e),
            }
            tokio::spawn(forward_resizes(
                self.client.clone(),
                exec_id.clone(),
                stop.clone(),
            ));
        }

        let mut input = attachment.input;
        let stdin_pump = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut input).await {
                debug!("Stdin forwarding ended: {}", e);
            }
            let _ = input.shutdown().await;
        });

        let mut output = attachment.output;
        let drain = async {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    ExecOutput::StdOut(bytes) | ExecOutput::Console(bytes) => {
                        stdout.write_all(&bytes).await?;
                        stdout.flush().await?;
                    }
                    ExecOutput::StdErr(bytes) => {
                        stderr.write_all(&bytes).await?;
                        stderr.flush().await?;
                    }
                }
            }
            Ok::<(), Error>(())
        };

        let outcome = tokio::select! {
            result = drain => result,
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        };

        stop.cancel();
        // A blocked read on process stdin cannot be interrupted; the task is detached
        stdin_pump.abort();
        outcome?;

        self.exit_code(&exec_id).await
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i64> {
        for attempt in 0..EXIT_POLL_ATTEMPTS {
            if let Some(code) = self.client.inspect_exec(exec_id).await? {
                return Ok(code);
            }
            if attempt + 1 < EXIT_POLL_ATTEMPTS {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        }
        warn!("Exec {} reported no exit code", exec_id);
        Ok(UNKNOWN_EXIT_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ContainerRequest, ExecResult, MemoryClient};

    async fn running_container(client: &MemoryClient) -> String {
        let id = client
            .create_container(&ContainerRequest {
                name: "demo-shell".to_string(),
                image: "demo-shell".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        client.start_container(&id).await.unwrap();
        id
    }

    fn spec(cmd: &[&str]) -> ExecSpec {
        ExecSpec {
            cmd: wrap_command(&cmd.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
            env: vec![],
            working_dir: "/workspace".to_string(),
        }
    }

    #[test]
    fn test_wrap_command() {
        assert_eq!(
            wrap_command(&["ls".to_string(), "-la".to_string()]),
            vec!["/iso", "in-env", "run", "--", "ls", "-la"]
        );
    }

    #[test]
    fn test_env_later_wins() {
        let mut env = ExecEnv::new();
        env.set("ISO_WORKDIR", "/workspace").set("TERM", "xterm");
        let mut defaults = BTreeMap::new();
        defaults.insert("TERM".to_string(), "dumb".to_string());
        defaults.insert("RUST_LOG".to_string(), "info".to_string());
        env.extend_map(&defaults);
        env.apply_assignments(&["RUST_LOG=debug".to_string()]).unwrap();

        assert_eq!(
            env.into_vec(),
            vec!["ISO_WORKDIR=/workspace", "TERM=dumb", "RUST_LOG=debug"]
        );
    }

    #[test]
    fn test_env_rejects_bad_assignment() {
        let mut env = ExecEnv::new();
        assert!(matches!(
            env.apply_assignments(&["1BAD=x".to_string()]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_code_and_streams() {
        let client = Arc::new(
            MemoryClient::new()
                .with_image("demo-shell")
                .with_exec_handler(|_| ExecResult::stdout("out\n").with_stderr("err\n").with_exit(7)),
        );
        let id = running_container(&client).await;
        let (out, err) = (Capture::new(), Capture::new());

        let proxy = ExecProxy::new(client.clone(), CancellationToken::new());
        let code = proxy
            .run(
                &id,
                spec(&["make"]),
                ExecIo::piped(tokio::io::empty(), out.clone(), err.clone()),
            )
            .await
            .unwrap();

        assert_eq!(code, 7);
        assert_eq!(out.contents(), "out\n");
        assert_eq!(err.contents(), "err\n");
        assert!(!client.exec_calls()[0].tty);
    }

    #[tokio::test]
    async fn test_exit_code_recorded_after_eof() {
        let client = Arc::new(
            MemoryClient::new()
                .with_image("demo-shell")
                .with_exec_handler(|_| ExecResult::exit(3).with_exit_delay(2)),
        );
        let id = running_container(&client).await;

        let proxy = ExecProxy::new(client, CancellationToken::new());
        let code = proxy.run(&id, spec(&["true"]), ExecIo::null()).await.unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_exit_code_never_recorded() {
        let client = Arc::new(
            MemoryClient::new()
                .with_image("demo-shell")
                .with_exec_handler(|_| ExecResult::exit(3).with_exit_delay(u32::MAX)),
        );
        let id = running_container(&client).await;

        let proxy = ExecProxy::new(client, CancellationToken::new());
        let code = proxy.run(&id, spec(&["true"]), ExecIo::null()).await.unwrap();
        assert_eq!(code, UNKNOWN_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_pending_output() {
        let client = Arc::new(
            MemoryClient::new()
                .with_image("demo-shell")
                .with_exec_handler(|_| ExecResult::hang()),
        );
        let id = running_container(&client).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let proxy = ExecProxy::new(client, cancel);
        let err = proxy
            .run(&id, spec(&["sleep", "infinity"]), ExecIo::null())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_exec_on_stopped_container_fails() {
        let client = Arc::new(MemoryClient::new().with_image("demo-shell"));
        let id = running_container(&client).await;
        client.stop_container(&id, Duration::ZERO).await.unwrap();

        let proxy = ExecProxy::new(client, CancellationToken::new());
        let err = proxy.run(&id, spec(&["true"]), ExecIo::null()).await.unwrap_err();
        assert!(err.engine_kind().is_some());
    }
}
