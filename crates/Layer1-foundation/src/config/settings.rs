//! Per-invocation settings
//!
//! Everything the runtime would otherwise read from process-wide state (environment
//! variables, the current directory, the invoking user) is captured once into a
//! [`Settings`] value and passed explicitly to every component.

use super::env::{self, normalize_term};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grace period before a stopped container is killed
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for fresh services and the stale sweep
pub const FAST_STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Wait between removing containers and removing their network
pub const NETWORK_SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory the invocation was started from
    pub cwd: PathBuf,
    /// Caller's home directory, for `~` expansion in binds
    pub home: Option<PathBuf>,
    pub uid: u32,
    pub gid: u32,
    /// Normalized terminal type, forwarded only to interactive execs
    pub term: Option<String>,
    /// `ISO_SESSION` override
    pub session_override: Option<String>,
    /// `ISO_CACHE_DIR` host directory replacing cache volumes
    pub cache_dir: Option<PathBuf>,
    /// Helper executable mounted read-only into every container
    pub helper_path: PathBuf,
    pub stop_timeout: Duration,
    pub fast_stop_timeout: Duration,
    pub network_settle_delay: Duration,
    /// Recorded on ephemeral containers so the stale sweep can tell live owners apart
    pub owner_pid: u32,
    pub owner_host: String,
    pub debug: bool,
}

impl Settings {
    /// Capture the invocation's environment
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let helper_path = match std::env::var_os(env::ISO_HELPER) {
            Some(path) => PathBuf::from(path),
            None => std::env::current_exe()?,
        };
        let (uid, gid) = current_ids();

        Ok(Self {
            cwd,
            home: dirs::home_dir(),
            uid,
            gid,
            term: non_empty_var(env::TERM).map(|t| normalize_term(&t)),
            session_override: non_empty_var(env::ISO_SESSION),
            cache_dir: non_empty_var(env::ISO_CACHE_DIR).map(PathBuf::from),
            helper_path,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            fast_stop_timeout: FAST_STOP_TIMEOUT,
            network_settle_delay: NETWORK_SETTLE_DELAY,
            owner_pid: std::process::id(),
            owner_host: current_host(),
            debug: std::env::var(env::DEBUG).map(|v| v != "0").unwrap_or(false),
        })
    }

    /// Settings rooted at `cwd` with no host environment applied
    pub fn for_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            home: None,
            uid: 0,
            gid: 0,
            term: None,
            session_override: None,
            cache_dir: None,
            helper_path: PathBuf::from("/usr/local/bin/iso"),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            fast_stop_timeout: FAST_STOP_TIMEOUT,
            network_settle_delay: NETWORK_SETTLE_DELAY,
            owner_pid: std::process::id(),
            owner_host: current_host(),
            debug: false,
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_term(mut self, term: impl AsRef<str>) -> Self {
        self.term = Some(normalize_term(term.as_ref()));
        self
    }

    pub fn with_session_override(mut self, session: impl Into<String>) -> Self {
        self.session_override = Some(session.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_helper(mut self, path: impl Into<PathBuf>) -> Self {
        self.helper_path = path.into();
        self
    }

    pub fn with_owner(mut self, pid: u32, host: impl Into<String>) -> Self {
        self.owner_pid = pid;
        self.owner_host = host.into();
        self
    }

    /// Skip the network settle delay (the in-memory engine has no endpoint race)
    pub fn without_delays(mut self) -> Self {
        self.network_settle_delay = Duration::ZERO;
        self
    }

    /// Expand a leading `~` or `~/` against the caller's home directory
    pub fn expand_home(&self, path: &str) -> Result<String> {
        let rest = if path == "~" {
            ""
        } else if let Some(rest) = path.strip_prefix("~/") {
            rest
        } else {
            return Ok(path.to_string());
        };

        let home = self
            .home
            .as_deref()
            .ok_or_else(|| Error::Config(format!("cannot expand {:?}: no home directory", path)))?;
        Ok(join_display(home, rest))
    }
}

fn join_display(base: &Path, rest: &str) -> String {
    if rest.is_empty() {
        base.display().to_string()
    } else {
        base.join(rest).display().to_string()
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid have no preconditions and cannot fail
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
fn current_ids() -> (u32, u32) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        let settings = Settings::for_dir("/p").with_home("/home/dev");
        assert_eq!(settings.expand_home("~").unwrap(), "/home/dev");
        assert_eq!(settings.expand_home("~/.ssh").unwrap(), "/home/dev/.ssh");
        assert_eq!(settings.expand_home("/etc/hosts").unwrap(), "/etc/hosts");
        assert_eq!(settings.expand_home("~other/x").unwrap(), "~other/x");
    }

    #[test]
    fn test_expand_home_without_home() {
        let settings = Settings::for_dir("/p");
        assert!(matches!(settings.expand_home("~/x"), Err(Error::Config(_))));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::for_dir("/p").with_term("xterm-ghostty");
        assert_eq!(settings.term.as_deref(), Some("xterm-256color"));
        assert_eq!(settings.stop_timeout, Duration::from_secs(10));
        assert_eq!(settings.fast_stop_timeout, Duration::from_secs(2));
        assert_eq!(settings.network_settle_delay, Duration::from_millis(100));
        assert_eq!(settings.owner_pid, std::process::id());
    }
}
