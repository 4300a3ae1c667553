//! Project discovery
//!
//! A project is the nearest ancestor of the working directory containing a `.iso`
//! directory. Its identity distinguishes linked git worktrees from their base
//! repository so caches can be shared while sessions stay isolated.

use crate::error::{Error, Result};
use crate::naming::Identity;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Name of the descriptor directory
pub const ISO_DIR: &str = ".iso";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Directory containing `.iso`
    pub root: PathBuf,
    pub identity: Identity,
}

impl Project {
    /// Walk upward from `start` to the first directory containing `.iso`
    pub fn discover(start: &Path) -> Result<Self> {
        let root = find_root(start).ok_or_else(|| {
            Error::Config(format!(
                "no {} directory found in {} or any parent directory",
                ISO_DIR,
                start.display()
            ))
        })?;
        let identity = detect_identity(&root);
        debug!("Discovered project {} at {}", identity, root.display());
        Ok(Self { root, identity })
    }

    /// Project at a known root with an explicit identity
    pub fn new(root: impl Into<PathBuf>, identity: Identity) -> Self {
        Self {
            root: root.into(),
            identity,
        }
    }

    pub fn iso_dir(&self) -> PathBuf {
        self.root.join(ISO_DIR)
    }

    pub fn dockerfile_path(&self, dockerfile: &str) -> PathBuf {
        self.root.join(dockerfile)
    }

    /// Offset of `cwd` below the project root, `None` if it lies outside
    pub fn relative_offset(&self, cwd: &Path) -> Option<PathBuf> {
        let rel = cwd.strip_prefix(&self.root).ok()?;
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return None;
        }
        Some(rel.to_path_buf())
    }
}

fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(ISO_DIR).is_dir())
        .map(Path::to_path_buf)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Identity of `root`, consulting git for linked worktrees
pub fn detect_identity(root: &Path) -> Identity {
    let common = run_git(root, &["rev-parse", "--git-common-dir"]);
    let git_dir = run_git(root, &["rev-parse", "--git-dir"]);

    match (common, git_dir) {
        (Some(common), Some(git_dir)) => identity_from_git_dirs(root, &common, &git_dir),
        _ => Identity::single(dir_name(root)),
    }
}

/// Pure worktree detection from `git rev-parse` output.
///
/// A linked worktree reports a git dir different from the common dir; the base name is
/// the directory holding the shared `.git`.
pub fn identity_from_git_dirs(root: &Path, common_dir: &str, git_dir: &str) -> Identity {
    let worktree = dir_name(root);
    if common_dir == git_dir {
        return Identity::single(worktree);
    }

    let common = Path::new(common_dir);
    let common = if common.is_absolute() {
        common.to_path_buf()
    } else {
        root.join(common)
    };
    let common = normalize(&common);

    match (common.file_name(), common.parent()) {
        (Some(name), Some(repo)) if name == ".git" => Identity::new(dir_name(repo), worktree),
        _ => Identity::single(worktree),
    }
}

fn run_git(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

/// Lexically resolve `.` and `..`
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_plain_checkout() {
        let id = identity_from_git_dirs(Path::new("/src/demo"), ".git", ".git");
        assert_eq!(id, Identity::single("demo"));
    }

    #[test]
    fn test_identity_linked_worktree() {
        let id = identity_from_git_dirs(
            Path::new("/src/demo-feature"),
            "/src/demo/.git",
            "/src/demo/.git/worktrees/demo-feature",
        );
        assert_eq!(id, Identity::new("demo", "demo-feature"));
        assert!(id.is_worktree());
    }

    #[test]
    fn test_identity_relative_common_dir() {
        let id = identity_from_git_dirs(
            Path::new("/src/wt/feature"),
            "../../demo/.git",
            "/src/demo/.git/worktrees/feature",
        );
        assert_eq!(id, Identity::new("demo", "feature"));
    }

    #[test]
    fn test_identity_bare_common_dir() {
        let id = identity_from_git_dirs(Path::new("/src/feature"), "/srv/demo.git", "/srv/demo.git/worktrees/feature");
        assert_eq!(id, Identity::single("feature"));
    }

    #[test]
    fn test_discover_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(root.join(".iso")).unwrap();
        std::fs::create_dir_all(root.join("a/b")).unwrap();

        let project = Project::discover(&root.join("a/b")).unwrap();
        assert_eq!(project.root, root);
        assert_eq!(project.identity.worktree, "demo");
        assert_eq!(project.iso_dir(), root.join(".iso"));
    }

    #[test]
    fn test_discover_without_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let err = Project::discover(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_relative_offset() {
        let project = Project::new("/p", Identity::single("p"));
        assert_eq!(project.relative_offset(Path::new("/p/sub")), Some(PathBuf::from("sub")));
        assert_eq!(project.relative_offset(Path::new("/p")), Some(PathBuf::new()));
        assert_eq!(project.relative_offset(Path::new("/other")), None);
        assert_eq!(project.relative_offset(Path::new("/p/../etc")), None);
    }
}
