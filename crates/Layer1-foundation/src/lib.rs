//! # iso-foundation
//!
//! Foundation layer for iso:
//! - Error: error taxonomy with structured engine error categories
//! - Config: project/service/peer descriptors and per-invocation [`Settings`]
//! - Naming: deterministic resource names and project identity
//! - Project: `.iso` discovery and git worktree detection
//! - Session: ephemeral vs. persistent session resolution
//! - Logging: tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod naming;
pub mod project;
pub mod session;

// ============================================================================
// Error
// ============================================================================
pub use error::{EngineErrorKind, Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    split_env_assignments, Descriptors, PeerSpec, PeersSpec, PortMapping, ProjectDescriptor,
    ServiceSpec, Settings,
};

// ============================================================================
// Identity
// ============================================================================
pub use naming::{sanitize_path, Identity, Naming, DEFAULT_SESSION};
pub use project::Project;
pub use session::Session;
