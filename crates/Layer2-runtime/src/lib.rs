//! iso-runtime: container lifecycle runtime
//!
//! Layer2 - everything that talks to the container engine
//!
//! # Modules
//!
//! - `client`: [`ResourceClient`] boundary, bollard engine, in-memory engine, label queries
//! - `reconcile`: [`Environment`], idempotent ensure operations and session lifecycle
//! - `services`: persistent and per-run ("fresh") service containers
//! - `peers`: symmetric peer containers on a shared network
//! - `exec`: TTY-aware exec proxy with cancellation
//! - `gc`: stale ephemeral sweep, orphan detection, stop-all
//! - `supervisor`: in-container readiness wait, hooks and PID 1 reaping
//!
//! # Example
//!
//! ```ignore
//! use iso_runtime::{DockerClient, Environment, ExecIo};
//! use iso_foundation::{Descriptors, ProjectDescriptor, Session, Settings};
//!
//! let settings = Settings::from_env()?;
//! let client = Arc::new(DockerClient::connect()?);
//! let session = Session::resolve(None, &settings);
//! let env = Environment::discover(client, Descriptors::new(ProjectDescriptor::new()), session, settings).await?;
//!
//! let code = env.run(&["cargo".into(), "test".into()], &[], ExecIo::stdio()).await?;
//! std::process::exit(code as i32);
//! ```

pub mod client;
pub mod exec;
pub mod gc;
pub mod peers;
pub mod reconcile;
pub mod services;
pub mod supervisor;

// ============================================================================
// Re-exports
// ============================================================================
pub use client::{
    ContainerRuntime, ContainerState, DockerClient, ManagedContainer, ManagedFilter, MemoryClient,
    ResourceClient, Role,
};
pub use exec::{Capture, ExecEnv, ExecIo, ExecProxy, ExecSpec};
pub use gc::OrphanedSession;
pub use peers::{PeerState, PeerStatus};
pub use reconcile::{Environment, ShellState, Status};
pub use supervisor::{ReadinessPolicy, Supervisor, SupervisorEnv};
