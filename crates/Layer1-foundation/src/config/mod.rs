//! Config - descriptors and per-invocation settings
//!
//! - `descriptor.rs` - project / service / peer descriptors
//! - `settings.rs` - explicit per-invocation configuration value
//! - `env.rs` - environment variable names and `KEY=VALUE` helpers

mod descriptor;
pub mod env;
mod settings;

pub use descriptor::{
    Descriptors, PeerSpec, PeersSpec, PortMapping, ProjectDescriptor, ServiceSpec,
    DEFAULT_DOCKERFILE, DEFAULT_WORKDIR,
};
pub use env::{normalize_term, parse_assignment, split_env_assignments};
pub use settings::{Settings, DEFAULT_STOP_TIMEOUT, FAST_STOP_TIMEOUT, NETWORK_SETTLE_DELAY};
