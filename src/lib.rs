//! Provisions isolated, per-sample Kubernetes sandboxes for evaluation
//! workloads. Installs a Helm release per sample, exposes a uniform sandbox
//! environment (`exec`, `read_file`, `write_file`, `connection`), and tears
//! the release down on completion.

#[macro_use]
extern crate tracing;

pub mod cmd;
pub mod config;
pub mod errors;
pub mod kubeconfig;
pub mod logging;
pub mod manager;
pub mod pod;
pub mod release;
pub mod sandbox;
pub mod values;

pub use config::{ResolvedConfig, RestartedContainerBehavior, SandboxConfig, SandboxConfigInput};
pub use errors::{Result, SandboxError};
pub use manager::ReleaseManager;
pub use pod::PodInfo;
pub use release::Release;
pub use sandbox::Sandbox;
