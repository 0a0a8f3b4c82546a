//! Container runtime boundary.
//!
//! The control plane only ever talks to the runtime through the
//! [`ContainerRuntime`] and [`ImageStore`] traits, implemented once against
//! the real docker CLI and once as fakes in tests.

mod docker;
mod error;

pub use docker::DockerCli;
pub use error::{RuntimeError, RuntimeResult};

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

/// Specification for creating a new instance.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// Instance name.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Port bindings, `(host_port, container_port)`.
    pub ports: Vec<(u16, u16)>,
    /// Volume bindings, `(host_path, container_path)`, mounted read-write.
    pub volumes: Vec<(String, String)>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// CPU scheduler period in microseconds.
    pub cpu_period: u64,
    /// CPU quota within one period, in microseconds.
    pub cpu_quota: u64,
    /// Memory ceiling in megabytes.
    pub memory_mb: f64,
    /// Storage ceiling (runtime size string).
    pub storage: String,
}

impl CreateSpec {
    /// Create a spec for the given image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Add a port binding.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push((host_port, container_port));
        self
    }

    /// Add a volume binding.
    pub fn volume(mut self, host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Validate the spec before handing it to the runtime.
    pub fn validate(&self) -> RuntimeResult<()> {
        validate_instance_name(&self.name)?;
        validate_image_name(&self.image)?;
        Ok(())
    }
}

/// Inspection result for one instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceState {
    /// Whether the instance exists at all.
    pub exists: bool,
    /// Whether it is currently running.
    pub running: bool,
}

/// Live resource statistics for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuntimeStats {
    /// CPU usage as a percentage of one core.
    pub cpu_percent: f64,
    /// Memory in use, bytes.
    pub mem_used: u64,
    /// Memory ceiling, bytes.
    pub mem_limit: u64,
}

/// Output of an exec inside an instance.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    /// Whether the exec succeeded.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability to create, drive, and observe sandboxed instances.
///
/// All calls are blocking subprocess I/O under the hood and may fail;
/// failures propagate as [`RuntimeError`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a new instance.
    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<()>;

    /// Start a stopped instance.
    async fn start(&self, name: &str) -> RuntimeResult<()>;

    /// Stop a running instance.
    async fn stop(&self, name: &str) -> RuntimeResult<()>;

    /// Remove an instance.
    async fn remove(&self, name: &str) -> RuntimeResult<()>;

    /// Run a command inside the instance and capture its output.
    async fn exec(&self, name: &str, argv: &[&str]) -> RuntimeResult<ExecOutput>;

    /// Copy a local file into the instance.
    async fn copy_into(&self, name: &str, local: &Path, remote: &str) -> RuntimeResult<()>;

    /// Copy a file out of the instance.
    async fn copy_from(&self, name: &str, remote: &str, local: &Path) -> RuntimeResult<()>;

    /// Inspect instance existence and run state.
    async fn inspect(&self, name: &str) -> RuntimeResult<InstanceState>;

    /// Live cpu/memory statistics for a running instance.
    async fn stats(&self, name: &str) -> RuntimeResult<RuntimeStats>;

    /// Reset the runtime's network layer. Instance creation occasionally
    /// fails on a stale network allocation; a reset followed by one retry
    /// recovers it.
    async fn reset_network(&self) -> RuntimeResult<()>;

    /// Argv for an interactive login shell inside the instance, suitable
    /// for spawning on a pseudo-terminal.
    fn shell_command(&self, name: &str, login_user: &str) -> Vec<String>;
}

/// Capability to check for and build instance base images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;

    /// Build the image from a Dockerfile in the given context.
    async fn build_image(&self, image: &str, dockerfile: &Path, context: &Path)
    -> RuntimeResult<()>;
}

/// Validate an instance name: alphanumeric plus `-`/`_`, starting with an
/// alphanumeric or underscore.
pub fn validate_instance_name(name: &str) -> RuntimeResult<()> {
    if name.is_empty() {
        return Err(RuntimeError::Malformed(
            "instance name cannot be empty".to_string(),
        ));
    }
    let first = name.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(RuntimeError::Malformed(format!(
            "instance name '{}' must start with an alphanumeric character or underscore",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RuntimeError::Malformed(format!(
            "instance name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Validate an image name: `[registry/][namespace/]name[:tag]`.
pub fn validate_image_name(image: &str) -> RuntimeResult<()> {
    if image.is_empty() {
        return Err(RuntimeError::Malformed(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.contains("..") {
        return Err(RuntimeError::Malformed(
            "image name cannot contain '..'".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '/' || c == ':'
    };
    if !image.chars().all(valid) {
        return Err(RuntimeError::Malformed(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    Ok(())
}
