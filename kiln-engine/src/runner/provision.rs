// Ephemeral runner provisioning
// A Provisioner launches a short-lived execution environment carrying a
// one-shot registration token, and tears it down when the job terminates.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::model::JobId;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("failed to launch environment: {0}")]
    LaunchFailed(String),

    #[error("failed to tear down environment: {0}")]
    TeardownFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the provisioner needs to launch one environment.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub job: JobId,
    /// Labels the environment's runner must register with.
    pub labels: Vec<String>,
    /// One-shot registration token bound to the job's repo scope.
    pub registration_token: String,
}

/// Handle to a launched environment.
#[derive(Debug, Clone)]
pub struct ProvisionedEnv {
    /// Engine-native id (container id for the docker provisioner).
    pub id: String,
    pub name: String,
}

/// Launches and reclaims ephemeral execution environments.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn launch(&self, spec: &ProvisionSpec) -> Result<ProvisionedEnv, ProvisionError>;
    async fn teardown(&self, env: &ProvisionedEnv) -> Result<(), ProvisionError>;
}

/// Image pull behavior for the docker provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// Docker-CLI-backed provisioner.
#[derive(Debug, Clone)]
pub struct DockerProvisioner {
    /// Runner image to launch.
    pub image: String,
    pub pull_policy: PullPolicy,
    /// Base URL the containerized runner phones home to.
    pub server_url: String,
}

impl DockerProvisioner {
    pub fn new(image: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull_policy: PullPolicy::IfNotPresent,
            server_url: server_url.into(),
        }
    }

    pub async fn is_available(&self) -> bool {
        tokio::process::Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn ensure_image(&self) -> Result<(), ProvisionError> {
        let pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => false,
            PullPolicy::IfNotPresent => {
                let inspect = tokio::process::Command::new("docker")
                    .args(["image", "inspect", &self.image])
                    .output()
                    .await?;
                !inspect.status.success()
            }
        };

        if pull {
            let output = tokio::process::Command::new("docker")
                .args(["pull", &self.image])
                .output()
                .await?;
            if !output.status.success() {
                return Err(ProvisionError::LaunchFailed(format!(
                    "docker pull {}: {}",
                    self.image,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn launch(&self, spec: &ProvisionSpec) -> Result<ProvisionedEnv, ProvisionError> {
        if !self.is_available().await {
            return Err(ProvisionError::EngineUnavailable(
                "docker daemon not reachable".to_string(),
            ));
        }
        self.ensure_image().await?;

        let name = format!("kiln-runner-{}", spec.job);
        let labels = spec.labels.join(",");
        let output = tokio::process::Command::new("docker")
            .args([
                "run",
                "--detach",
                "--rm",
                "--name",
                &name,
                "--env",
                &format!("KILN_SERVER_URL={}", self.server_url),
                "--env",
                &format!("KILN_RUNNER_TOKEN={}", spec.registration_token),
                "--env",
                &format!("KILN_RUNNER_LABELS={labels}"),
                &self.image,
            ])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProvisionError::LaunchFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container = %id, job = %spec.job, "launched ephemeral runner");
        Ok(ProvisionedEnv { id, name })
    }

    async fn teardown(&self, env: &ProvisionedEnv) -> Result<(), ProvisionError> {
        let output = tokio::process::Command::new("docker")
            .args(["rm", "--force", &env.id])
            .output()
            .await?;

        // Already-gone containers are a successful teardown.
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                return Err(ProvisionError::TeardownFailed(stderr.trim().to_string()));
            }
        }
        debug!(container = %env.id, "tore down ephemeral runner");
        Ok(())
    }
}

/// Provisioner that records launches without starting anything; used by
/// tests and label-only deployments.
#[derive(Debug, Default)]
pub struct NullProvisioner {
    launched: parking_lot::Mutex<Vec<ProvisionSpec>>,
    torn_down: parking_lot::Mutex<Vec<String>>,
}

impl NullProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<ProvisionSpec> {
        self.launched.lock().clone()
    }

    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().clone()
    }
}

#[async_trait]
impl Provisioner for NullProvisioner {
    async fn launch(&self, spec: &ProvisionSpec) -> Result<ProvisionedEnv, ProvisionError> {
        self.launched.lock().push(spec.clone());
        Ok(ProvisionedEnv {
            id: format!("null-{}", spec.job),
            name: format!("kiln-runner-{}", spec.job),
        })
    }

    async fn teardown(&self, env: &ProvisionedEnv) -> Result<(), ProvisionError> {
        self.torn_down.lock().push(env.id.clone());
        Ok(())
    }
}
