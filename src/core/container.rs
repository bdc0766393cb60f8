//! Container state precondition.
//!
//! A volume is only archived while the container that owns it is in the
//! required lifecycle state (`exited`), so nothing writes to it mid-backup.
//! The registry is only ever read.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::ListContainersOptions;
use thiserror::Error;
use tracing::{debug, trace};

/// Lifecycle phase reported by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

/// State a container must be in before its volume is archived.
pub const REQUIRED_STATE: ContainerState = ContainerState::Exited;

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "restarting" => Ok(Self::Restarting),
            "removing" => Ok(Self::Removing),
            "exited" => Ok(Self::Exited),
            "dead" => Ok(Self::Dead),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error(
        "Cannot communicate with docker. Make sure docker daemon is running. Error: '{reason}'"
    )]
    RegistryUnavailable { reason: String },

    #[error("Found multiple containers with name '{container}': {matches:?}")]
    AmbiguousContainer {
        container: String,
        matches: Vec<Vec<String>>,
    },

    #[error(
        "Container '{container}' state of '{observed}' is not in the required state of '{required}'"
    )]
    StatePreconditionFailed {
        container: String,
        observed: ContainerState,
        required: ContainerState,
    },

    #[error("Container '{container}' reported unrecognised state '{state}'")]
    UnknownState { container: String, state: String },
}

/// A container as listed by the registry, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Every name the container is known by, as the runtime reports them (`/name`).
    pub names: Vec<String>,
    pub state: String,
}

impl ContainerSummary {
    fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
    }
}

/// Read-only view of a container runtime.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Check the runtime is reachable.
    async fn ping(&self) -> Result<()>;

    /// List containers (running or not) whose name matches `name`.
    /// The runtime may return partial matches.
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>>;
}

/// Docker Engine API client.
pub struct DockerRegistry {
    docker: Docker,
}

impl DockerRegistry {
    pub fn connect() -> Result<Self, VerificationError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            VerificationError::RegistryUnavailable {
                reason: e.to_string(),
            }
        })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRegistry for DockerRegistry {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self.docker.list_containers(options).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                names: c.names.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }
}

/// Ensure `container_name` is in `required` before its volume is touched.
///
/// Absence of the container is not a failure. With `skip_check` the registry
/// is never contacted.
pub async fn verify_container_state(
    registry: Option<&dyn ContainerRegistry>,
    container_name: &str,
    required: ContainerState,
    skip_check: bool,
) -> Result<(), VerificationError> {
    if skip_check {
        trace!("Not checking container state due to --skip-docker-check flag");
        return Ok(());
    }

    let registry = registry.ok_or_else(|| VerificationError::RegistryUnavailable {
        reason: "no container runtime client configured".to_string(),
    })?;

    registry
        .ping()
        .await
        .map_err(|e| VerificationError::RegistryUnavailable {
            reason: format!("{e:#}"),
        })?;

    let listed = registry
        .list_containers(container_name)
        .await
        .map_err(|e| VerificationError::RegistryUnavailable {
            reason: format!("{e:#}"),
        })?;

    let mut matches: Vec<ContainerSummary> = listed
        .into_iter()
        .filter(|c| c.has_name(container_name))
        .collect();

    debug!(
        container = %container_name,
        matches = matches.len(),
        "Looked up container"
    );

    let container = match matches.len() {
        0 => {
            debug!(container = %container_name, "No container found, continuing");
            return Ok(());
        }
        1 => matches.remove(0),
        _ => {
            return Err(VerificationError::AmbiguousContainer {
                container: container_name.to_string(),
                matches: matches.into_iter().map(|c| c.names).collect(),
            });
        }
    };

    let observed: ContainerState =
        container
            .state
            .parse()
            .map_err(|state| VerificationError::UnknownState {
                container: container_name.to_string(),
                state,
            })?;

    if observed != required {
        return Err(VerificationError::StatePreconditionFailed {
            container: container_name.to_string(),
            observed,
            required,
        });
    }

    debug!(container = %container_name, state = %observed, "Container state verified");
    Ok(())
}
