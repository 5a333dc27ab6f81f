use thiserror::Error;

use crate::types::{AgentId, ContainerId, ContainerKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    // placement
    #[error("No suitable agent found for container kind {kind}")]
    NoSuitableAgent { kind: ContainerKind },
    #[error("No factory registered for container kind {kind}")]
    UnknownKind { kind: ContainerKind },
    #[error("Failed to start container {container_id}: {message}")]
    StartFailed {
        container_id: ContainerId,
        message: String,
    },
    #[error("Factory returned container {returned} for request {requested}")]
    ContainerIdMismatch {
        requested: ContainerId,
        returned: ContainerId,
    },

    // routing
    #[error("Container {container_id} not found")]
    ContainerNotFound { container_id: ContainerId },
    #[error("Agent {agent_id} not found")]
    AgentNotFound { agent_id: AgentId },
    #[error("Agent {agent_id} is no longer available")]
    AgentUnavailable { agent_id: AgentId },

    #[error("Container error: {message}")]
    Container { message: String },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        RegistryError::Internal(message.into())
    }

    pub fn container<S: Into<String>>(message: S) -> Self {
        RegistryError::Container {
            message: message.into(),
        }
    }
}
