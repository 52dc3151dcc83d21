//! Instance manager error types.

use fleet_core::ServerId;
use thiserror::Error;

/// Errors that can occur while managing server containers.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("server not found: {0}")]
    NotFound(ServerId),

    #[error("port {port} is already used by server {owner}")]
    PortConflict { port: u16, owner: ServerId },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container engine error: {0}")]
    Engine(String),

    #[error("container {0} has no metadata label")]
    MissingMetadata(String),

    #[error("metadata label error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type InstanceResult<T> = Result<T, InstanceError>;
