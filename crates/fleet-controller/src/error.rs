//! Controller error types.

use fleet_core::ServerId;
use fleet_gateway::GatewayError;
use fleet_instance::InstanceError;
use thiserror::Error;

/// Errors that can occur while orchestrating hosted servers.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("instance error: {0}")]
    Instance(#[from] InstanceError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("server {0} did not become healthy")]
    HealthTimeout(ServerId),

    #[error("server {0} did not start hosting")]
    HostTimeout(ServerId),
}

pub type FleetResult<T> = Result<T, FleetError>;
