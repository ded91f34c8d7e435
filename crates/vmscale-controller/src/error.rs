//! Controller error types.

use thiserror::Error;

use vmscale_core::{ConfigError, LifecycleError, RetryError};
use vmscale_loadgen::{PollError, RpcError};
use vmscale_provider::ProviderError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("test log error: {0}")]
    Poll(PollError),

    #[error("load generator call failed: {0}")]
    Retry(RetryError<RpcError>),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("{0} missing from resource configuration")]
    Incomplete(&'static str),

    #[error("stopped by operator")]
    Stopped,
}

impl From<PollError> for ControllerError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::Stopped(_) => ControllerError::Stopped,
            other => ControllerError::Poll(other),
        }
    }
}

impl From<RetryError<RpcError>> for ControllerError {
    fn from(e: RetryError<RpcError>) -> Self {
        match e {
            RetryError::Stopped => ControllerError::Stopped,
            other => ControllerError::Retry(other),
        }
    }
}

impl ControllerError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, ControllerError::Stopped)
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
