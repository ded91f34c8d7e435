//! Provider error types.

use std::time::Duration;

use thiserror::Error;
use vmscale_core::Retryable;

use crate::api::ResourceKind;

/// Errors surfaced by a cloud capability provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{kind} {id} is still in use: {reason}")]
    DependencyViolation {
        kind: ResourceKind,
        id: String,
        reason: String,
    },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} rejected: {reason}")]
    Rejected { operation: String, reason: String },
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists { .. })
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled(_)
                | ProviderError::Timeout { .. }
                | ProviderError::DependencyViolation { .. }
        )
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_not_retried() {
        let nf = ProviderError::NotFound {
            kind: ResourceKind::Instance,
            id: "i-1".into(),
        };
        assert!(nf.is_not_found());
        assert!(!nf.is_retryable());

        let dup = ProviderError::AlreadyExists {
            kind: ResourceKind::SecurityGroup,
            name: "lg-security-group".into(),
        };
        assert!(dup.is_already_exists());
        assert!(!dup.is_retryable());
    }

    #[test]
    fn transient_errors_are_retried() {
        assert!(ProviderError::Throttled("run_instance".into()).is_retryable());
        assert!(
            ProviderError::DependencyViolation {
                kind: ResourceKind::SecurityGroup,
                id: "sg-1".into(),
                reason: "instance i-1".into(),
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::Rejected {
                operation: "register_target".into(),
                reason: "not running".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_names_the_resource() {
        let err = ProviderError::NotFound {
            kind: ResourceKind::TargetGroup,
            id: "tg-arn".into(),
        };
        assert_eq!(err.to_string(), "target group not found: tg-arn");
    }
}
