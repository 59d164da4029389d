use rpa_core_types::{EnvironmentId, ErrorClass, RpaError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LeaseError {
    #[error("unknown environment {0}")]
    UnknownEnvironment(EnvironmentId),
    #[error("environment {0} is disabled")]
    EnvironmentDisabled(EnvironmentId),
    #[error("lease for environment {0} not acquired in time")]
    LeaseTimeout(EnvironmentId),
    #[error("instance creation failed for environment {environment}: {reason}")]
    InstanceCreationFailed {
        environment: EnvironmentId,
        reason: String,
    },
}

impl LeaseError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LeaseError::LeaseTimeout(_) | LeaseError::InstanceCreationFailed { .. } => {
                ErrorClass::Transient
            }
            LeaseError::UnknownEnvironment(_) | LeaseError::EnvironmentDisabled(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn into_rpa_error(self) -> RpaError {
        self.into()
    }
}

impl From<LeaseError> for RpaError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::LeaseTimeout(env) => RpaError::LeaseTimeout(env),
            LeaseError::InstanceCreationFailed {
                environment,
                reason,
            } => RpaError::InstanceCreationFailed {
                environment,
                reason,
            },
            other @ (LeaseError::UnknownEnvironment(_) | LeaseError::EnvironmentDisabled(_)) => {
                RpaError::InvalidReference(other.to_string())
            }
        }
    }
}
