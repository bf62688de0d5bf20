use super::state::{ServiceState, TransitionError};
use crate::config::stack::DependencyCondition;
use thiserror::Error;

/// Failures surfaced while ordering, starting, or supervising a stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
    #[error("service `{service}` depends on unknown service `{dependency}`")]
    UnknownDependency { service: String, dependency: String },
    #[error("service `{service}` is not part of the stack")]
    UnknownService { service: String },
    #[error(
        "service `{service}` failed: health probe did not pass after {attempts} attempt(s): {last_error}"
    )]
    ProbeTimeout {
        service: String,
        attempts: u32,
        last_error: String,
    },
    #[error(
        "service `{service}` cannot start: dependency `{dependency}` must be {condition} but is {actual}"
    )]
    DependencyUnmet {
        service: String,
        dependency: String,
        condition: DependencyCondition,
        actual: ServiceState,
    },
    #[error("service `{service}` failed: dependency `{dependency}` stopped")]
    DependencyStopped { service: String, dependency: String },
    #[error("service `{service}` failed: {reason}")]
    StartError { service: String, reason: String },
    #[error("service `{service}` failed: process exited ({})", describe_code(*.code))]
    ServiceExited { service: String, code: Option<i32> },
    #[error("service `{service}` failed: stopped by operator")]
    OperatorStopped { service: String },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("startup interrupted by shutdown")]
    Interrupted,
}

impl CoordinationError {
    /// The service the failure is attributed to, when there is one.
    pub fn service(&self) -> Option<&str> {
        match self {
            CoordinationError::UnknownDependency { service, .. }
            | CoordinationError::UnknownService { service }
            | CoordinationError::ProbeTimeout { service, .. }
            | CoordinationError::DependencyUnmet { service, .. }
            | CoordinationError::DependencyStopped { service, .. }
            | CoordinationError::StartError { service, .. }
            | CoordinationError::ServiceExited { service, .. }
            | CoordinationError::OperatorStopped { service } => Some(service),
            CoordinationError::Transition(TransitionError::ServiceUnknown { service })
            | CoordinationError::Transition(TransitionError::InvalidTransition {
                service, ..
            }) => Some(service),
            CoordinationError::CycleDetected { .. } | CoordinationError::Interrupted => None,
        }
    }
}

pub(crate) fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
