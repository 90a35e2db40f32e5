//! Typed failures surfaced by every engine operation.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while driving containers, networks and volumes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected before any state was touched.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation is illegal in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Container, network or volume is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A container references a network that does not exist.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// Name is already taken by another resource of the same kind.
    #[error("name already in use: {0}")]
    DuplicateName(String),

    /// Network still has attached containers.
    #[error("network {0} still has attached containers")]
    NetworkInUse(String),

    /// Volume is still referenced by a container.
    #[error("volume {0} is still mounted by a container")]
    VolumeInUse(String),

    /// Two mounts claim the same or nested targets, or disagree on access mode.
    #[error("mount conflict: {0}")]
    MountConflict(String),

    /// Bind source or named volume is missing.
    #[error("mount source not found: {0}")]
    SourceNotFound(String),

    /// No address left in the subnet pool.
    #[error("address pool exhausted on network {0}")]
    AddressExhausted(String),

    /// Readiness probe never passed.
    #[error("container {container} not ready after {attempts} attempts")]
    ReadinessTimeout { container: String, attempts: u32 },

    /// Backend refused to launch the container; it stays in `Created`.
    #[error("backend failed to start {container}: {reason}")]
    BackendStartFailure { container: String, reason: String },

    /// Image provider could not resolve the reference.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Any other backend failure (terminate, exec, network setup).
    #[error("backend error: {0}")]
    Backend(String),

    /// Container system failed its health check.
    #[error("container system is not ready")]
    SystemNotReady,

    /// A deployment step failed; everything already started was unwound.
    #[error("deployment failed at service {service}: {cause} ({} teardown errors)", teardown.len())]
    Deployment {
        service: String,
        cause: Box<EngineError>,
        teardown: Vec<EngineError>,
    },

    /// Teardown finished with errors on some resources.
    #[error("teardown finished with {} errors", .0.len())]
    Teardown(Vec<EngineError>),
}

impl EngineError {
    /// Returns the failure that triggered a deployment rollback, or `self`.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::Deployment { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub(crate) fn backend(err: anyhow::Error) -> Self {
        EngineError::Backend(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_deployment_errors() {
        let err = EngineError::Deployment {
            service: "cache".into(),
            cause: Box::new(EngineError::BackendStartFailure {
                container: "cache".into(),
                reason: "boom".into(),
            }),
            teardown: vec![EngineError::NotFound("db".into())],
        };

        assert!(matches!(
            err.root_cause(),
            EngineError::BackendStartFailure { .. }
        ));
        assert!(err.to_string().contains("1 teardown errors"));
    }

    #[test]
    fn backend_error_keeps_context_chain() {
        let err = anyhow::anyhow!("exit status 125").context("launching web");
        let mapped = EngineError::backend(err);
        assert_eq!(
            mapped.to_string(),
            "backend error: launching web: exit status 125"
        );
    }
}
