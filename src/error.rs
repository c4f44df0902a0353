//! Error taxonomy of the messaging and lifecycle core.
//!
//! All contract violations are reported synchronously at the call that
//! violated the contract. Service hooks and factories use [`anyhow`] for
//! their own failures; those are folded into [`CoreError::Hook`] with the
//! service and phase attached.

use crate::models::ObjectId;
use crate::state::{Operation, ServiceState};
use thiserror::Error;

/// Errors raised by workers, signals/slots, services and the registry
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Signal '{signal}' is already connected to slot '{slot}'")]
    AlreadyConnected { signal: String, slot: String },

    #[error("Service '{service}' cannot {operation} while {state}")]
    InvalidState {
        service: String,
        operation: Operation,
        state: ServiceState,
    },

    #[error("Endpoint '{0}' has been destroyed")]
    DanglingEndpoint(String),

    #[error("Worker '{0}' is stopped")]
    WorkerStopped(String),

    #[error(
        "Cannot block on worker '{0}' from a current-thread async runtime; \
         use the async_* calls and join() instead"
    )]
    BlockingInRuntime(String),

    #[error("Task on worker '{worker}' panicked: {message}")]
    TaskPanicked { worker: String, message: String },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Unknown signal '{0}'")]
    UnknownSignal(String),

    #[error("Unknown slot '{0}'")]
    UnknownSlot(String),

    #[error("Signature mismatch on '{name}': expected {expected}, found {found}")]
    SignatureMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Data object holds {found}, not {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Data object {0} has expired")]
    ExpiredObject(ObjectId),

    #[error("Service '{service}' has no object bound to key '{key}'")]
    MissingObject { service: String, key: String },

    #[error("No factory registered for service type '{0}'")]
    UnknownServiceType(String),

    #[error("Identifier '{0}' is already in use")]
    DuplicateId(String),

    #[error("Service '{service}' failed while {phase}: {message}")]
    Hook {
        service: String,
        phase: &'static str,
        message: String,
    },
}

impl CoreError {
    /// Build an [`InvalidState`](CoreError::InvalidState) error.
    ///
    /// With the `strict-lifecycle` feature enabled this is fatal in debug
    /// builds.
    pub fn invalid_state(service: &str, operation: Operation, state: ServiceState) -> Self {
        tracing::error!(
            "Lifecycle misuse: service '{}' cannot {} while {}",
            service,
            operation,
            state
        );

        #[cfg(feature = "strict-lifecycle")]
        debug_assert!(
            false,
            "service '{service}' cannot {operation} while {state}"
        );

        CoreError::InvalidState {
            service: service.to_string(),
            operation,
            state,
        }
    }

    /// Wrap a hook failure with the service and lifecycle phase it came from.
    pub fn hook(service: &str, phase: &'static str, err: anyhow::Error) -> Self {
        CoreError::Hook {
            service: service.to_string(),
            phase,
            message: format!("{err:#}"),
        }
    }
}

/// Result alias used across the crate
pub type CoreResult<T> = Result<T, CoreError>;
