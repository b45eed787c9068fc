//! Error types for reconciliation operations.
//!
//! Every collaborator call and every service operation returns
//! [`VcmResult`]. The variants mirror how a failure is recovered:
//! stale references are skipped, missing controller objects fall back to
//! create, duplicate creates count as success, an exhausted VLAN pool
//! leaves one interface unmanaged, and a lost connection ends the current
//! event task so the supervisor can reconnect.

use std::io;
use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type VcmResult<T> = Result<T, VcmError>;

/// Errors that can occur while reconciling.
#[derive(Debug, Error)]
pub enum VcmError {
    /// A hypervisor object vanished while it was being handled.
    #[error("Stale reference to {object}: {message}")]
    StaleReference {
        /// The hypervisor object reference.
        object: String,
        /// Error message.
        message: String,
    },

    /// An object does not exist in the external system.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Object kind (e.g., "virtual-machine").
        kind: String,
        /// Object identifier.
        id: String,
    },

    /// A create raced a prior create of the same object.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Object kind.
        kind: String,
        /// Object identifier.
        id: String,
    },

    /// No VLAN id is left in the allocator.
    #[error("VLAN pool {start}-{end} exhausted")]
    VlanPoolExhausted {
        /// First id of the pool.
        start: u16,
        /// Last id of the pool.
        end: u16,
    },

    /// The session with an external system is gone.
    #[error("Connection to {system} lost: {message}")]
    ConnectionLost {
        /// The system (hypervisor, controller, dataplane).
        system: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// I/O error (reading configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl VcmError {
    /// Creates a stale reference error.
    pub fn stale(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StaleReference {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Creates a connection-lost error.
    pub fn connection_lost(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            system: system.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the hypervisor object vanished mid-handling.
    pub fn is_stale(&self) -> bool {
        matches!(self, VcmError::StaleReference { .. })
    }

    /// Returns true if the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VcmError::NotFound { .. })
    }

    /// Returns true if a create found the object already present.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, VcmError::AlreadyExists { .. })
    }

    /// Returns true if the session with an external system is gone.
    ///
    /// Only this class of error ends the event task; everything else is
    /// contained to the unit of work that raised it.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, VcmError::ConnectionLost { .. })
    }
}
