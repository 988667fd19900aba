//! Error types for registry, backend and console operations.
//!
//! Every variant carries enough context to produce a client-facing message;
//! the HTTP layer maps variants onto status codes in [`crate::api`].

use std::path::PathBuf;

use thiserror::Error;

/// Result type for registry and tunnel operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors surfaced by the registry, the VM backends and the console tunnel.
#[derive(Error, Debug)]
pub enum RegistryError {
    // ========================================================================
    // Lookup / naming
    // ========================================================================
    /// No VM with this name is registered.
    #[error("VM '{name}' not found")]
    NotFound { name: String },

    /// A VM with this name already exists.
    #[error("VM '{name}' already exists")]
    Conflict { name: String },

    /// The name cannot be used for a VM (it ends up in file paths and
    /// hypervisor arguments).
    #[error("invalid VM name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    // ========================================================================
    // Lifecycle gating
    // ========================================================================
    /// Mutation attempted while the VM is not stopped.
    #[error("cannot {operation} VM '{name}' while it is {state}, stop it first")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: String,
    },

    /// Console requested while the VM is not running.
    #[error("VM '{name}' is not running (state: {state})")]
    Unavailable { name: String, state: String },

    /// The VM's local console socket could not be opened.
    #[error("console for VM '{name}' unreachable on port {port}: {source}")]
    ConnectError {
        name: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    // ========================================================================
    // Persistence
    // ========================================================================
    /// The snapshot could not be written; the mutation was not committed.
    #[error("failed to persist snapshot {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// The snapshot could not be read at startup. Recovered by starting empty.
    #[error("snapshot {path} is unreadable: {reason}")]
    LoadCorruption { path: PathBuf, reason: String },

    // ========================================================================
    // Allocation / backend
    // ========================================================================
    /// The allocation counter left the representable console/MAC space.
    #[error("resource allocator exhausted at index {index}")]
    Exhausted { index: u32 },

    /// The hypervisor backend failed a side effect (disk, start, stop, delete).
    #[error("{operation} failed for VM '{name}': {reason}")]
    Backend {
        name: String,
        operation: &'static str,
        reason: String,
    },
}

impl RegistryError {
    /// Build a [`RegistryError::Backend`] from any displayable cause.
    pub fn backend(name: &str, operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Backend {
            name: name.to_string(),
            operation,
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::InvalidName { .. } => "invalid_name",
            Self::InvalidState { .. } => "invalid_state",
            Self::Unavailable { .. } => "unavailable",
            Self::ConnectError { .. } => "console_unreachable",
            Self::Persistence { .. } => "persistence",
            Self::LoadCorruption { .. } => "load_corruption",
            Self::Exhausted { .. } => "exhausted",
            Self::Backend { .. } => "backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_the_operation() {
        let err = RegistryError::InvalidState {
            name: "web1".into(),
            operation: "delete",
            state: "RUNNING".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot delete VM 'web1' while it is RUNNING, stop it first"
        );
        assert_eq!(err.code(), "invalid_state");
    }

    #[test]
    fn backend_helper_formats_reason() {
        let err = RegistryError::backend("db", "create_disk", "disk full");
        assert_eq!(err.to_string(), "create_disk failed for VM 'db': disk full");
    }
}
