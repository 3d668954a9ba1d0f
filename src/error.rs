//! Error taxonomy for provisioning.
//!
//! Every failure the engine can produce falls into one of four buckets:
//!
//! | Type | Raised by | Retried | Exit code |
//! |------|-----------|---------|-----------|
//! | [`ValidationError`] | descriptor/config construction | never | 1 |
//! | [`PreconditionError`] | gateway probes before planning | never | 1 |
//! | [`ProviderError`] (`Transient`) | gateway calls | bounded backoff | 2 once exhausted |
//! | [`ProviderError`] (`Permanent`) | gateway calls | never | 2 |
//!
//! "Already exists" is not in this list: the gateway reports it as
//! [`crate::gateway::Applied::AlreadyExists`], a success.
//!
//! Error messages never carry credentials. Provider stderr is redacted by
//! the gateway before it is wrapped here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed user input or configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid repository identifier {input:?}: {reason} (expected owner/repo)")]
    InvalidRepository { input: String, reason: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("invalid role {role:?}: role names must be non-empty and contain no whitespace")]
    InvalidRole { role: String },

    #[error("invalid {field} {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// A condition that must hold before any plan is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("required tool not found: {0}")]
    ToolMissing(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("project {project} is not accessible: {reason}")]
    ProjectInaccessible { project: String, reason: String },
}

/// How a provider failure should be treated by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network trouble, 5xx, throttling. Worth another attempt.
    Transient,
    /// Permission denied, bad request, not found. Retrying will not help.
    Permanent,
}

/// A classified failure returned by a [`crate::gateway::ProviderGateway`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Top-level error for the library entry points.
///
/// Plan execution failures do not appear here: they are recorded per entry
/// and surface through [`crate::report::Report`].
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("internal plan error: {0}")]
    Plan(String),
}

impl ProvisionError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Precondition(_) => 1,
            Self::Plan(_) => 2,
        }
    }
}
