use std::time::Duration;
use thiserror::Error;

/// A credential submission that did not pass validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing credential field: {0}")]
    MissingField(&'static str),
    #[error("credentials rejected")]
    Rejected,
    #[error("credential check timed out after {0:?}")]
    UpstreamTimeout(Duration),
}

/// The firewall backend refused or failed to apply a rule change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleInstallError {
    #[error("command '{program} {args}' exited with {status}")]
    Command {
        program: String,
        args: String,
        status: String,
    },
    #[error("rule backend i/o error: {0}")]
    Io(String),
    #[error("rule backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rule backend rejected {0}")]
    Rejected(String),
}

impl From<std::io::Error> for RuleInstallError {
    fn from(e: std::io::Error) -> Self {
        RuleInstallError::Io(e.to_string())
    }
}

/// Errors surfaced along the admission path.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    RuleInstall(#[from] RuleInstallError),
    #[error("session store and firewall state diverged: {0}")]
    StoreConsistency(String),
    #[error("admissions suspended while the firewall backend is degraded")]
    Degraded,
    #[error("invalid redirect policy: {0}")]
    InvalidPolicy(String),
}

impl PortalError {
    /// Whether the submitting client should see this as a credential problem
    /// rather than a gateway fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PortalError::Validation(_))
    }
}
