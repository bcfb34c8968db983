pub mod audit;
pub mod config;
pub mod credentials;
pub mod error;
pub mod local_users;
pub mod rules;
pub mod session;

use std::net::Ipv4Addr;

pub use audit::{Outcome, SubmissionLog, SubmissionRecord};
pub use config::{LogLevel, RedirectPolicy, ValidatorKind};
pub use credentials::{AcceptAll, CredentialValidator, Credentials};
pub use error::{PortalError, RuleInstallError, ValidationError};
pub use local_users::LocalUsers;
pub use rules::{PacketMeta, Protocol, Rule, RuleDiff, RuleTable, Verdict};
pub use session::{Clock, ClientId, Grant, ManualClock, SessionStore, SystemClock};

use tokio::sync::oneshot;

/// How a credential submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted(Grant),
    /// The credentials were not accepted.
    Rejected(String),
    /// The gateway could not safely admit anyone right now.
    Unavailable(String),
}

#[derive(Debug)]
pub struct AdmissionRequest {
    /// Taken from the transport connection, never from the request body.
    pub client: Ipv4Addr,
    pub credentials: Credentials,
    pub tx: oneshot::Sender<AdmissionOutcome>,
}

#[derive(Debug)]
pub struct LogoffRequest {
    pub client: Ipv4Addr,
    pub tx: oneshot::Sender<bool>,
}

#[derive(Debug)]
pub enum CoreRequest {
    Admission(AdmissionRequest),
    Logoff(LogoffRequest),
}
