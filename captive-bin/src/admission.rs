use captive_core::{
    AdmissionOutcome, ClientId, CoreRequest, CredentialValidator, Credentials, Grant, Outcome,
    PortalError, RedirectPolicy, SessionStore, SubmissionLog, SubmissionRecord, ValidationError,
};
use captive_net::RuleSynchronizer;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Turns credential submissions into grants. Every submission, whatever its
/// result, leaves one record in the submission log once the client has its
/// answer.
pub struct AdmissionService {
    policy: Arc<RedirectPolicy>,
    store: Arc<SessionStore>,
    sync: Arc<RuleSynchronizer>,
    validator: Arc<dyn CredentialValidator>,
    audit: Arc<SubmissionLog>,
}

impl AdmissionService {
    pub fn new(
        policy: Arc<RedirectPolicy>,
        store: Arc<SessionStore>,
        sync: Arc<RuleSynchronizer>,
        validator: Arc<dyn CredentialValidator>,
        audit: Arc<SubmissionLog>,
    ) -> Self {
        AdmissionService {
            policy,
            store,
            sync,
            validator,
            audit,
        }
    }

    /// Decides a submission and delivers the outcome on `reply`. The log
    /// records what the client was told: an admission nobody is waiting for
    /// any more is withdrawn and logged as a failure.
    pub async fn submit(
        &self,
        client: ClientId,
        credentials: Credentials,
        reply: oneshot::Sender<AdmissionOutcome>,
    ) {
        let outcome = self.decide(client, &credentials).await;
        let admitted = matches!(outcome, AdmissionOutcome::Admitted(_));
        let delivered = reply.send(outcome).is_ok();
        if admitted && !delivered {
            warn!("{} stopped waiting before its admission was confirmed, withdrawing", client);
            self.withdraw(client).await;
        }
        let outcome = if admitted && delivered {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.record(client, outcome).await;
    }

    async fn decide(&self, client: ClientId, credentials: &Credentials) -> AdmissionOutcome {
        match self.admit(client, credentials).await {
            Ok(grant) => AdmissionOutcome::Admitted(grant),
            Err(e) if e.is_client_error() => {
                info!("Rejected {} ('{}'): {}", client, credentials.username, e);
                AdmissionOutcome::Rejected(rejection_message(&e))
            }
            Err(e) => {
                warn!("Could not admit {}: {}", client, e);
                AdmissionOutcome::Unavailable(
                    "The gateway cannot grant access right now. Please try again shortly."
                        .to_string(),
                )
            }
        }
    }

    async fn admit(&self, client: ClientId, credentials: &Credentials) -> Result<Grant, PortalError> {
        if self.sync.is_degraded() {
            return Err(PortalError::Degraded);
        }

        let timeout = self.policy.validation_timeout();
        match tokio::time::timeout(timeout, self.validator.validate(credentials)).await {
            Ok(result) => result?,
            Err(_) => return Err(ValidationError::UpstreamTimeout(timeout).into()),
        }

        let grant = self.store.admit(client, self.policy.grant_ttl());
        if let Err(e) = self.sync.allow(client).await {
            // No rule, no grant. A rule left by an earlier grant goes too.
            self.withdraw(client).await;
            return Err(e);
        }
        Ok(grant)
    }

    /// Ends the caller's own session early.
    pub async fn logoff(&self, client: ClientId) -> bool {
        self.withdraw(client).await
    }

    /// Revokes the grant and retracts its rule. False if there was no grant.
    async fn withdraw(&self, client: ClientId) -> bool {
        if !self.store.revoke(client) {
            return false;
        }
        if let Err(e) = self.sync.retract(client).await {
            error!("Failed to retract rule for {}: {}", client, e);
        }
        true
    }

    async fn record(&self, client: ClientId, outcome: Outcome) {
        let record = SubmissionRecord::new(client, self.store.now(), outcome);
        if let Err(e) = self.audit.append(&record).await {
            error!("Failed to append submission record: {}", e);
        }
    }
}

fn rejection_message(e: &PortalError) -> String {
    match e {
        PortalError::Validation(ValidationError::MissingField(field)) => {
            format!("Please enter a {}.", field)
        }
        PortalError::Validation(ValidationError::UpstreamTimeout(_)) => {
            "The login service did not respond. Please try again.".to_string()
        }
        _ => "Invalid credentials.".to_string(),
    }
}

/// Serves requests from the HTTP surface, one task per request so a slow
/// validator never holds up other clients.
pub async fn auth_loop(mut rx: mpsc::Receiver<CoreRequest>, service: Arc<AdmissionService>) {
    while let Some(request) = rx.recv().await {
        let service = service.clone();
        match request {
            CoreRequest::Admission(req) => {
                tokio::spawn(async move {
                    service.submit(req.client, req.credentials, req.tx).await;
                });
            }
            CoreRequest::Logoff(req) => {
                tokio::spawn(async move {
                    let revoked = service.logoff(req.client).await;
                    req.tx.send(revoked).ok();
                });
            }
        }
    }
    info!("Admission channel closed");
}
