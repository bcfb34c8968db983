//! Keeps the firewall a projection of the session store.
//!
//! The synchronizer is the only component that writes rules. Every write goes
//! through one async mutex, so a full reconcile and a single-client change
//! never interleave, and each backend call is bounded and retried.

use crate::firewall::RuleBackend;
use crate::link::{probe_uplink, LinkProbe};
use captive_core::{ClientId, PortalError, RedirectPolicy, Rule, RuleInstallError, RuleTable, SessionStore};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// What one full reconcile changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub uplink_up: bool,
    pub installed: usize,
    pub removed: usize,
}

pub struct RuleSynchronizer {
    policy: Arc<RedirectPolicy>,
    store: Arc<SessionStore>,
    backend: Arc<dyn RuleBackend>,
    probe: Arc<dyn LinkProbe>,
    write_lock: Mutex<()>,
    uplink_up: AtomicBool,
    degraded: watch::Sender<bool>,
}

impl RuleSynchronizer {
    pub fn new(
        policy: Arc<RedirectPolicy>,
        store: Arc<SessionStore>,
        backend: Arc<dyn RuleBackend>,
        probe: Arc<dyn LinkProbe>,
    ) -> Self {
        let (degraded, _) = watch::channel(false);
        RuleSynchronizer {
            policy,
            store,
            backend,
            probe,
            write_lock: Mutex::new(()),
            uplink_up: AtomicBool::new(false),
            degraded,
        }
    }

    /// Set while the backend keeps failing; admissions are refused meanwhile.
    pub fn subscribe_degraded(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Uplink state seen by the last reconcile.
    pub fn uplink_up(&self) -> bool {
        self.uplink_up.load(Ordering::SeqCst)
    }

    /// The rule set the backend should hold right now.
    pub fn desired(&self) -> RuleTable {
        RuleTable::desired(
            &self.store.snapshot(),
            self.uplink_up(),
            self.policy.isolate_unadmitted,
        )
    }

    /// Probes the uplink, then brings the backend in line with a fresh store
    /// snapshot. Missing rules are installed before stale ones are removed.
    pub async fn reconcile(&self) -> Result<SyncReport, PortalError> {
        let _guard = self.write_lock.lock().await;

        let uplink_up = probe_uplink(
            self.probe.as_ref(),
            &self.policy.uplink_interface,
            self.policy.link_probe_timeout(),
        )
        .await;
        let was_up = self.uplink_up.swap(uplink_up, Ordering::SeqCst);
        if was_up != uplink_up {
            info!(
                "Uplink {} is {}",
                self.policy.uplink_interface,
                if uplink_up { "up" } else { "down" }
            );
        }

        let desired = RuleTable::desired(
            &self.store.snapshot(),
            uplink_up,
            self.policy.isolate_unadmitted,
        );
        let active = self
            .with_retry("list active rules", move || self.backend.list_active())
            .await
            .map_err(|e| self.degrade(e))?;

        let diff = desired.diff(&active);
        if !diff.is_empty() {
            debug!(
                "Reconciling: {} to install, {} to remove",
                diff.install.len(),
                diff.remove.len()
            );
        }
        for rule in &diff.install {
            self.with_retry("install", move || self.backend.install(rule))
                .await
                .map_err(|e| self.degrade(e))?;
        }
        for rule in &diff.remove {
            self.with_retry("remove", move || self.backend.remove(rule))
                .await
                .map_err(|e| self.degrade(e))?;
        }

        let after = self
            .with_retry("list active rules", move || self.backend.list_active())
            .await
            .map_err(|e| self.degrade(e))?;
        if &after != desired.rules() {
            let missing = desired.rules().difference(&after).count();
            let extra = after.difference(desired.rules()).count();
            warn!(
                "Backend diverged after reconcile: {} missing, {} unexpected",
                missing, extra
            );
            return Err(PortalError::StoreConsistency(format!(
                "{} rules missing, {} unexpected",
                missing, extra
            )));
        }

        self.set_degraded(false);
        Ok(SyncReport {
            uplink_up,
            installed: diff.install.len(),
            removed: diff.remove.len(),
        })
    }

    /// Installs the pass-through entry for a freshly admitted client.
    pub async fn allow(&self, client: ClientId) -> Result<(), PortalError> {
        let _guard = self.write_lock.lock().await;
        if !self.store.is_admitted(client) {
            debug!("{} no longer admitted, not installing", client);
            return Ok(());
        }
        let rule = &Rule::AllowClient(client);
        self.with_retry("install", move || self.backend.install(rule))
            .await
            .map_err(|e| self.degrade(e))
    }

    /// Removes the pass-through entry for a client that lost its grant.
    pub async fn retract(&self, client: ClientId) -> Result<(), PortalError> {
        let _guard = self.write_lock.lock().await;
        if self.store.is_admitted(client) {
            debug!("{} was re-admitted, keeping its rule", client);
            return Ok(());
        }
        let rule = &Rule::AllowClient(client);
        self.with_retry("remove", move || self.backend.remove(rule))
            .await
            .map_err(|e| self.degrade(e))
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RuleInstallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RuleInstallError>>,
    {
        let attempts = self.policy.rule_retry_attempts.max(1);
        let timeout = self.policy.rule_timeout();
        let mut delay = self.policy.rule_retry_base();
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RuleInstallError::Timeout(timeout)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    error!("{} failed after {} attempts: {}", what, attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    fn degrade(&self, e: RuleInstallError) -> PortalError {
        self.set_degraded(true);
        PortalError::RuleInstall(e)
    }

    fn set_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|degraded| {
            if *degraded == value {
                return false;
            }
            *degraded = value;
            true
        });
        if changed && value {
            error!("Rule backend degraded, suspending admissions");
        } else if changed {
            info!("Rule backend recovered, admissions resumed");
        }
    }
}
