pub mod admission;
pub mod cmdsock;
pub mod config;
pub mod reaper;

use admission::{auth_loop, AdmissionService};
use anyhow::{anyhow, Context, Result};
use captive_core::{
    AcceptAll, CredentialValidator, LocalUsers, PortalError, RedirectPolicy, SessionStore,
    SubmissionLog, SystemClock, ValidatorKind,
};
use captive_net::{
    DnsInterceptor, IptablesBackend, LinkProbe, RuleBackend, RuleSynchronizer, SysfsLinkProbe,
};
use cmdsock::{run_cmdsock_listener, ControlContext};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Immediate retries of a reconcile that found the backend out of step.
const CONSISTENCY_RETRIES: u32 = 3;

/// Everything the long-running tasks share.
pub struct Services {
    pub policy: Arc<RedirectPolicy>,
    pub store: Arc<SessionStore>,
    pub sync: Arc<RuleSynchronizer>,
    pub admission: Arc<AdmissionService>,
    /// Set when credentials come from a users file, so it can be reloaded.
    pub users: Option<LocalUsers>,
}

pub async fn initialize_services(
    policy: Arc<RedirectPolicy>,
    backend: Arc<dyn RuleBackend>,
    probe: Arc<dyn LinkProbe>,
) -> Result<Services> {
    let store = Arc::new(SessionStore::with_clock(
        Arc::new(SystemClock),
        policy.sliding_ttl,
    ));
    let sync = Arc::new(RuleSynchronizer::new(
        policy.clone(),
        store.clone(),
        backend,
        probe,
    ));

    let (validator, users): (Arc<dyn CredentialValidator>, Option<LocalUsers>) =
        match policy.validator {
            ValidatorKind::AcceptAll => {
                info!("Accepting any submission that names a user");
                (Arc::new(AcceptAll), None)
            }
            ValidatorKind::LocalUsers => {
                let path = policy
                    .users_file
                    .as_deref()
                    .ok_or_else(|| anyhow!("validator local_users requires users_file"))?;
                let users = LocalUsers::new();
                users
                    .load(path)
                    .with_context(|| format!("loading users from {}", path))?;
                if users.is_empty() {
                    warn!("{} defines no users, every submission will be rejected", path);
                }
                (Arc::new(users.clone()), Some(users))
            }
        };

    let audit = match &policy.audit_log {
        Some(path) => SubmissionLog::open(path)
            .await
            .with_context(|| format!("opening submission log {}", path))?,
        None => {
            info!("Submission log disabled");
            SubmissionLog::disabled()
        }
    };

    let admission = Arc::new(AdmissionService::new(
        policy.clone(),
        store.clone(),
        sync.clone(),
        validator,
        Arc::new(audit),
    ));

    Ok(Services {
        policy,
        store,
        sync,
        admission,
        users,
    })
}

/// Reconciles once, retrying straight away while the backend reports a
/// divergence from the store.
pub async fn sync_once(sync: &RuleSynchronizer) -> Result<(), PortalError> {
    let mut attempt = 1;
    loop {
        match sync.reconcile().await {
            Ok(report) => {
                if report.installed > 0 || report.removed > 0 {
                    debug!(
                        "Reconciled: {} installed, {} removed, uplink {}",
                        report.installed,
                        report.removed,
                        if report.uplink_up { "up" } else { "down" }
                    );
                }
                return Ok(());
            }
            Err(PortalError::StoreConsistency(msg)) if attempt < CONSISTENCY_RETRIES => {
                warn!("Reconcile attempt {} left drift ({}), retrying", attempt, msg);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn sync_loop(sync: Arc<RuleSynchronizer>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = sync_once(&sync).await {
            error!("Rule synchronization failed: {}", e);
        }
    }
}

#[cfg(unix)]
async fn sighup_handler(users: LocalUsers, path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stream = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to create SIGHUP listener: {}", e);
            return;
        }
    };

    while stream.recv().await.is_some() {
        info!("SIGHUP received, reloading {}", path);
        // On failure the previous user set stays in place.
        if let Err(e) = users.load(&path) {
            error!("Failed to reload users: {}", e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down."),
        _ = terminate => info!("Received SIGTERM, shutting down."),
    }
}

/// Resolves when the task ends, or never when there is no task.
async fn finished<T>(handle: Option<&mut JoinHandle<T>>) {
    match handle {
        Some(handle) => {
            handle.await.ok();
        }
        None => std::future::pending().await,
    }
}

/// Runs the gateway until a shutdown signal or until a core task stops.
pub async fn serve(
    policy: Arc<RedirectPolicy>,
    backend: Arc<dyn RuleBackend>,
    probe: Arc<dyn LinkProbe>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let services = initialize_services(policy.clone(), backend, probe).await?;

    if let Err(e) = sync_once(&services.sync).await {
        error!("Initial rule synchronization failed: {}", e);
    }

    let dns_addr = (policy.gateway, policy.dns_port);
    let dns_socket = UdpSocket::bind(dns_addr)
        .await
        .with_context(|| format!("binding DNS socket on {}:{}", dns_addr.0, dns_addr.1))?;
    let portal_addr = (policy.gateway, policy.portal_port);
    let portal_listener = TcpListener::bind(portal_addr)
        .await
        .with_context(|| format!("binding portal on {}:{}", portal_addr.0, portal_addr.1))?;

    let (core_tx, core_rx) = tokio::sync::mpsc::channel(100);

    let interceptor = Arc::new(DnsInterceptor::new(policy.clone(), services.store.clone()));
    let mut dns_handle = tokio::spawn(interceptor.run(dns_socket));

    let mut http_handle = tokio::spawn(captive_http::run_server(
        portal_listener,
        policy.clone(),
        core_tx,
        services.store.clone(),
    ));

    let mut auth_loop_handle = tokio::spawn(auth_loop(core_rx, services.admission.clone()));

    let mut reaper_handle = tokio::spawn(reaper::reaper_loop(
        services.store.clone(),
        services.sync.clone(),
        policy.reap_interval(),
    ));

    let mut sync_handle = tokio::spawn(sync_loop(services.sync.clone(), policy.sync_interval()));

    let mut cmdsock_handle = policy.cmdsocket.clone().map(|path| {
        let ctx = ControlContext {
            policy: policy.clone(),
            store: services.store.clone(),
            sync: services.sync.clone(),
        };
        tokio::spawn(run_cmdsock_listener(path, ctx))
    });

    #[cfg(unix)]
    let sighup_handle = match (&services.users, &policy.users_file) {
        (Some(users), Some(path)) => Some(tokio::spawn(sighup_handler(users.clone(), path.clone()))),
        _ => None,
    };

    info!("Gateway {} serving {}", policy.gateway, policy.portal_url());

    tokio::select! {
        res = &mut dns_handle => {
            if let Ok(Err(e)) = res {
                error!("DNS interceptor failed: {}", e);
            }
        }
        res = &mut http_handle => {
            if let Ok(Err(e)) = res {
                error!("Portal server failed: {}", e);
            }
        }
        _ = &mut auth_loop_handle => {
            info!("Auth loop finished.");
        }
        _ = &mut reaper_handle => {
            info!("Reaper loop finished.");
        }
        _ = &mut sync_handle => {
            info!("Sync loop finished.");
        }
        _ = finished(cmdsock_handle.as_mut()) => {
            info!("Cmdsock listener finished.");
        }
        _ = shutdown => {}
    }

    dns_handle.abort();
    http_handle.abort();
    auth_loop_handle.abort();
    reaper_handle.abort();
    sync_handle.abort();
    if let Some(handle) = cmdsock_handle {
        handle.abort();
    }
    #[cfg(unix)]
    if let Some(handle) = sighup_handle {
        handle.abort();
    }

    if let Some(path) = &policy.cmdsocket {
        if Path::new(path).exists() {
            std::fs::remove_file(path).ok();
        }
    }

    Ok(())
}

pub async fn run(policy: Arc<RedirectPolicy>) -> Result<()> {
    info!("Starting captive admission gateway");

    let backend = Arc::new(IptablesBackend::new(&policy));
    if let Err(e) = backend.prepare().await {
        backend.cleanup().await.ok();
        return Err(e).context("preparing firewall");
    }

    let result = serve(
        policy,
        backend.clone(),
        Arc::new(SysfsLinkProbe::new()),
        shutdown_signal(),
    )
    .await;

    if let Err(e) = backend.cleanup().await {
        warn!("Firewall cleanup incomplete: {}", e);
    }
    info!("Gateway stopped");
    result
}
