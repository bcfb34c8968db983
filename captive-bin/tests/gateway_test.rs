use captive_bin::admission::auth_loop;
use captive_bin::{initialize_services, reaper, sync_once, Services};
use async_trait::async_trait;
use captive_core::{PortalError, RedirectPolicy, Rule, RuleInstallError, ValidatorKind};
use captive_net::{MemoryBackend, RuleBackend, StaticLinkProbe};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const LOCAL_CLIENT: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// A gateway wired to an in-memory rule backend, serving the portal on a
/// loopback port.
struct TestGateway {
    address: String,
    services: Services,
    backend: Arc<MemoryBackend>,
    users_path: PathBuf,
    log_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestGateway {
    /// Outcomes in the submission log. Records land just after the reply, so
    /// this waits briefly for `expected` of them.
    async fn submissions(&self, expected: usize) -> Vec<String> {
        let read = || -> Vec<String> {
            std::fs::read_to_string(&self.log_path)
                .unwrap_or_default()
                .lines()
                .map(|line| line.split_whitespace().nth(1).unwrap().to_string())
                .collect()
        };
        for _ in 0..100 {
            let outcomes = read();
            if outcomes.len() >= expected {
                return outcomes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        read()
    }

    async fn login(&self, username: &str, password: &str) -> reqwest::Response {
        client()
            .post(format!("{}/login", self.address))
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .expect("Failed to execute request.")
    }
}

async fn spawn_gateway(grant_ttl: u64, backend: Arc<MemoryBackend>) -> TestGateway {
    let tuning = RedirectPolicy {
        grant_ttl,
        rule_retry_attempts: 2,
        rule_retry_base_ms: 1,
        ..RedirectPolicy::default()
    };
    spawn_tuned_gateway(tuning, backend.clone(), backend).await
}

/// `rules` drives the synchronizer; `backend` is what the test inspects.
async fn spawn_tuned_gateway(
    tuning: RedirectPolicy,
    rules: Arc<dyn RuleBackend>,
    backend: Arc<MemoryBackend>,
) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let users_path = dir.path().join("users");
    std::fs::write(&users_path, "# guests\nalice:secret\n").unwrap();
    let log_path = dir.path().join("submissions.log");

    let policy = Arc::new(RedirectPolicy {
        validator: ValidatorKind::LocalUsers,
        users_file: Some(users_path.to_string_lossy().into_owned()),
        audit_log: Some(log_path.to_string_lossy().into_owned()),
        ..tuning
    });

    let services = initialize_services(
        policy.clone(),
        rules,
        Arc::new(StaticLinkProbe::new(true)),
    )
    .await
    .unwrap();
    let _ = sync_once(&services.sync).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let (core_tx, core_rx) = mpsc::channel(100);
    tokio::spawn(auth_loop(core_rx, services.admission.clone()));
    tokio::spawn(captive_http::run_server(
        listener,
        policy,
        core_tx,
        services.store.clone(),
    ));

    TestGateway {
        address,
        services,
        backend,
        users_path,
        log_path,
        _dir: dir,
    }
}

/// Hangs the first `stalls` client installs until the synchronizer times
/// them out, then behaves like the wrapped backend.
struct StallingBackend {
    inner: Arc<MemoryBackend>,
    stalls: AtomicUsize,
}

#[async_trait]
impl RuleBackend for StallingBackend {
    async fn install(&self, rule: &Rule) -> Result<(), RuleInstallError> {
        let stall = matches!(rule, Rule::AllowClient(_))
            && self
                .stalls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if stall {
            std::future::pending::<()>().await;
        }
        self.inner.install(rule).await
    }

    async fn remove(&self, rule: &Rule) -> Result<(), RuleInstallError> {
        self.inner.remove(rule).await
    }

    async fn list_active(&self) -> Result<BTreeSet<Rule>, RuleInstallError> {
        self.inner.list_active().await
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn valid_credentials_admit_and_open_the_firewall() {
    let gw = spawn_gateway(300, Arc::new(MemoryBackend::new())).await;

    let response = gw.login("alice", "secret").await;
    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(response.headers().get("Location").unwrap(), "/success");

    assert!(gw.services.store.is_admitted(LOCAL_CLIENT));
    assert!(gw.backend.rules().contains(&Rule::AllowClient(LOCAL_CLIENT)));
    assert_eq!(gw.submissions(1).await, vec!["SUCCESS"]);

    let grant = gw.services.store.get(LOCAL_CLIENT).unwrap();
    assert_eq!(grant.ttl, Duration::from_secs(300));
}

#[tokio::test]
async fn invalid_credentials_never_admit() {
    let gw = spawn_gateway(300, Arc::new(MemoryBackend::new())).await;

    let response = gw.login("alice", "wrong").await;
    assert_eq!(response.status().as_u16(), 401);
    let body = response.text().await.unwrap();
    assert!(body.contains("Invalid credentials."));

    let response = gw.login("alice", "").await;
    assert_eq!(response.status().as_u16(), 401);
    assert!(response.text().await.unwrap().contains("Please enter a password."));

    assert!(!gw.services.store.is_admitted(LOCAL_CLIENT));
    assert!(gw.services.store.is_empty());
    assert!(!gw.backend.rules().contains(&Rule::AllowClient(LOCAL_CLIENT)));
    assert_eq!(gw.submissions(2).await, vec!["FAILURE", "FAILURE"]);
}

#[tokio::test]
async fn degraded_backend_refuses_admission() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_failing(true);
    let gw = spawn_gateway(300, backend.clone()).await;
    assert!(gw.services.sync.is_degraded());

    let response = gw.login("alice", "secret").await;
    assert_eq!(response.status().as_u16(), 503);
    assert!(!gw.services.store.is_admitted(LOCAL_CLIENT));
    assert_eq!(gw.submissions(1).await, vec!["FAILURE"]);

    // A clean reconcile lifts the suspension.
    backend.set_failing(false);
    sync_once(&gw.services.sync).await.unwrap();
    assert!(!gw.services.sync.is_degraded());
    let response = gw.login("alice", "secret").await;
    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(gw.submissions(2).await, vec!["FAILURE", "SUCCESS"]);
}

#[tokio::test]
async fn slow_rule_install_still_answers_with_the_admission() {
    let backend = Arc::new(MemoryBackend::new());
    let stalling = Arc::new(StallingBackend {
        inner: backend.clone(),
        stalls: AtomicUsize::new(3),
    });
    let tuning = RedirectPolicy {
        validation_timeout: 1,
        rule_timeout_ms: 4000,
        rule_retry_attempts: 4,
        rule_retry_base_ms: 1,
        ..RedirectPolicy::default()
    };
    let gw = spawn_tuned_gateway(tuning, stalling, backend.clone()).await;

    // Three timed-out installs take longer than the validation timeout plus
    // any fixed grace, yet the client is told what the store says.
    let response = gw.login("alice", "secret").await;
    assert_eq!(response.status().as_u16(), 303);
    assert!(gw.services.store.is_admitted(LOCAL_CLIENT));
    assert!(backend.rules().contains(&Rule::AllowClient(LOCAL_CLIENT)));
    assert_eq!(gw.submissions(1).await, vec!["SUCCESS"]);
}

#[tokio::test]
async fn unreadable_login_body_is_a_recorded_failure() {
    let gw = spawn_gateway(300, Arc::new(MemoryBackend::new())).await;

    let response = client()
        .post(format!("{}/login", gw.address))
        .header("content-type", "application/json")
        .body(r#"{"username":"alice","password":"secret"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert!(gw.services.store.is_empty());
    assert_eq!(gw.submissions(1).await, vec!["FAILURE"]);
}

#[tokio::test]
async fn expired_grants_are_reaped_and_retracted() {
    let gw = spawn_gateway(1, Arc::new(MemoryBackend::new())).await;

    let response = gw.login("alice", "secret").await;
    assert_eq!(response.status().as_u16(), 303);
    assert!(gw.backend.rules().contains(&Rule::AllowClient(LOCAL_CLIENT)));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!gw.services.store.is_admitted(LOCAL_CLIENT));

    let status: serde_json::Value = client()
        .get(format!("{}/status", gw.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["admitted"], false);

    let reaped = reaper::reap_once(&gw.services.store, &gw.services.sync).await;
    assert_eq!(reaped, 1);
    assert!(gw.services.store.is_empty());
    assert!(!gw.backend.rules().contains(&Rule::AllowClient(LOCAL_CLIENT)));
}

#[tokio::test]
async fn reloaded_users_file_takes_effect() {
    let gw = spawn_gateway(300, Arc::new(MemoryBackend::new())).await;
    assert_eq!(gw.login("bob", "hunter2").await.status().as_u16(), 401);

    std::fs::write(&gw.users_path, "bob:hunter2\n").unwrap();
    let users = gw.services.users.as_ref().expect("local users validator");
    assert_eq!(users.load(&gw.users_path).unwrap(), 1);

    assert_eq!(gw.login("bob", "hunter2").await.status().as_u16(), 303);
    assert_eq!(gw.login("alice", "secret").await.status().as_u16(), 401);
}

#[tokio::test]
async fn sync_repairs_drift_and_reports_divergence() {
    let backend = Arc::new(MemoryBackend::new());
    let gw = spawn_gateway(300, backend.clone()).await;
    gw.login("alice", "secret").await;

    backend.forget(&Rule::AllowClient(LOCAL_CLIENT));
    backend.inject(Rule::AllowClient(Ipv4Addr::new(10, 0, 0, 99)));
    sync_once(&gw.services.sync).await.unwrap();
    assert!(backend.rules().contains(&Rule::AllowClient(LOCAL_CLIENT)));
    assert!(!backend.rules().contains(&Rule::AllowClient(Ipv4Addr::new(10, 0, 0, 99))));

    backend.forget(&Rule::AllowClient(LOCAL_CLIENT));
    backend.set_ignore_installs(true);
    let err = sync_once(&gw.services.sync).await.unwrap_err();
    assert!(matches!(err, PortalError::StoreConsistency(_)));
}

#[tokio::test]
async fn local_users_without_a_file_fail_to_start() {
    let policy = Arc::new(RedirectPolicy {
        validator: ValidatorKind::LocalUsers,
        users_file: Some("/nonexistent/captive-users".to_string()),
        audit_log: None,
        ..RedirectPolicy::default()
    });
    let result = initialize_services(
        policy,
        Arc::new(MemoryBackend::new()),
        Arc::new(StaticLinkProbe::new(true)),
    )
    .await;
    let err = result.err().expect("startup should fail");
    assert!(err.to_string().contains("/nonexistent/captive-users"));
}
