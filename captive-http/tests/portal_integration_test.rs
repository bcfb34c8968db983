use captive_core::{AdmissionOutcome, CoreRequest, ManualClock, RedirectPolicy, SessionStore};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const LOCAL_CLIENT: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Stands in for the admission core: `alice`/`secret` is admitted, `busy`
/// finds the gateway degraded, anything else is rejected.
async fn fake_core(mut core_rx: mpsc::Receiver<CoreRequest>, store: Arc<SessionStore>) {
    while let Some(request) = core_rx.recv().await {
        match request {
            CoreRequest::Admission(req) => {
                let outcome = match (req.credentials.username.as_str(), req.credentials.password.as_str()) {
                    ("alice", "secret") => {
                        AdmissionOutcome::Admitted(store.admit(req.client, Duration::from_secs(300)))
                    }
                    ("busy", _) => AdmissionOutcome::Unavailable("degraded".to_string()),
                    _ => AdmissionOutcome::Rejected("Invalid credentials.".to_string()),
                };
                let _ = req.tx.send(outcome);
            }
            CoreRequest::Logoff(req) => {
                let _ = req.tx.send(store.revoke(req.client));
            }
        }
    }
}

async fn spawn_app() -> (String, Arc<SessionStore>) {
    spawn_app_with(Arc::new(SessionStore::new())).await
}

async fn spawn_app_with(store: Arc<SessionStore>) -> (String, Arc<SessionStore>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().unwrap();
    let address = format!("http://{}", addr);

    let policy = Arc::new(RedirectPolicy::default());
    let (core_tx, core_rx) = mpsc::channel(100);
    tokio::spawn(fake_core(core_rx, store.clone()));

    tokio::spawn(captive_http::server::run_server(
        listener,
        policy,
        core_tx,
        store.clone(),
    ));

    (address, store)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn unadmitted_requests_redirect_to_portal() {
    let (app_address, _store) = spawn_app().await;

    for path in ["/hotspot-detect.html", "/generate_204", "/"] {
        let response = client()
            .get(&format!("{}{}", &app_address, path))
            .send()
            .await
            .expect("Failed to execute request.");

        assert_eq!(response.status().as_u16(), 303);
        assert_eq!(
            response.headers().get("Location").unwrap(),
            "http://10.0.0.1/portal"
        );
    }
}

#[tokio::test]
async fn portal_returns_login_form() {
    let (app_address, _store) = spawn_app().await;

    let response = client()
        .get(&format!("{}/portal", &app_address))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(response.status().as_u16(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains("<form name=\"login\""));
    assert!(html.contains("Login"));
}

#[tokio::test]
async fn valid_login_admits_before_responding() {
    let (app_address, store) = spawn_app().await;

    let response = client()
        .post(&format!("{}/login", &app_address))
        .form(&[("username", "alice"), ("password", "secret")])
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(response.headers().get("Location").unwrap(), "/success");
    assert!(store.is_admitted(LOCAL_CLIENT));

    let response = client()
        .get(&format!("{}/success", &app_address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains("299 seconds") || html.contains("300 seconds"));

    // Admitted clients are no longer sent to the portal.
    let response = client()
        .get(&format!("{}/hotspot-detect.html", &app_address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers().get("Location").unwrap(), "/success");
}

#[tokio::test]
async fn invalid_login_is_rejected() {
    let (app_address, store) = spawn_app().await;

    let response = client()
        .post(&format!("{}/login", &app_address))
        .form(&[("username", "alice"), ("password", "wrong")])
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(response.status().as_u16(), 401);
    assert!(response.text().await.unwrap().contains("Invalid credentials."));
    assert!(!store.is_admitted(LOCAL_CLIENT));
}

#[tokio::test]
async fn degraded_gateway_refuses_login() {
    let (app_address, store) = spawn_app().await;

    let response = client()
        .post(&format!("{}/login", &app_address))
        .form(&[("username", "busy"), ("password", "x")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 503);
    assert!(store.is_empty());
}

#[tokio::test]
async fn status_reports_own_grant() {
    let (app_address, store) = spawn_app().await;

    let status: serde_json::Value = client()
        .get(&format!("{}/status", &app_address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["client"], "127.0.0.1");
    assert_eq!(status["admitted"], false);
    assert!(status["expires_at"].is_null());

    store.admit(LOCAL_CLIENT, Duration::from_secs(120));
    let status: serde_json::Value = client()
        .get(&format!("{}/status", &app_address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["admitted"], true);
    assert!(status["remaining_secs"].as_u64().unwrap() <= 120);
}

#[tokio::test]
async fn logout_revokes_grant() {
    let (app_address, store) = spawn_app().await;
    store.admit(LOCAL_CLIENT, Duration::from_secs(300));

    let response = client()
        .post(&format!("{}/logout", &app_address))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 303);
    assert_eq!(response.headers().get("Location").unwrap(), "/portal");
    assert!(!store.is_admitted(LOCAL_CLIENT));
}

#[tokio::test]
async fn success_page_shows_time_left() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let store = Arc::new(SessionStore::with_clock(clock.clone(), false));
    let (app_address, store) = spawn_app_with(store).await;
    store.admit(LOCAL_CLIENT, Duration::from_secs(300));
    clock.advance(Duration::from_secs(120));

    let html = client()
        .get(&format!("{}/success", &app_address))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(html.contains("for 180 seconds"), "{}", html);
}
