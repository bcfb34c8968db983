use axum::{
    extract::{rejection::FormRejection, ConnectInfo, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use captive_core::{
    AdmissionOutcome, AdmissionRequest, CoreRequest, Credentials, LogoffRequest, RedirectPolicy,
    SessionStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Covers waiting behind an in-flight reconcile, and the logout round trip.
const ADMISSION_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    policy: Arc<RedirectPolicy>,
    core_tx: mpsc::Sender<CoreRequest>,
    store: Arc<SessionStore>,
}

#[derive(Serialize, Debug)]
struct ClientStatus {
    client: Ipv4Addr,
    admitted: bool,
    expires_at: Option<DateTime<Utc>>,
    remaining_secs: Option<u64>,
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
    <head>
        <meta name="viewport" content="width=device-width, initial-scale=1">
        <title>{title}</title>
    </head>
    <body>
        <h1>{title}</h1>
        {body}
    </body>
</html>
"#
    )
}

fn client_ip(addr: &SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

fn ipv6_unsupported() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Html(page("Login Failed", "<p>IPv6 clients are not supported.</p>")),
    )
        .into_response()
}

async fn portal_page() -> Html<String> {
    Html(page(
        "Login",
        r#"<form name="login" action="/login" method="post">
            <label for="username">Username:</label><br>
            <input type="text" id="username" name="username"><br>
            <label for="password">Password:</label><br>
            <input type="password" id="password" name="password"><br><br>
            <input type="submit" value="Connect">
        </form>"#,
    ))
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    form: Result<Form<Credentials>, FormRejection>,
) -> Response {
    let Some(client) = client_ip(&addr) else {
        return ipv6_unsupported();
    };
    // An unreadable body is still a submission; the core rejects and records it.
    let credentials = match form {
        Ok(Form(credentials)) => credentials,
        Err(e) => {
            warn!("Unreadable login body from {}: {}", client, e);
            Credentials::default()
        }
    };
    info!("Login attempt from {} for user '{}'", client, credentials.username);

    let (tx, rx) = oneshot::channel();
    let request = CoreRequest::Admission(AdmissionRequest {
        client,
        credentials,
        tx,
    });
    if state.core_tx.send(request).await.is_err() {
        warn!("Admission core is gone, refusing {}", client);
        return unavailable("The gateway is shutting down.");
    }

    let budget = state.policy.admission_budget() + ADMISSION_GRACE;
    match tokio::time::timeout(budget, rx).await {
        Ok(Ok(AdmissionOutcome::Admitted(_))) => {
            Redirect::to(&state.policy.success_path).into_response()
        }
        Ok(Ok(AdmissionOutcome::Rejected(reason))) => (
            StatusCode::UNAUTHORIZED,
            Html(page(
                "Login Failed",
                &format!(
                    "<p>{}</p><p><a href=\"/portal\">Try again</a></p>",
                    reason
                ),
            )),
        )
            .into_response(),
        Ok(Ok(AdmissionOutcome::Unavailable(reason))) => unavailable(&reason),
        Ok(Err(_)) => unavailable("Internal server error (channel closed)."),
        Err(_) => {
            warn!("Admission for {} did not finish within {:?}", client, budget);
            unavailable("Internal server error (timeout).")
        }
    }
}

fn unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Html(page("Login Unavailable", &format!("<p>{}</p>", reason))),
    )
        .into_response()
}

async fn logout(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(client) = client_ip(&addr) else {
        return ipv6_unsupported();
    };
    let (tx, rx) = oneshot::channel();
    if state
        .core_tx
        .send(CoreRequest::Logoff(LogoffRequest { client, tx }))
        .await
        .is_err()
    {
        return unavailable("The gateway is shutting down.");
    }
    match tokio::time::timeout(ADMISSION_GRACE, rx).await {
        Ok(Ok(_)) => Redirect::to("/portal").into_response(),
        _ => unavailable("Internal server error (logout)."),
    }
}

async fn success(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let now = state.store.now();
    let grant = client_ip(&addr).and_then(|client| state.store.get(client));
    match grant {
        Some(grant) => Html(page(
            "Connected",
            &format!(
                "<p>You have internet access for {} seconds, until {}.</p>\
                 <form action=\"/logout\" method=\"post\"><input type=\"submit\" value=\"Disconnect\"></form>",
                grant.remaining_at(now).as_secs(),
                grant.expires_at.to_rfc3339()
            ),
        ))
        .into_response(),
        None => Redirect::to(&state.policy.portal_url()).into_response(),
    }
}

async fn status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(client) = client_ip(&addr) else {
        return ipv6_unsupported();
    };
    let now = state.store.now();
    let grant = state.store.get(client);
    Json(ClientStatus {
        client,
        admitted: grant.is_some(),
        expires_at: grant.as_ref().map(|g| g.expires_at),
        remaining_secs: grant.as_ref().map(|g| g.remaining_at(now).as_secs()),
    })
    .into_response()
}

/// Anything else: connectivity probes, redirected HTTP(S) for arbitrary hosts.
async fn fallback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Redirect {
    let admitted = client_ip(&addr).map_or(false, |client| state.store.is_admitted(client));
    if admitted {
        Redirect::to(&state.policy.success_path)
    } else {
        Redirect::to(&state.policy.portal_url())
    }
}

pub fn router(
    policy: Arc<RedirectPolicy>,
    core_tx: mpsc::Sender<CoreRequest>,
    store: Arc<SessionStore>,
) -> Router {
    let success_path = policy.success_path.clone();
    let state = AppState {
        policy,
        core_tx,
        store,
    };
    Router::new()
        .route("/portal", get(portal_page))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/status", get(status))
        .route(&success_path, get(success))
        .fallback(fallback)
        .with_state(state)
}

pub async fn run_server(
    listener: TcpListener,
    policy: Arc<RedirectPolicy>,
    core_tx: mpsc::Sender<CoreRequest>,
    store: Arc<SessionStore>,
) -> std::io::Result<()> {
    info!("Portal listening on {}", listener.local_addr()?);
    let app = router(policy, core_tx, store);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}
