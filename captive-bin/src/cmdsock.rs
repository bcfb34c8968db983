use anyhow::Result;
use captive_core::{PacketMeta, RedirectPolicy, SessionStore};
use captive_ipc::{Classification, Command, GatewayStatus, Response};
use captive_net::RuleSynchronizer;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

/// What the operator socket needs to answer commands.
#[derive(Clone)]
pub struct ControlContext {
    pub policy: Arc<RedirectPolicy>,
    pub store: Arc<SessionStore>,
    pub sync: Arc<RuleSynchronizer>,
}

async fn handle_revoke(ctx: &ControlContext, ip: Ipv4Addr) -> Response {
    info!("Received Revoke command for {}", ip);
    if !ctx.store.revoke(ip) {
        let msg = format!("No grant for {}", ip);
        warn!("{}", msg);
        return Response::Error(msg);
    }
    if let Err(e) = ctx.sync.retract(ip).await {
        // The grant is gone; the next reconcile removes the rule.
        warn!("Failed to retract rule for {}: {}", ip, e);
    }
    Response::Success
}

async fn handle_extend(ctx: &ControlContext, ip: Ipv4Addr, ttl_secs: Option<u64>) -> Response {
    let ttl = ttl_secs.map_or_else(|| ctx.policy.session_ttl(), Duration::from_secs);
    info!("Received Extend command for {} ({:?})", ip, ttl);
    match ctx.store.extend(ip, ttl) {
        Some(grant) => Response::Grant(grant),
        None => Response::Error(format!("No live grant for {}", ip)),
    }
}

fn handle_classify(ctx: &ControlContext, packet: PacketMeta) -> Response {
    let table = ctx.sync.desired();
    let matched = table.first_match(&packet).copied();
    Response::Verdict(Classification {
        packet,
        matched,
        verdict: table.evaluate(&packet),
    })
}

fn handle_status(ctx: &ControlContext) -> Response {
    Response::Status(GatewayStatus {
        gateway: ctx.policy.gateway,
        portal_url: ctx.policy.portal_url(),
        uplink_up: ctx.sync.uplink_up(),
        degraded: ctx.sync.is_degraded(),
        admitted: ctx.store.snapshot().len(),
        hijacked_domains: ctx.policy.hijack_set(),
    })
}

pub async fn dispatch(ctx: &ControlContext, command: Command) -> Response {
    match command {
        Command::List => Response::Grants(ctx.store.grants()),
        Command::Revoke { ip } => handle_revoke(ctx, ip).await,
        Command::Extend { ip, ttl_secs } => handle_extend(ctx, ip, ttl_secs).await,
        Command::Classify { ip, protocol, port } => handle_classify(
            ctx,
            PacketMeta {
                src: ip,
                protocol,
                dst_port: port,
            },
        ),
        Command::Status => handle_status(ctx),
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: ControlContext) -> Result<()> {
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;

    let response = match serde_json::from_slice::<Command>(&buffer) {
        Ok(command) => dispatch(&ctx, command).await,
        Err(e) => {
            warn!("Failed to deserialize command: {}", e);
            Response::Error(format!("Deserialization failed: {}", e))
        }
    };

    let serialized = serde_json::to_vec(&response)?;
    stream.write_all(&serialized).await?;
    stream.shutdown().await?;

    Ok(())
}

pub async fn run_cmdsock_listener(path: String, ctx: ControlContext) -> Result<()> {
    let socket_path = Path::new(&path);

    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!("Cmdsock listener started on {}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        error!("Error handling cmdsock connection: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Cmdsock accept error: {}", e);
            }
        }
    }
}
