use anyhow::Result;
use captive_core::Protocol;
use captive_ipc::{send_command, Command, Response, DEFAULT_SOCKET_PATH};
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path of the gateway control socket
    #[clap(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List admitted clients
    List,
    /// Revoke a client's grant
    Revoke {
        #[clap(value_parser)]
        ip: Ipv4Addr,
    },
    /// Extend a live grant, by the configured session TTL unless given
    Extend {
        #[clap(value_parser)]
        ip: Ipv4Addr,
        #[clap(long)]
        ttl: Option<u64>,
    },
    /// Show which rule a packet would hit
    Classify {
        #[clap(value_parser)]
        ip: Ipv4Addr,
        #[clap(value_parser)]
        protocol: Protocol,
        #[clap(value_parser)]
        port: u16,
    },
    /// Show gateway state
    Status,
}

fn unexpected(response: Response) {
    match response {
        Response::Error(e) => eprintln!("Server error: {}", e),
        _ => eprintln!("Unexpected response from server"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::List => match send_command(&cli.socket, &Command::List).await? {
            Response::Grants(grants) => {
                println!(
                    "{:<15} {:<26} {:<26} {:<8}",
                    "IP Address", "Granted", "Expires", "TTL"
                );
                println!("{:-<78}", "");
                for grant in grants {
                    println!(
                        "{:<15} {:<26} {:<26} {:<8}",
                        grant.client,
                        grant.granted_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        grant.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        grant.ttl.as_secs(),
                    );
                }
            }
            other => unexpected(other),
        },
        Commands::Revoke { ip } => match send_command(&cli.socket, &Command::Revoke { ip }).await? {
            Response::Success => println!("Revoked grant for {}", ip),
            Response::Error(e) => eprintln!("Failed to revoke grant for {}: {}", ip, e),
            other => unexpected(other),
        },
        Commands::Extend { ip, ttl } => {
            let command = Command::Extend { ip, ttl_secs: ttl };
            match send_command(&cli.socket, &command).await? {
                Response::Grant(grant) => {
                    println!("Grant for {} now expires at {}", ip, grant.expires_at)
                }
                Response::Error(e) => eprintln!("Failed to extend grant for {}: {}", ip, e),
                other => unexpected(other),
            }
        }
        Commands::Classify { ip, protocol, port } => {
            let command = Command::Classify { ip, protocol, port };
            match send_command(&cli.socket, &command).await? {
                Response::Verdict(c) => {
                    let matched = c
                        .matched
                        .map_or_else(|| "(none)".to_string(), |rule| rule.to_string());
                    println!(
                        "{} {}/{} -> {:?} via {}",
                        ip,
                        protocol.as_str(),
                        port,
                        c.verdict,
                        matched
                    );
                }
                other => unexpected(other),
            }
        }
        Commands::Status => match send_command(&cli.socket, &Command::Status).await? {
            Response::Status(status) => {
                println!("{:<18} {}", "Gateway", status.gateway);
                println!("{:<18} {}", "Portal", status.portal_url);
                println!(
                    "{:<18} {}",
                    "Uplink",
                    if status.uplink_up { "up" } else { "down" }
                );
                println!(
                    "{:<18} {}",
                    "Rule backend",
                    if status.degraded { "DEGRADED" } else { "ok" }
                );
                println!("{:<18} {}", "Admitted", status.admitted);
                println!("{:<18} {}", "Hijacked domains", status.hijacked_domains.join(", "));
            }
            other => unexpected(other),
        },
    }

    Ok(())
}
