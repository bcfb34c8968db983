use captive_core::{Grant, PacketMeta, Protocol, Rule, Verdict};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/captive.sock";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Revoke { ip: Ipv4Addr },
    /// Pushes expiry to now + `ttl_secs`, or the configured session TTL.
    Extend { ip: Ipv4Addr, ttl_secs: Option<u64> },
    Classify { ip: Ipv4Addr, protocol: Protocol, port: u16 },
    Status,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub packet: PacketMeta,
    pub matched: Option<Rule>,
    pub verdict: Verdict,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatus {
    pub gateway: Ipv4Addr,
    pub portal_url: String,
    pub uplink_up: bool,
    pub degraded: bool,
    pub admitted: usize,
    pub hijacked_domains: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Grants(Vec<Grant>),
    Grant(Grant),
    Verdict(Classification),
    Status(GatewayStatus),
    Success,
    Error(String),
}

/// One request/response exchange. The request is terminated by half-closing
/// the stream, the response by the server closing it.
pub async fn send_command<P: AsRef<Path>>(path: P, command: &Command) -> io::Result<Response> {
    let mut stream = UnixStream::connect(path).await?;
    let serialized = serde_json::to_vec(command)?;
    stream.write_all(&serialized).await?;
    stream.shutdown().await?;

    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    Ok(serde_json::from_slice(&buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_string(&Command::Revoke {
            ip: Ipv4Addr::new(10, 0, 0, 10),
        })
        .unwrap();
        assert_eq!(json, r#"{"Revoke":{"ip":"10.0.0.10"}}"#);

        let command: Command = serde_json::from_str(
            r#"{"Classify":{"ip":"10.0.0.10","protocol":"udp","port":53}}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            Command::Classify {
                ip: Ipv4Addr::new(10, 0, 0, 10),
                protocol: Protocol::Udp,
                port: 53
            }
        );
        assert_eq!(
            serde_json::from_str::<Command>(r#""List""#).unwrap(),
            Command::List
        );
    }

    #[tokio::test]
    async fn test_send_command_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captive.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            stream.read_to_end(&mut buffer).await.unwrap();
            let command: Command = serde_json::from_slice(&buffer).unwrap();
            let response = match command {
                Command::Status => Response::Success,
                other => Response::Error(format!("unexpected {:?}", other)),
            };
            stream
                .write_all(&serde_json::to_vec(&response).unwrap())
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        });

        let response = send_command(&path, &Command::Status).await.unwrap();
        assert_eq!(response, Response::Success);
        server.await.unwrap();
    }
}
