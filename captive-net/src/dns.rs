//! DNS interception for the managed segment.
//!
//! Connectivity-check names are answered with the gateway address for clients
//! that have not been admitted, which is what makes client operating systems
//! pop their captive-portal login sheet. Everything else is relayed to the
//! upstream resolver unchanged.

use anyhow::Result;
use captive_core::{RedirectPolicy, SessionStore};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use trust_dns_proto::error::ProtoResult;
use trust_dns_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::{DNSClass, RData, Record, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable, BinEncoder};

/// Large enough for EDNS0 replies.
pub const MAX_PACKET_LEN: usize = 4096;

/// What to do with one datagram from a client.
#[derive(Debug)]
pub enum Inbound {
    /// A standard query with exactly one question.
    Query(Message),
    /// The header was readable but the rest was not; send this back.
    Reject(Message),
    /// Too short, or not a query at all.
    Drop,
}

/// Classifies a datagram received on the DNS port.
pub fn read_query(packet: &[u8]) -> Inbound {
    let request = match Message::from_vec(packet) {
        Ok(request) => request,
        Err(e) => {
            let mut decoder = BinDecoder::new(packet);
            return match Header::read(&mut decoder) {
                Ok(header) if header.message_type() == MessageType::Query => {
                    debug!("Malformed query {}: {}", header.id(), e);
                    Inbound::Reject(error_reply(&header, ResponseCode::FormErr))
                }
                _ => Inbound::Drop,
            };
        }
    };

    if request.message_type() != MessageType::Query {
        return Inbound::Drop;
    }
    if request.op_code() != OpCode::Query {
        return Inbound::Reject(error_reply(request.header(), ResponseCode::NotImp));
    }
    if request.queries().len() != 1 {
        return Inbound::Reject(error_reply(request.header(), ResponseCode::FormErr));
    }
    Inbound::Query(request)
}

/// A bare header-only reply carrying `rcode`.
fn error_reply(header: &Header, rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(header.id())
        .set_message_type(MessageType::Response)
        .set_op_code(header.op_code())
        .set_recursion_desired(header.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    reply
}

/// A reply to `request` that echoes its question and has no answers yet.
pub fn reply_to(request: &Message, rcode: ResponseCode, authoritative: bool) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(authoritative)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode)
        .add_queries(request.queries().to_vec());
    reply
}

/// An authoritative answer pointing every question at `addr`.
pub fn answer_a(request: &Message, addr: Ipv4Addr, ttl: u32) -> Message {
    let mut reply = reply_to(request, ResponseCode::NoError, true);
    for query in request.queries() {
        reply.add_answer(Record::from_rdata(query.name().clone(), ttl, RData::A(addr)));
    }
    reply
}

/// A and ANY questions in class IN (or ANY) get the gateway address.
fn wants_address(query: &Query) -> bool {
    matches!(query.query_type(), RecordType::A | RecordType::ANY)
        && matches!(query.query_class(), DNSClass::IN | DNSClass::ANY)
}

pub fn encode(message: &Message) -> ProtoResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buffer);
    message.emit(&mut encoder)?;
    Ok(buffer)
}

/// Waits for the reply to query `id` from `upstream`, skipping anything else.
async fn recv_reply(socket: &UdpSocket, upstream: SocketAddrV4, id: u16) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_PACKET_LEN];
    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        if src != SocketAddr::V4(upstream) {
            continue;
        }
        let mut decoder = BinDecoder::new(&buf[..len]);
        match Header::read(&mut decoder) {
            Ok(h) if h.id() == id && h.message_type() == MessageType::Response => {
                buf.truncate(len);
                return Ok(buf);
            }
            _ => debug!("Ignoring stray reply from {}", src),
        }
    }
}

/// Answers queries from the managed segment.
pub struct DnsInterceptor {
    policy: Arc<RedirectPolicy>,
    store: Arc<SessionStore>,
    hijacked: HashSet<String>,
}

impl DnsInterceptor {
    pub fn new(policy: Arc<RedirectPolicy>, store: Arc<SessionStore>) -> Self {
        let hijacked = policy.hijack_set().into_iter().collect();
        DnsInterceptor {
            policy,
            store,
            hijacked,
        }
    }

    /// Exact, case-insensitive match; a trailing dot is ignored.
    pub fn is_hijacked(&self, name: &str) -> bool {
        self.hijacked
            .contains(&name.trim_end_matches('.').to_ascii_lowercase())
    }

    /// The reply to send for one datagram from `client`, if any.
    pub async fn resolve(&self, client: Ipv4Addr, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match read_query(packet) {
            Inbound::Query(request) => request,
            Inbound::Reject(reply) => {
                debug!("Rejecting query from {} with {:?}", client, reply.response_code());
                return finish(&reply);
            }
            Inbound::Drop => {
                debug!("Dropping datagram from {}", client);
                return None;
            }
        };
        let query = request.queries().first()?;
        let name = query.name().to_utf8();

        let admitted = self.store.touch(client);
        if self.is_hijacked(&name) && (!admitted || self.policy.hijack_after_admission) {
            debug!("Hijacking {} ({}) for {}", name, query.query_type(), client);
            if wants_address(query) {
                return finish(&answer_a(&request, self.policy.gateway, self.policy.hijack_ttl));
            }
            return finish(&reply_to(&request, ResponseCode::NoError, true));
        }

        let Some(upstream) = self.policy.upstream() else {
            return finish(&reply_to(&request, ResponseCode::NXDomain, false));
        };
        match self.forward(upstream, request.id(), packet).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("Upstream {} failed for {}: {}", upstream, name, e);
                finish(&reply_to(&request, ResponseCode::ServFail, false))
            }
        }
    }

    async fn forward(&self, upstream: SocketAddrV4, id: u16, packet: &[u8]) -> io::Result<Vec<u8>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.send_to(packet, upstream).await?;

        tokio::time::timeout(self.policy.dns_timeout(), recv_reply(&socket, upstream, id))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream resolver timed out"))?
    }

    /// Serves queries on `socket` until it fails. Each query gets its own task
    /// so a slow upstream never blocks hijacked answers.
    pub async fn run(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        info!("DNS interceptor listening on {}", socket.local_addr()?);
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("DNS receive error: {}", e);
                    continue;
                }
            };
            let SocketAddr::V4(src_v4) = src else {
                debug!("Ignoring IPv6 query from {}", src);
                continue;
            };
            let packet = buf[..len].to_vec();
            let this = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(reply) = this.resolve(*src_v4.ip(), &packet).await {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        warn!("Failed to answer {}: {}", src, e);
                    }
                }
            });
        }
    }
}

fn finish(reply: &Message) -> Option<Vec<u8>> {
    match encode(reply) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode reply {}: {}", reply.id(), e);
            None
        }
    }
}
