//! Out-of-band DNS resolution for CONNECT requests that name a domain.
//!
//! A single UDP socket, connected to the upstream resolver, is shared by
//! every in-flight query. Query construction and response parsing are
//! delegated to `hickory-proto` (the spec treats the DNS message codec as an
//! external collaborator); what this module owns is the transaction-id
//! space and the table that demultiplexes one shared socket across many
//! concurrent resolutions, mirroring this codebase's `QUERY_ID_COUNTER` /
//! `in_flight_queries` pattern for upstream DNS queries.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::constants::DNS_QUERY_TIMEOUT;
use crate::error::ProxyError;

/// What a query resolves to, or why it didn't.
type Outcome = Result<Ipv4Addr, Failure>;

#[derive(Debug, Clone, Copy)]
enum Failure {
    /// The response parsed but carried no A record.
    EmptyAnswer,
    /// The response datagram didn't parse as a DNS message at all.
    Malformed,
}

/// An entry in the demultiplexer: who's waiting, keyed by transaction id.
/// Dropping a session while it holds the corresponding [`PendingQuery`]
/// guard purges the entry even if no response ever arrives.
pub struct Resolver {
    socket: Arc<UdpSocket>,
    next_id: AtomicU16,
    pending: Arc<DashMap<u16, oneshot::Sender<Outcome>>>,
}

impl Resolver {
    /// Connects a fresh UDP socket to `upstream` and spawns the background
    /// task that demultiplexes its responses. The socket is connected, not
    /// bound, so the OS routes every send to `upstream` alone.
    pub async fn connect(upstream: SocketAddr) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| ProxyError::DnsSocket(Arc::new(e)))?;
        socket
            .connect(upstream)
            .await
            .map_err(|e| ProxyError::DnsSocket(Arc::new(e)))?;
        let socket = Arc::new(socket);
        let pending = Arc::new(DashMap::new());

        tokio::spawn(recv_loop(socket.clone(), pending.clone()));

        Ok(Self {
            socket,
            next_id: AtomicU16::new(1),
            pending,
        })
    }

    /// Resolves `name` to an address, combining the first A record returned
    /// with `port` (the DNS response itself carries no port, so the caller's
    /// port has to be stashed and recombined here, same as the original
    /// design's `PendingQuery`).
    pub async fn resolve(&self, name: &str, port: u16) -> Result<SocketAddr, ProxyError> {
        let query_name = Name::from_ascii(name).map_err(|e| ProxyError::DnsResolution {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        let id = self.register(tx);
        let _guard = PendingQuery {
            pending: self.pending.clone(),
            id,
        };

        let query_bytes = build_query(id, query_name).map_err(|e| ProxyError::DnsResolution {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        self.socket
            .send(&query_bytes)
            .await
            .map_err(|e| ProxyError::DnsResolution {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let outcome = timeout(DNS_QUERY_TIMEOUT, rx)
            .await
            .map_err(|_| ProxyError::DnsTimeout)?
            .map_err(|_| ProxyError::DnsResolution {
                name: name.to_string(),
                reason: "resolver task ended before answering".to_string(),
            })?;

        match outcome {
            Ok(ip) => Ok(SocketAddr::new(ip.into(), port)),
            Err(Failure::EmptyAnswer) => Err(ProxyError::DnsResolution {
                name: name.to_string(),
                reason: "no A record in response".to_string(),
            }),
            Err(Failure::Malformed) => Err(ProxyError::DnsResolution {
                name: name.to_string(),
                reason: "malformed response".to_string(),
            }),
        }
    }

    /// Allocates a transaction id that isn't currently pending and registers
    /// `tx` under it. Collisions (the 16-bit counter wrapping past an id
    /// that's still outstanding) are resolved by skipping to the next
    /// candidate; the pending table is expected to hold at most a few
    /// hundred entries; so a handful of `contains_key` checks is acceptable,
    /// the same tradeoff the original spec makes explicit.
    fn register(&self, mut tx: oneshot::Sender<Outcome>) -> u16 {
        loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            tx = match self.pending.entry(candidate) {
                Entry::Vacant(slot) => {
                    slot.insert(tx);
                    return candidate;
                }
                // Candidate still in flight; retry with the next id.
                Entry::Occupied(_) => tx,
            };
        }
    }
}

/// RAII guard for one outstanding DNS query. Its `Drop` purges the pending
/// entry if nothing has claimed it yet -- the Rust stand-in for "treat the
/// pending-query entry as an additional outstanding reference" from the
/// original design notes: cancelling the session that's awaiting resolution
/// (e.g. the client vanished) drops this guard and the entry goes with it,
/// instead of leaking until the counter wraps back around.
struct PendingQuery {
    pending: Arc<DashMap<u16, oneshot::Sender<Outcome>>>,
    id: u16,
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, pending: Arc<DashMap<u16, oneshot::Sender<Outcome>>>) {
    let mut buf = vec![0u8; 512];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("DNS socket recv failed: {e}");
                continue;
            }
        };

        let message = match Message::from_bytes(&buf[..n]) {
            Ok(message) => message,
            Err(e) => {
                trace!("dropping unparseable DNS datagram: {e}");
                continue;
            }
        };

        let Some((_, tx)) = pending.remove(&message.id()) else {
            // Either a duplicate/late response or the owning session already
            // tore down and purged its guard; either way, not an error.
            trace!("dropping DNS response with no pending query, id={}", message.id());
            continue;
        };

        let _ = tx.send(first_a_record(&message));
    }
}

fn first_a_record(message: &Message) -> Outcome {
    if message.answer_count() == 0 {
        return Err(Failure::EmptyAnswer);
    }
    message
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            RData::A(A(addr)) => Some(*addr),
            _ => None,
        })
        .ok_or(Failure::EmptyAnswer)
}

fn build_query(id: u16, name: Name) -> Result<Vec<u8>, hickory_proto::error::ProtoError> {
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::A);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);

    message.to_bytes()
}
