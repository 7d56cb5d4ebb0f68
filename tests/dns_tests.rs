//! Exercises `Resolver` against a minimal fake upstream DNS server, covering
//! the domain-resolution success and failure paths a CONNECT to a hostname
//! depends on.

use std::net::Ipv4Addr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::BinEncodable;
use socks5d::dns::Resolver;
use tokio::net::UdpSocket;

/// Spawns a fake upstream that always answers with `answer` (or NXDOMAIN if
/// `None`), using whatever question name/id the incoming query carried.
async fn fake_upstream(answer: Option<Ipv4Addr>) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(query) = Message::from_bytes(&buf[..n]) else {
                continue;
            };

            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            for q in query.queries() {
                response.add_query(q.clone());
            }

            match answer {
                Some(ip) => {
                    if let Some(q) = query.queries().first() {
                        let record = Record::from_rdata(q.name().clone(), 300, RData::A(A(ip)));
                        response.add_answer(record);
                    }
                }
                None => {
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }

            let bytes = response.to_bytes().unwrap();
            let _ = socket.send_to(&bytes, src).await;
        }
    });

    addr
}

#[tokio::test]
async fn resolves_domain_to_socket_addr() {
    let upstream = fake_upstream(Some(Ipv4Addr::new(93, 184, 216, 34))).await;
    let resolver = Resolver::connect(upstream).await.unwrap();

    let addr = resolver.resolve("example.com", 443).await.unwrap();
    assert_eq!(addr.ip(), Ipv4Addr::new(93, 184, 216, 34));
    assert_eq!(addr.port(), 443);
}

#[tokio::test]
async fn propagates_empty_answer_as_error() {
    let upstream = fake_upstream(None).await;
    let resolver = Resolver::connect(upstream).await.unwrap();

    let result = resolver.resolve("nxdomain.invalid", 80).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn times_out_when_upstream_never_answers() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    // No responder task: every query goes unanswered.

    let resolver = Resolver::connect(addr).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(6),
        resolver.resolve("stalls.invalid", 80),
    )
    .await
    .expect("resolve should return within its own timeout");

    assert!(result.is_err());
}
