//! End-to-end tests against a real listener bound to an ephemeral port,
//! driving the wire protocol with literal byte sequences.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::BinEncodable;
use socks5d::config::ProxyConfig;
use socks5d::dns::Resolver;
use socks5d::metrics::ProxyMetrics;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

async fn spawn_proxy(dns_upstream: SocketAddr) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ProxyConfig {
        listen_addr,
        dns_upstream,
        buffer_capacity: 4096,
        backlog: 16,
        max_sessions: 4,
        metrics_addr: None,
    };

    let resolver = Arc::new(Resolver::connect(config.dns_upstream).await.unwrap());
    let metrics = Arc::new(ProxyMetrics::new().unwrap());
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let _ = socks5d::server::run(config, resolver, metrics, shutdown_rx).await;
    });

    // Give the listener a moment to bind before the first connect.
    tokio::time::sleep(Duration::from_millis(20)).await;

    (listen_addr, shutdown_tx)
}

/// A fake upstream DNS resolver, same shape as `tests/dns_tests.rs`'s, reused
/// here to drive domain-CONNECT end to end through the proxy rather than
/// against `Resolver` in isolation.
async fn fake_dns_upstream(answer: Option<Ipv4Addr>) -> SocketAddr {
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

/// Builds a literal `05 01 00 01 <addr> <port>` CONNECT request for an IPv4
/// target, matching spec.md's S1/S3 byte layout.
fn ipv4_connect_request(target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("expected an IPv4 target");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    request
}

/// Builds a literal `05 01 00 03 <len> <name> <port>` CONNECT request for a
/// domain target, matching spec.md's S4/S5 byte layout.
fn domain_connect_request(name: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    request.extend_from_slice(name.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

#[tokio::test]
async fn connects_to_ipv4_target_via_socks5() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = echo.accept().await {
            let mut buf = [0u8; 5];
            let _ = stream.read_exact(&mut buf).await;
            let _ = stream.write_all(&buf).await;
        }
    });

    let (proxy_addr, _shutdown) = spawn_proxy("127.0.0.1:1".parse().unwrap()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let request = ipv4_connect_request(echo_addr);
    client.write_all(&request).await.unwrap();

    // Full 10-byte reply, byte for byte: the CONNECT reply must echo the
    // client's own requested address/port (S1), not the proxy's ephemeral
    // outbound source port.
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    let mut expected_reply = vec![0x05, 0x00, 0x00, 0x01];
    let SocketAddr::V4(echo_v4) = echo_addr else {
        panic!("expected an IPv4 echo address");
    };
    expected_reply.extend_from_slice(&echo_v4.ip().octets());
    expected_reply.extend_from_slice(&echo_v4.port().to_be_bytes());
    assert_eq!(&connect_reply[..], &expected_reply[..]);

    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
}

#[tokio::test]
async fn rejects_greeting_without_no_auth_method() {
    let (proxy_addr, _shutdown) = spawn_proxy("127.0.0.1:1".parse().unwrap()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    // Offer only GSSAPI (0x01), which this proxy never accepts.
    client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0xFF]);

    // The server closes the connection after NO_ACCEPTABLE_METHODS.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn reports_general_failure_for_unreachable_remote() {
    let (proxy_addr, _shutdown) = spawn_proxy("127.0.0.1:1".parse().unwrap()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    // Port 1 on loopback should refuse the connection immediately.
    let request = ipv4_connect_request("127.0.0.1:1".parse().unwrap());
    client.write_all(&request).await.unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x01); // general failure
}

#[tokio::test]
async fn serves_many_concurrent_clients() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = echo.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                }
            });
        }
    });

    let (proxy_addr, _shutdown) = spawn_proxy("127.0.0.1:1".parse().unwrap()).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(proxy_addr).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method_reply = [0u8; 2];
            client.read_exact(&mut method_reply).await.unwrap();

            let request = ipv4_connect_request(echo_addr);
            client.write_all(&request).await.unwrap();

            let mut connect_reply = [0u8; 10];
            client.read_exact(&mut connect_reply).await.unwrap();
            assert_eq!(connect_reply[1], 0x00);

            client.write_all(b"ping").await.unwrap();
            let mut echoed = [0u8; 4];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(&echoed, b"ping");
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn resolves_domain_connect_end_to_end() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    let SocketAddr::V4(echo_v4) = echo_addr else {
        panic!("expected an IPv4 echo address");
    };
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = echo.accept().await {
            let mut buf = [0u8; 5];
            let _ = stream.read_exact(&mut buf).await;
            let _ = stream.write_all(&buf).await;
        }
    });

    let dns_upstream = fake_dns_upstream(Some(*echo_v4.ip())).await;
    let (proxy_addr, _shutdown) = spawn_proxy(dns_upstream).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let request = domain_connect_request("resolves.invalid", echo_v4.port());
    client.write_all(&request).await.unwrap();

    // Domain reply length is `7 + len(name)`, and the reply echoes the
    // requested domain/port, not the resolved IPv4 address (S4, atyp 0x03).
    let mut connect_reply = vec![0u8; 7 + "resolves.invalid".len()];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[0], 0x05);
    assert_eq!(connect_reply[1], 0x00); // succeeded
    assert_eq!(connect_reply[3], 0x03); // ATYP_DOMAIN
    assert_eq!(connect_reply[4], "resolves.invalid".len() as u8);
    assert_eq!(&connect_reply[5..5 + "resolves.invalid".len()], b"resolves.invalid");

    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
}

#[tokio::test]
async fn domain_resolution_failure_reports_general_failure() {
    let dns_upstream = fake_dns_upstream(None).await;
    let (proxy_addr, _shutdown) = spawn_proxy(dns_upstream).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    let request = domain_connect_request("nxdomain.invalid", 80);
    client.write_all(&request).await.unwrap();

    let mut connect_reply = vec![0u8; 7 + "nxdomain.invalid".len()];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x01); // general failure

    // The proxy then closes the client connection.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
