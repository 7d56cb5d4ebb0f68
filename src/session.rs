//! Per-connection state machine: method negotiation, the CONNECT request,
//! optional DNS resolution, and the bidirectional relay. One task per
//! accepted client, mirroring this codebase's one-task-per-query model but
//! living for the lifetime of the relay rather than a single request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::codec::{self, Address, CodecError, ConnectRequest, Greeting};
use crate::constants::{AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH, CMD_CONNECT, REP_SUCCEEDED};
use crate::dns::Resolver;
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::pool::{BufferPool, PooledItem};

/// Drives one client connection end to end. Errors are returned to the
/// caller for logging; the caller is responsible for closing `stream` by
/// letting it drop.
pub async fn run(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    resolver: Arc<Resolver>,
    metrics: Arc<ProxyMetrics>,
    buffer_pool: BufferPool,
) -> Result<(), ProxyError> {
    let mut inbox = buffer_pool.get();

    // A malformed version octet still gets the "otherwise" reject reply per
    // the greeting's two-way branch -- only a read failure (EOF/error) skips
    // straight to tearing the session down with no response at all.
    let greeting = match negotiate_method(&mut stream, &mut inbox).await {
        Ok(greeting) => greeting,
        Err(ProxyError::Protocol(CodecError::BadVersion(ver))) => {
            let mut out = Vec::with_capacity(2);
            codec::write_chosen_method(&mut out, AUTH_NO_ACCEPTABLE);
            let _ = stream.write_all(&out).await;
            return Err(ProxyError::Protocol(CodecError::BadVersion(ver)));
        }
        Err(e) => return Err(e),
    };
    if !greeting.supports_no_auth() {
        let mut out = Vec::with_capacity(2);
        codec::write_chosen_method(&mut out, AUTH_NO_ACCEPTABLE);
        stream.write_all(&out).await?;
        return Err(ProxyError::NoAcceptableMethod);
    }

    let mut out = Vec::with_capacity(2);
    codec::write_chosen_method(&mut out, AUTH_NO_AUTH);
    stream.write_all(&out).await?;

    let request = read_connect_request(&mut stream, &mut inbox).await?;
    if request.cmd != CMD_CONNECT {
        let mut reply = Vec::new();
        codec::write_failure_reply(&mut reply, &request.addr, request.port);
        stream.write_all(&reply).await?;
        metrics.record_protocol_error("unsupported_command");
        return Err(ProxyError::UnsupportedCommand(request.cmd));
    }

    let remote_addr = match &request.addr {
        Address::V4(ip) => SocketAddr::new((*ip).into(), request.port),
        Address::V6(ip) => SocketAddr::new((*ip).into(), request.port),
        Address::Domain(name) => {
            metrics.dns_query_issued();
            match resolver.resolve(name, request.port).await {
                Ok(addr) => addr,
                Err(e) => {
                    metrics.dns_query_failed();
                    let mut reply = Vec::new();
                    codec::write_failure_reply(&mut reply, &request.addr, request.port);
                    stream.write_all(&reply).await?;
                    return Err(e);
                }
            }
        }
    };

    debug!(%peer_addr, %remote_addr, "CONNECT");

    let remote = match TcpStream::connect(remote_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            let mut reply = Vec::new();
            codec::write_failure_reply(&mut reply, &request.addr, request.port);
            stream.write_all(&reply).await?;
            return Err(ProxyError::RemoteConnect(Arc::new(e)));
        }
    };

    // Echo the client's own requested address/port, not the proxy's ephemeral
    // outbound source port -- see S1 and §4.4 CONNECTING.
    let mut reply = Vec::new();
    codec::write_reply(&mut reply, REP_SUCCEEDED, &request.addr, request.port);
    stream.write_all(&reply).await?;

    let (client_to_remote, remote_to_client) =
        relay(stream, remote, inbox, buffer_pool.clone()).await?;
    metrics.record_relayed(client_to_remote, remote_to_client);

    Ok(())
}

/// Reads and parses the greeting, growing `inbox` across reads until a full
/// frame is buffered.
async fn negotiate_method(
    stream: &mut TcpStream,
    inbox: &mut Vec<u8>,
) -> Result<Greeting, ProxyError> {
    loop {
        match Greeting::parse(inbox) {
            Ok((greeting, consumed)) => {
                inbox.drain(..consumed);
                return Ok(greeting);
            }
            Err(CodecError::Incomplete) => read_more(stream, inbox).await?,
            Err(e) => return Err(ProxyError::Protocol(e)),
        }
    }
}

async fn read_connect_request(
    stream: &mut TcpStream,
    inbox: &mut Vec<u8>,
) -> Result<ConnectRequest, ProxyError> {
    loop {
        match ConnectRequest::parse(inbox) {
            Ok((request, consumed)) => {
                inbox.drain(..consumed);
                return Ok(request);
            }
            Err(CodecError::Incomplete) => read_more(stream, inbox).await?,
            Err(e) => return Err(ProxyError::Protocol(e)),
        }
    }
}

async fn read_more(stream: &mut TcpStream, inbox: &mut Vec<u8>) -> Result<(), ProxyError> {
    let mut chunk = [0u8; 512];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(ProxyError::Io(Arc::new(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "client closed connection mid-handshake",
        ))));
    }
    inbox.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Relays bytes in both directions until either side closes, using one
/// pooled buffer per direction. `leftover` is whatever the client already
/// pipelined past the CONNECT request in `inbox` -- it has to reach the
/// remote before anything read fresh off the socket, or it's silently
/// dropped. Returns `(client_to_remote, remote_to_client)` byte counts.
async fn relay(
    client: TcpStream,
    mut remote: TcpStream,
    leftover: PooledItem<Vec<u8>>,
    buffer_pool: BufferPool,
) -> Result<(u64, u64), ProxyError> {
    let leftover_len = leftover.len() as u64;
    if !leftover.is_empty() {
        remote.write_all(&leftover).await?;
    }
    drop(leftover);

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut remote_rd, mut remote_wr) = remote.into_split();

    let mut upload_buf = buffer_pool.get();
    let mut download_buf = buffer_pool.get();
    upload_buf.resize(upload_buf.capacity(), 0);
    download_buf.resize(download_buf.capacity(), 0);

    let upload = async move {
        let mut total = leftover_len;
        loop {
            let n = client_rd.read(&mut upload_buf).await?;
            if n == 0 {
                break;
            }
            remote_wr.write_all(&upload_buf[..n]).await?;
            total += n as u64;
        }
        let _ = remote_wr.shutdown().await;
        Ok::<u64, ProxyError>(total)
    };

    let download = async move {
        let mut total = 0u64;
        loop {
            let n = remote_rd.read(&mut download_buf).await?;
            if n == 0 {
                break;
            }
            client_wr.write_all(&download_buf[..n]).await?;
            total += n as u64;
        }
        let _ = client_wr.shutdown().await;
        Ok::<u64, ProxyError>(total)
    };

    let (uploaded, downloaded) = tokio::try_join!(upload, download)?;
    trace!(uploaded, downloaded, "relay finished");
    Ok((uploaded, downloaded))
}
