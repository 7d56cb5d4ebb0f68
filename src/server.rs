use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::dns::Resolver;
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::pool::BufferPool;
use crate::session;

/// Accepts connections until `shutdown_rx` fires, admitting at most
/// `config.max_sessions` concurrently and spawning one task per session.
pub async fn run(
    config: ProxyConfig,
    resolver: Arc<Resolver>,
    metrics: Arc<ProxyMetrics>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProxyError> {
    let listener = bind_listener(&config).map_err(|e| ProxyError::Bind {
        addr: config.listen_addr,
        source: Arc::new(e),
    })?;
    info!("SOCKS5 proxy listening on {}", config.listen_addr);

    let admission = Arc::new(Semaphore::new(config.max_sessions));
    let buffer_pool = BufferPool::new(config.buffer_capacity, config.max_sessions * 2);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("listener received shutdown signal");
                break;
            }

            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };

                let permit = match admission.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("max sessions reached, rejecting connection from {peer_addr}");
                        metrics.session_rejected();
                        continue;
                    }
                };

                let resolver = resolver.clone();
                let metrics = metrics.clone();
                let buffer_pool = buffer_pool.clone();

                metrics.session_started();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = session::run(stream, peer_addr, resolver, metrics.clone(), buffer_pool).await {
                        debug!("session with {peer_addr} ended: {e}");
                    }
                    metrics.session_ended();
                });
            }
        }
    }

    Ok(())
}

/// Binds the listener with the configured backlog. `tokio::net::TcpListener`
/// always asks the OS for its own default backlog, so the socket is built by
/// hand with `socket2` and handed to tokio only once it's already listening.
fn bind_listener(config: &ProxyConfig) -> std::io::Result<TcpListener> {
    let domain = if config.listen_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&config.listen_addr.into())?;
    socket.listen(config.backlog as i32)?;
    TcpListener::from_std(socket.into())
}
