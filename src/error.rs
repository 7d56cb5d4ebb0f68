use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the proxy.
///
/// Bootstrap errors (anything that prevents the listener or DNS socket from
/// coming up) are fatal and propagate out of `main`. Everything else is
/// confined to the session or accept iteration that produced it.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: Arc<std::io::Error>,
    },

    #[error("failed to create DNS socket: {0}")]
    DnsSocket(Arc<std::io::Error>),

    #[error("malformed SOCKS5 frame: {0}")]
    Protocol(#[from] crate::codec::CodecError),

    #[error("unsupported SOCKS5 command: {0:#x}")]
    UnsupportedCommand(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("DNS resolution failed for {name}: {reason}")]
    DnsResolution { name: String, reason: String },

    #[error("DNS query timed out")]
    DnsTimeout,

    #[error("remote connect failed: {0}")]
    RemoteConnect(Arc<std::io::Error>),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid listen port: {0}")]
    InvalidPort(String),

    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("invalid DNS upstream address: {0}")]
    InvalidDnsUpstream(String),

    #[error("buffer capacity must be nonzero")]
    ZeroBufferCapacity,

    #[error("max sessions must be nonzero")]
    ZeroMaxSessions,

    #[error("invalid metrics bind address: {0}")]
    InvalidMetricsAddress(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
