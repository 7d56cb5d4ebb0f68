use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;

use crate::constants::{
    DEFAULT_BACKLOG, DEFAULT_BUFFER_CAPACITY, DEFAULT_DNS_UPSTREAM, DEFAULT_LISTEN_PORT,
    DEFAULT_MAX_SESSIONS,
};
use crate::error::ConfigError;

/// `proxy [port]` plus the knobs this codebase always exposes alongside a
/// positional default: bind address, upstream resolver, per-session buffer
/// size, listen backlog, the admission cap standing in for submission-queue
/// capacity, and an optional metrics/health endpoint.
#[derive(Parser, Debug, Clone)]
#[command(name = "socks5d", author, version, about = "A SOCKS5 CONNECT proxy")]
pub struct Cli {
    /// Port to listen on.
    #[arg(default_value_t = DEFAULT_LISTEN_PORT)]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_addr: IpAddr,

    /// Upstream DNS resolver used for domain CONNECT requests.
    #[arg(long, default_value = DEFAULT_DNS_UPSTREAM)]
    pub dns_upstream: String,

    /// Per-session buffer capacity, in bytes, for each direction.
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    pub buffer_capacity: usize,

    /// TCP listen backlog.
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,

    /// Maximum number of concurrently admitted sessions.
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Bind address for the `/metrics` and `/health` HTTP endpoints. Unset
    /// disables the endpoint entirely.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

/// Validated configuration handed to the listener and resolver.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub dns_upstream: SocketAddr,
    pub buffer_capacity: usize,
    pub backlog: u32,
    pub max_sessions: usize,
    pub metrics_addr: Option<SocketAddr>,
}

impl ProxyConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.buffer_capacity == 0 {
            return Err(ConfigError::ZeroBufferCapacity);
        }
        if cli.max_sessions == 0 {
            return Err(ConfigError::ZeroMaxSessions);
        }

        let dns_upstream = cli
            .dns_upstream
            .parse()
            .map_err(|_| ConfigError::InvalidDnsUpstream(cli.dns_upstream.clone()))?;

        Ok(Self {
            listen_addr: SocketAddr::new(cli.bind_addr, cli.port),
            dns_upstream,
            buffer_capacity: cli.buffer_capacity,
            backlog: cli.backlog,
            max_sessions: cli.max_sessions,
            metrics_addr: cli.metrics_addr,
        })
    }
}
