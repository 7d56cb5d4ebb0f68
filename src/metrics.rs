use prometheus::{opts, CounterVec, Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Prometheus metrics registry for the proxy. Ambient observability, not a
/// SOCKS5 feature -- the registry stays disjoint from protocol logic and is
/// only ever read from the HTTP metrics endpoint.
pub struct ProxyMetrics {
    registry: Registry,

    sessions_active: IntGauge,
    sessions_total: IntCounter,
    sessions_rejected: IntCounter,

    bytes_client_to_remote: IntCounter,
    bytes_remote_to_client: IntCounter,

    dns_queries_total: IntCounter,
    dns_queries_failed: IntCounter,

    protocol_errors: CounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sessions_active = IntGauge::with_opts(opts!(
            "socks5_sessions_active",
            "Number of sessions currently in flight"
        ))?;
        let sessions_total = IntCounter::with_opts(opts!(
            "socks5_sessions_total",
            "Total number of sessions accepted"
        ))?;
        let sessions_rejected = IntCounter::with_opts(opts!(
            "socks5_sessions_rejected_total",
            "Total number of connections rejected due to the admission cap"
        ))?;
        let bytes_client_to_remote = IntCounter::with_opts(opts!(
            "socks5_bytes_client_to_remote_total",
            "Total bytes relayed from clients to remote endpoints"
        ))?;
        let bytes_remote_to_client = IntCounter::with_opts(opts!(
            "socks5_bytes_remote_to_client_total",
            "Total bytes relayed from remote endpoints to clients"
        ))?;
        let dns_queries_total = IntCounter::with_opts(opts!(
            "socks5_dns_queries_total",
            "Total DNS queries issued for domain CONNECT requests"
        ))?;
        let dns_queries_failed = IntCounter::with_opts(opts!(
            "socks5_dns_queries_failed_total",
            "Total DNS queries that failed or timed out"
        ))?;
        let protocol_errors = CounterVec::new(
            opts!("socks5_protocol_errors_total", "Protocol errors by kind"),
            &["kind"],
        )?;

        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(sessions_rejected.clone()))?;
        registry.register(Box::new(bytes_client_to_remote.clone()))?;
        registry.register(Box::new(bytes_remote_to_client.clone()))?;
        registry.register(Box::new(dns_queries_total.clone()))?;
        registry.register(Box::new(dns_queries_failed.clone()))?;
        registry.register(Box::new(protocol_errors.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            sessions_total,
            sessions_rejected,
            bytes_client_to_remote,
            bytes_remote_to_client,
            dns_queries_total,
            dns_queries_failed,
            protocol_errors,
        })
    }

    pub fn session_started(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn session_ended(&self) {
        self.sessions_active.dec();
    }

    pub fn session_rejected(&self) {
        self.sessions_rejected.inc();
    }

    pub fn record_relayed(&self, client_to_remote: u64, remote_to_client: u64) {
        self.bytes_client_to_remote.inc_by(client_to_remote);
        self.bytes_remote_to_client.inc_by(remote_to_client);
    }

    pub fn dns_query_issued(&self) {
        self.dns_queries_total.inc();
    }

    pub fn dns_query_failed(&self) {
        self.dns_queries_failed.inc();
    }

    pub fn record_protocol_error(&self, kind: &str) {
        self.protocol_errors.with_label_values(&[kind]).inc();
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.get()
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}
