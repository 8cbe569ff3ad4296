use prometheus::{
    CounterVec, Encoder, IntCounter, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Prometheus collectors for the filtering core.
///
/// Both managers take an `Option<Arc<FilterMetrics>>`; a host that does not
/// scrape metrics passes `None` and pays nothing.
pub struct FilterMetrics {
    registry: Registry,

    /// Size of the active blocklist, delta-adjusted on each publish
    pub blocked_domains_total: IntGauge,
    /// Completed blocklist updates
    pub blocklist_updates: IntCounter,

    /// Queries answered from the blocklist
    pub queries_blocked: IntCounter,
    /// Queries that passed the blocklist
    pub queries_allowed: IntCounter,

    /// Queries rejected by the rate limiter, labelled by the rule that fired
    pub rate_limit_drops: CounterVec,
}

impl FilterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let blocked_domains_total = IntGauge::new(
            "vordr_blocked_domains_total",
            "Number of domains in the active blocklist",
        )?;
        registry.register(Box::new(blocked_domains_total.clone()))?;

        let blocklist_updates = IntCounter::new(
            "vordr_blocklist_updates_total",
            "Number of completed blocklist updates",
        )?;
        registry.register(Box::new(blocklist_updates.clone()))?;

        let queries_blocked = IntCounter::new(
            "vordr_queries_blocked_total",
            "Number of queries blocked by the blocklist",
        )?;
        registry.register(Box::new(queries_blocked.clone()))?;

        let queries_allowed = IntCounter::new(
            "vordr_queries_allowed_total",
            "Number of queries that passed the blocklist",
        )?;
        registry.register(Box::new(queries_allowed.clone()))?;

        let rate_limit_drops = CounterVec::new(
            opts!(
                "vordr_rate_limit_drops_total",
                "Number of queries rejected by the rate limiter"
            ),
            &["rule"],
        )?;
        registry.register(Box::new(rate_limit_drops.clone()))?;

        Ok(Self {
            registry,
            blocked_domains_total,
            blocklist_updates,
            queries_blocked,
            queries_allowed,
            rate_limit_drops,
        })
    }

    /// Render all collectors in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
