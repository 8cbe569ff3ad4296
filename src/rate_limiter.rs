/// Per-client admission control with token buckets and CIDR overrides
use crate::blocking::BlockAction;
use crate::metrics::FilterMetrics;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Injectable time source so bucket behavior is testable.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall-clock monotonic time; the production clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Configuration for per-client DNS rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting; when false no manager is constructed
    pub enabled: bool,

    /// Sustained queries per second per client
    pub requests_per_second: f64,

    /// Burst allowance per client
    pub burst: u32,

    /// How limited clients are answered
    pub action: BlockAction,

    /// Sweep interval; entries idle longer than this are dropped.
    /// Zero disables the sweeper.
    pub cleanup_interval: Duration,

    /// Maximum client table size; the oldest entry is evicted beyond this.
    /// Zero means unbounded.
    pub max_tracked_clients: usize,

    /// Emit a warning event for each limited query
    pub log_violations: bool,

    /// Per-IP / per-CIDR exceptions to the global limits
    pub overrides: Vec<RateLimitOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 50.0,
            burst: 100,
            action: BlockAction::Drop,
            cleanup_interval: Duration::from_secs(300),
            max_tracked_clients: 100_000,
            log_violations: true,
            overrides: Vec::new(),
        }
    }
}

/// A named exception: specific clients or subnets get their own limits.
/// Unset fields inherit the global values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOverride {
    pub name: String,
    pub clients: Vec<String>,
    pub cidrs: Vec<String>,
    pub requests_per_second: Option<f64>,
    pub burst: Option<u32>,
    pub action: Option<BlockAction>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limited: bool,
    pub action: BlockAction,
    /// Name of the override rule that applied, or `"global"`.
    pub label: Arc<str>,
}

/// Continuous-refill token bucket: capacity `burst`, refill
/// `requests_per_second` tokens per second, initialized full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            tokens: burst,
            burst,
            rate: rate.max(0.0),
            last_refill: now,
        }
    }

    /// Refill for the elapsed time, then consume `tokens` if available.
    pub fn try_consume(&mut self, tokens: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }
}

/// Limits resolved for one client at first sight.
#[derive(Debug, Clone)]
struct LimiterSettings {
    rate: f64,
    burst: u32,
    action: BlockAction,
    label: Arc<str>,
}

/// An override compiled against its CIDR selectors, kept in config order.
#[derive(Debug)]
struct OverrideMatcher {
    settings: LimiterSettings,
    cidrs: Vec<IpNetwork>,
}

#[derive(Debug)]
struct ClientEntry {
    bucket: TokenBucket,
    last_seen: Instant,
    action: BlockAction,
    label: Arc<str>,
}

/// Per-client rate limiter.
///
/// The client table lives under one short-held mutex; admission is O(1)
/// except when the table is full and the oldest entry is scanned out. A
/// background sweeper caps memory by dropping idle clients.
pub struct RateLimitManager {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    clients: Mutex<FxHashMap<String, ClientEntry>>,
    by_ip: FxHashMap<String, LimiterSettings>,
    by_cidr: Vec<OverrideMatcher>,
    global: LimiterSettings,
    metrics: Option<Arc<FilterMetrics>>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RateLimitManager {
    /// Build a manager, or `None` when rate limiting is disabled; callers
    /// bypass admission entirely in that case.
    pub fn new(config: RateLimitConfig, metrics: Option<Arc<FilterMetrics>>) -> Option<Self> {
        Self::with_clock(config, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RateLimitConfig,
        metrics: Option<Arc<FilterMetrics>>,
        clock: Arc<dyn Clock>,
    ) -> Option<Self> {
        if !config.enabled {
            debug!("rate limiting disabled");
            return None;
        }

        let (by_ip, by_cidr) = compile_overrides(&config);
        let global = LimiterSettings {
            rate: config.requests_per_second,
            burst: config.burst,
            action: config.action,
            label: Arc::from("global"),
        };

        info!(
            rps = config.requests_per_second,
            burst = config.burst,
            overrides = by_cidr.len(),
            pinned_clients = by_ip.len(),
            "rate limiting enabled"
        );

        Some(Self {
            config,
            clock,
            clients: Mutex::new(FxHashMap::default()),
            by_ip,
            by_cidr,
            global,
            metrics,
            sweeper: Mutex::new(None),
        })
    }

    /// Admit or reject one query from `client_ip`.
    ///
    /// An empty client string short-circuits permissive. Unknown clients get
    /// a fresh bucket sized by the first matching override (exact IP, then
    /// CIDRs in config order) or the global limits; when the table is full
    /// the stalest entry is evicted first.
    pub fn allow(&self, client_ip: &str) -> RateLimitDecision {
        if client_ip.is_empty() {
            return RateLimitDecision {
                allowed: true,
                limited: false,
                action: self.global.action,
                label: self.global.label.clone(),
            };
        }

        let now = self.clock.now();
        let parsed = client_ip.parse::<IpAddr>().ok();
        let key = parsed
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| client_ip.to_string());

        let decision = {
            let mut clients = self.clients.lock();

            if !clients.contains_key(&key)
                && self.config.max_tracked_clients > 0
                && clients.len() >= self.config.max_tracked_clients
            {
                evict_oldest(&mut clients);
            }

            let entry = clients.entry(key).or_insert_with(|| {
                let settings = self.resolve_settings(parsed);
                ClientEntry {
                    bucket: TokenBucket::new(settings.rate, settings.burst, now),
                    last_seen: now,
                    action: settings.action,
                    label: settings.label.clone(),
                }
            });

            let allowed = entry.bucket.try_consume(1.0, now);
            entry.last_seen = now;

            RateLimitDecision {
                allowed,
                limited: !allowed,
                action: entry.action,
                label: entry.label.clone(),
            }
        };

        if decision.limited {
            if let Some(metrics) = &self.metrics {
                metrics
                    .rate_limit_drops
                    .with_label_values(&[decision.label.as_ref()])
                    .inc();
            }
            if self.config.log_violations {
                warn!(client = client_ip, rule = %decision.label, "rate limit exceeded");
            }
        }

        decision
    }

    /// First matching override wins: exact IP map, then CIDRs in config
    /// order, then the global limits.
    fn resolve_settings(&self, ip: Option<IpAddr>) -> &LimiterSettings {
        if let Some(ip) = ip {
            if let Some(settings) = self.by_ip.get(&ip.to_string()) {
                return settings;
            }
            for matcher in &self.by_cidr {
                if matcher.cidrs.iter().any(|net| net.contains(ip)) {
                    return &matcher.settings;
                }
            }
        }
        &self.global
    }

    /// Spawn the background sweeper if a cleanup interval is configured.
    pub fn start(self: Arc<Self>) {
        if self.config.cleanup_interval.is_zero() {
            return;
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = Arc::clone(&self);
            let token = token.clone();
            async move { manager.run_sweep_loop(token).await }
        });
        *sweeper = Some((token, handle));
        info!(
            interval_secs = self.config.cleanup_interval.as_secs(),
            "rate limiter sweeper started"
        );
    }

    async fn run_sweep_loop(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("rate limiter sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    /// Drop every client idle for longer than the cleanup interval.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let max_idle = self.config.cleanup_interval;

        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= max_idle);

        let removed = before - clients.len();
        if removed > 0 {
            debug!(
                removed,
                remaining = clients.len(),
                "swept idle rate limit clients"
            );
        }
    }

    /// Signal the sweeper and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let task = self.sweeper.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "rate limiter sweeper join failed");
            }
        }
    }

    pub fn log_violations(&self) -> bool {
        self.config.log_violations
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

fn compile_overrides(
    config: &RateLimitConfig,
) -> (FxHashMap<String, LimiterSettings>, Vec<OverrideMatcher>) {
    let mut by_ip = FxHashMap::default();
    let mut by_cidr = Vec::new();

    for rule in &config.overrides {
        let settings = LimiterSettings {
            rate: rule
                .requests_per_second
                .unwrap_or(config.requests_per_second),
            burst: rule.burst.unwrap_or(config.burst),
            action: rule.action.unwrap_or(config.action),
            label: Arc::from(rule.name.as_str()),
        };

        let mut selectors = 0usize;
        for client in &rule.clients {
            match client.parse::<IpAddr>() {
                Ok(ip) => {
                    by_ip.insert(ip.to_string(), settings.clone());
                    selectors += 1;
                }
                Err(e) => {
                    warn!(client = %client, rule = %rule.name, error = %e, "skipping invalid override client IP");
                }
            }
        }

        let mut cidrs = Vec::new();
        for cidr in &rule.cidrs {
            match cidr.parse::<IpNetwork>() {
                Ok(net) => cidrs.push(net),
                Err(e) => {
                    warn!(cidr = %cidr, rule = %rule.name, error = %e, "skipping invalid override CIDR");
                }
            }
        }
        if !cidrs.is_empty() {
            selectors += cidrs.len();
            by_cidr.push(OverrideMatcher {
                settings: settings.clone(),
                cidrs,
            });
        }

        if selectors == 0 {
            debug!(rule = %rule.name, "dropping override with no usable selector");
        }
    }

    (by_ip, by_cidr)
}

/// Linear scan for the stalest entry; acceptable at the configured table
/// sizes (thousands).
fn evict_oldest(clients: &mut FxHashMap<String, ClientEntry>) {
    let oldest = clients
        .iter()
        .min_by_key(|(_, entry)| entry.last_seen)
        .map(|(key, _)| key.clone());

    if let Some(key) = oldest {
        debug!(client = %key, "evicting stalest rate limit entry");
        clients.remove(&key);
    }
}
