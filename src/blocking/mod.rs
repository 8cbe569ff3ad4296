/// Domain blocking for Vordr
/// Owns the active blocklist dataset and pattern matcher, and keeps both
/// fresh from the configured HTTP sources while queries read concurrently.
use crate::error::{DownloadError, PatternError};
use crate::metrics::FilterMetrics;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod downloader;
pub mod parser;
pub mod patterns;

pub use downloader::{BlocklistDownloader, DEFAULT_DOWNLOAD_TIMEOUT};
pub use parser::extract_domain;
pub use patterns::{PatternMatcher, PatternStats};

/// Each scheduled update must finish within this deadline.
const UPDATE_DEADLINE: Duration = Duration::from_secs(300);

/// How the host answers a query that was blocked or rate-limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockAction {
    /// Send no response at all
    #[default]
    Drop,
    /// Return an authoritative NXDOMAIN
    NxDomain,
    /// Return REFUSED
    Refused,
}

impl BlockAction {
    /// Parse an action from string form, defaulting to `Drop`
    pub fn parse_str(action: &str) -> Self {
        match action.to_lowercase().as_str() {
            "nxdomain" => BlockAction::NxDomain,
            "refused" => BlockAction::Refused,
            _ => BlockAction::Drop,
        }
    }
}

/// Blocklist source and refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Source URLs, fetched in parallel on every update
    pub sources: Vec<String>,
    /// Refresh the blocklist on a timer after `start`
    pub auto_update: bool,
    /// Interval between scheduled updates
    pub update_interval: Duration,
    /// Per-source HTTP timeout
    pub download_timeout: Duration,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            auto_update: true,
            update_interval: Duration::from_secs(86400),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

/// Summary counts over the active dataset and pattern matcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlocklistStats {
    pub exact: usize,
    pub pattern_exact: usize,
    pub pattern_wildcard: usize,
    pub pattern_regex: usize,
    pub total: usize,
}

struct Lifecycle {
    started: bool,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

/// The blocking engine.
///
/// Readers call `is_blocked` lock-free against atomically published
/// snapshots; a single background task (or the host, via `update`) replaces
/// the snapshots wholesale. The previous dataset stays alive until its last
/// reader departs.
pub struct BlocklistManager {
    config: ArcSwap<BlocklistConfig>,
    downloader: BlocklistDownloader,
    /// Active exact-match set. Never mutated in place.
    current: ArcSwap<FxHashSet<String>>,
    /// Active pattern matcher, absent until `set_patterns` installs one.
    patterns: ArcSwapOption<PatternMatcher>,
    metrics: Option<Arc<FilterMetrics>>,
    lifecycle: Mutex<Lifecycle>,
}

impl BlocklistManager {
    pub fn new(config: BlocklistConfig, metrics: Option<Arc<FilterMetrics>>) -> Self {
        let downloader = BlocklistDownloader::new(config.download_timeout);

        Self {
            config: ArcSwap::from_pointee(config),
            downloader,
            current: ArcSwap::from_pointee(FxHashSet::default()),
            patterns: ArcSwapOption::empty(),
            metrics,
            lifecycle: Mutex::new(Lifecycle {
                started: false,
                task: None,
            }),
        }
    }

    /// Start the manager: one blocking update now, then a scheduled update
    /// task if auto-update is configured. Idempotent; a second call while
    /// running only warns. Restart after `stop` is permitted.
    pub async fn start(self: Arc<Self>, token: &CancellationToken) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.started {
                warn!("blocklist manager already started");
                return;
            }
            lifecycle.started = true;
        }

        if let Err(e) = self.update(token).await {
            warn!(error = %e, "initial blocklist update failed");
        }

        let config = self.config.load();
        if config.auto_update && !config.update_interval.is_zero() {
            let stop = CancellationToken::new();
            let handle = tokio::spawn({
                let manager = Arc::clone(&self);
                let stop = stop.clone();
                async move { manager.run_update_loop(stop).await }
            });
            self.lifecycle.lock().task = Some((stop, handle));
            info!(
                interval_secs = config.update_interval.as_secs(),
                "blocklist auto-update scheduled"
            );
        }
    }

    /// Signal the scheduled update task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let task = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.started = false;
            lifecycle.task.take()
        };

        if let Some((stop, handle)) = task {
            stop.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "blocklist update task join failed");
            }
        }
    }

    async fn run_update_loop(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.load().update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the initial update already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("blocklist update task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let tick_token = stop.child_token();
                    match tokio::time::timeout(UPDATE_DEADLINE, self.update(&tick_token)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "scheduled blocklist update failed"),
                        Err(_) => {
                            tick_token.cancel();
                            warn!(
                                deadline_secs = UPDATE_DEADLINE.as_secs(),
                                "scheduled blocklist update exceeded deadline"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Download all configured sources, merge them, and atomically publish
    /// the merged set. Per-source failures are logged by the downloader and
    /// never fail the update; a canceled update publishes nothing.
    pub async fn update(&self, token: &CancellationToken) -> Result<(), DownloadError> {
        let config = self.config.load_full();
        let start = Instant::now();

        let new_set = self.downloader.download_all(token, &config.sources).await;
        if token.is_cancelled() {
            debug!("blocklist update canceled; keeping previous dataset");
            return Ok(());
        }

        let old_len = self.current.load().len();
        let total = new_set.len();
        let delta = total as i64 - old_len as i64;
        self.current.store(Arc::new(new_set));

        let elapsed = start.elapsed();
        info!(
            total,
            delta,
            sources = config.sources.len(),
            duration_ms = elapsed.as_millis() as u64,
            domains_per_sec = (total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
            "blocklist updated"
        );

        if let Some(metrics) = &self.metrics {
            metrics.blocked_domains_total.add(delta);
            metrics.blocklist_updates.inc();
        }

        Ok(())
    }

    /// Check whether a domain is blocked by the active dataset or patterns.
    ///
    /// Lock-free: loads the current snapshots and tests membership. Does not
    /// allocate when the query is already in canonical form.
    pub fn is_blocked(&self, domain: &str) -> bool {
        let qname = parser::canonical_query(domain);

        let blocked = self.current.load().contains(qname.as_ref())
            || self
                .patterns
                .load()
                .as_ref()
                .is_some_and(|m| m.matches(qname.as_ref()));

        if let Some(metrics) = &self.metrics {
            if blocked {
                metrics.queries_blocked.inc();
            } else {
                metrics.queries_allowed.inc();
            }
        }

        blocked
    }

    /// Compile and publish a new pattern set. On compile error the previous
    /// matcher stays active. An empty list clears the matcher.
    pub fn set_patterns(&self, patterns: &[String]) -> Result<(), PatternError> {
        if patterns.is_empty() {
            self.patterns.store(None);
            debug!("block patterns cleared");
            return Ok(());
        }

        let matcher = PatternMatcher::new(patterns)?;
        let stats = matcher.stats();
        self.patterns.store(Some(Arc::new(matcher)));
        info!(
            exact = stats.exact,
            wildcard = stats.wildcard,
            regex = stats.regex,
            "block patterns updated"
        );
        Ok(())
    }

    /// Replace the HTTP client used for blocklist downloads.
    pub fn set_http_client(&self, client: reqwest::Client) {
        self.downloader.set_client(client);
    }

    /// Replace the blocklist configuration. Sources apply on the next
    /// update; a changed interval applies after restart.
    pub fn update_config(&self, config: BlocklistConfig) {
        self.config.store(Arc::new(config));
    }

    /// Number of domains in the active exact-match set.
    pub fn size(&self) -> usize {
        self.current.load().len()
    }

    pub fn stats(&self) -> BlocklistStats {
        let exact = self.current.load().len();
        let patterns = self
            .patterns
            .load()
            .as_ref()
            .map(|m| m.stats())
            .unwrap_or_default();

        BlocklistStats {
            exact,
            pattern_exact: patterns.exact,
            pattern_wildcard: patterns.wildcard,
            pattern_regex: patterns.regex,
            total: exact + patterns.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BlocklistManager {
        BlocklistManager::new(BlocklistConfig::default(), None)
    }

    #[test]
    fn test_block_action_parse_str() {
        assert_eq!(BlockAction::parse_str("nxdomain"), BlockAction::NxDomain);
        assert_eq!(BlockAction::parse_str("REFUSED"), BlockAction::Refused);
        assert_eq!(BlockAction::parse_str("drop"), BlockAction::Drop);
        assert_eq!(BlockAction::parse_str("bogus"), BlockAction::Drop);
    }

    #[test]
    fn test_empty_manager_blocks_nothing() {
        let manager = manager();
        assert!(!manager.is_blocked("ads.example.com."));
        assert_eq!(manager.size(), 0);
        assert_eq!(manager.stats(), BlocklistStats::default());
    }

    #[test]
    fn test_pattern_blocking() {
        let manager = manager();
        manager
            .set_patterns(&["*.ads.com.".to_string(), "tracker.example.com".to_string()])
            .expect("patterns compile");

        assert!(manager.is_blocked("x.ads.com."));
        assert!(manager.is_blocked("x.y.ads.com."));
        assert!(!manager.is_blocked("ads.com."));
        assert!(manager.is_blocked("tracker.example.com."));
        assert!(manager.is_blocked("TRACKER.EXAMPLE.COM")); // Case insensitive
        assert!(!manager.is_blocked("example.com."));
    }

    #[test]
    fn test_set_patterns_keeps_prior_on_error() {
        let manager = manager();
        manager
            .set_patterns(&["*.ads.com.".to_string()])
            .expect("patterns compile");

        let result = manager.set_patterns(&["/[broken/".to_string()]);
        assert!(matches!(
            result,
            Err(PatternError::InvalidPattern { index: 0, .. })
        ));

        // The previous matcher is still active
        assert!(manager.is_blocked("x.ads.com."));
    }

    #[test]
    fn test_set_patterns_empty_clears() {
        let manager = manager();
        manager
            .set_patterns(&["*.ads.com.".to_string()])
            .expect("patterns compile");
        assert!(manager.is_blocked("x.ads.com."));

        manager.set_patterns(&[]).expect("clearing never fails");
        assert!(!manager.is_blocked("x.ads.com."));
        assert_eq!(manager.stats().total, 0);
    }

    #[test]
    fn test_stats_combines_tiers() {
        let manager = manager();
        manager
            .set_patterns(&[
                "a.example.com".to_string(),
                "*.ads.com".to_string(),
                "/^x/".to_string(),
            ])
            .expect("patterns compile");

        let stats = manager.stats();
        assert_eq!(stats.exact, 0);
        assert_eq!(stats.pattern_exact, 1);
        assert_eq!(stats.pattern_wildcard, 1);
        assert_eq!(stats.pattern_regex, 1);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn test_update_with_no_sources_publishes_empty_set() {
        let manager = manager();
        let token = CancellationToken::new();

        manager.update(&token).await.expect("update succeeds");
        assert_eq!(manager.size(), 0);
    }

    #[tokio::test]
    async fn test_canceled_update_keeps_previous_dataset() {
        let manager = manager();
        manager
            .set_patterns(&["kept.example.com".to_string()])
            .expect("patterns compile");

        let token = CancellationToken::new();
        token.cancel();
        manager.update(&token).await.expect("update succeeds");

        // Nothing was published, patterns untouched
        assert!(manager.is_blocked("kept.example.com."));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let config = BlocklistConfig {
            auto_update: false,
            ..Default::default()
        };
        let manager = Arc::new(BlocklistManager::new(config, None));
        let token = CancellationToken::new();

        manager.clone().start(&token).await;
        manager.clone().start(&token).await; // Warns, returns
        manager.stop().await;
        manager.stop().await;

        // Restart after stop is permitted
        manager.clone().start(&token).await;
        manager.stop().await;
    }
}
