/// HTTP blocklist fetching and merging
use crate::blocking::parser;
use crate::error::DownloadError;
use arc_swap::ArcSwap;
use futures::future::join_all;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-source request timeout applied when none is configured.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches blocklist sources over HTTP and parses them into domain sets.
///
/// The HTTP client is swappable at runtime so the host can inject a client
/// that resolves through its own recursion path.
pub struct BlocklistDownloader {
    client: ArcSwap<reqwest::Client>,
    timeout: Duration,
}

impl BlocklistDownloader {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("vordr")
            .build()
            .unwrap_or_default();

        Self {
            client: ArcSwap::from_pointee(client),
            timeout,
        }
    }

    /// Replace the HTTP client used for subsequent downloads.
    pub fn set_client(&self, client: reqwest::Client) {
        self.client.store(Arc::new(client));
    }

    fn http(&self) -> reqwest::Client {
        self.client.load().as_ref().clone()
    }

    /// Fetch one source and parse it into a set of canonical domains.
    ///
    /// The request is bounded by the per-source timeout and aborts early when
    /// the token fires. Non-2xx statuses are errors; response bytes are
    /// decoded as UTF-8 with invalid sequences replaced.
    pub async fn download(
        &self,
        token: &CancellationToken,
        url: &str,
    ) -> Result<FxHashSet<String>, DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Canceled);
        }

        let request = self.http().get(url).timeout(self.timeout).send();
        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Canceled),
            response = request => {
                response.map_err(|e| DownloadError::Transport(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::UnexpectedStatus(status.as_u16()));
        }

        let body = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Canceled),
            body = response.text() => {
                body.map_err(|e| DownloadError::Transport(e.to_string()))?
            }
        };

        let mut domains = FxHashSet::default();
        for line in body.lines() {
            if let Some(domain) = parser::extract_domain(line) {
                domains.insert(domain);
            }
        }

        debug!(url, domains = domains.len(), "parsed blocklist source");
        Ok(domains)
    }

    /// Fetch all sources concurrently and merge them into one set.
    ///
    /// Per-source failures are logged and skipped; the merge itself cannot
    /// fail. An empty source list yields an empty set.
    pub async fn download_all(
        &self,
        token: &CancellationToken,
        urls: &[String],
    ) -> FxHashSet<String> {
        if urls.is_empty() {
            return FxHashSet::default();
        }

        let fetches = urls
            .iter()
            .map(|url| async move { (url.as_str(), self.download(token, url).await) });

        let mut merged = FxHashSet::default();
        for (url, result) in join_all(fetches).await {
            match result {
                Ok(domains) => {
                    info!(url, domains = domains.len(), "fetched blocklist source");
                    merged.extend(domains);
                }
                Err(DownloadError::Canceled) => {
                    debug!(url, "blocklist fetch canceled");
                }
                Err(e) => {
                    warn!(url, error = %e, "failed to fetch blocklist source");
                }
            }
        }

        merged
    }
}
