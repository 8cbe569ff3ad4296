use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vordr::blocking::{
    BlocklistConfig, BlocklistDownloader, BlocklistManager, DEFAULT_DOWNLOAD_TIMEOUT,
};
use vordr::metrics::FilterMetrics;

/// Serve a router on an ephemeral local port and return its address.
async fn serve(app: Router) -> SocketAddr {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fixtures");
    });
    addr
}

const HOSTS_FIXTURE: &str = "# comment\n\
0.0.0.0 ads.example.com\n\
0.0.0.0 tracker.example.com\n\
127.0.0.1 localhost\n\
0.0.0.0 malware.example.com\n";

const MIXED_FIXTURE: &str = "0.0.0.0 ads1.example.com\n\
||ads2.example.com^\n\
ads3.example.com\n\
127.0.0.1 ads4.example.com\n";

#[tokio::test]
async fn test_hosts_format_download() {
    let addr = serve(Router::new().route("/hosts.txt", get(|| async { HOSTS_FIXTURE }))).await;

    let downloader = BlocklistDownloader::new(DEFAULT_DOWNLOAD_TIMEOUT);
    let token = CancellationToken::new();
    let domains = downloader
        .download(&token, &format!("http://{}/hosts.txt", addr))
        .await
        .expect("download succeeds");

    assert_eq!(domains.len(), 3);
    assert!(domains.contains("ads.example.com."));
    assert!(domains.contains("tracker.example.com."));
    assert!(domains.contains("malware.example.com."));
    assert!(!domains.contains("localhost."));
}

#[tokio::test]
async fn test_mixed_formats_merged() {
    let addr = serve(Router::new().route("/mixed.txt", get(|| async { MIXED_FIXTURE }))).await;

    let downloader = BlocklistDownloader::new(DEFAULT_DOWNLOAD_TIMEOUT);
    let token = CancellationToken::new();
    let merged = downloader
        .download_all(&token, &[format!("http://{}/mixed.txt", addr)])
        .await;

    assert_eq!(merged.len(), 4);
    for domain in [
        "ads1.example.com.",
        "ads2.example.com.",
        "ads3.example.com.",
        "ads4.example.com.",
    ] {
        assert!(merged.contains(domain), "missing {}", domain);
    }
}

#[tokio::test]
async fn test_partial_failure_keeps_successful_sources() {
    let app = Router::new()
        .route("/good.txt", get(|| async { "0.0.0.0 a.example.com\n" }))
        .route(
            "/bad.txt",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
    let addr = serve(app).await;

    let downloader = BlocklistDownloader::new(DEFAULT_DOWNLOAD_TIMEOUT);
    let token = CancellationToken::new();
    let merged = downloader
        .download_all(
            &token,
            &[
                format!("http://{}/good.txt", addr),
                format!("http://{}/bad.txt", addr),
            ],
        )
        .await;

    assert_eq!(merged.len(), 1);
    assert!(merged.contains("a.example.com."));
}

#[tokio::test]
async fn test_download_surfaces_unexpected_status() {
    let addr = serve(Router::new().route("/gone.txt", get(|| async { StatusCode::NOT_FOUND }))).await;

    let downloader = BlocklistDownloader::new(DEFAULT_DOWNLOAD_TIMEOUT);
    let token = CancellationToken::new();
    let result = downloader
        .download(&token, &format!("http://{}/gone.txt", addr))
        .await;

    match result {
        Err(vordr::error::DownloadError::UnexpectedStatus(status)) => assert_eq!(status, 404),
        other => panic!("expected UnexpectedStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn test_manager_start_runs_initial_update() {
    let addr = serve(Router::new().route("/hosts.txt", get(|| async { HOSTS_FIXTURE }))).await;

    let config = BlocklistConfig {
        sources: vec![format!("http://{}/hosts.txt", addr)],
        auto_update: false,
        ..Default::default()
    };
    let manager = Arc::new(BlocklistManager::new(config, None));
    let token = CancellationToken::new();

    manager.clone().start(&token).await;

    assert_eq!(manager.size(), 3);
    assert!(manager.is_blocked("ads.example.com."));
    assert!(manager.is_blocked("ADS.EXAMPLE.COM")); // Normalized on lookup
    assert!(!manager.is_blocked("example.com."));
    assert!(!manager.is_blocked("localhost."));

    manager.stop().await;
}

#[tokio::test]
async fn test_update_replaces_dataset_atomically() {
    let app = Router::new()
        .route("/first.txt", get(|| async { "0.0.0.0 old.example.com\n" }))
        .route(
            "/second.txt",
            get(|| async { "0.0.0.0 new1.example.com\n0.0.0.0 new2.example.com\n" }),
        );
    let addr = serve(app).await;

    let metrics = Arc::new(FilterMetrics::new().expect("metrics register"));
    let config = BlocklistConfig {
        sources: vec![format!("http://{}/first.txt", addr)],
        auto_update: false,
        ..Default::default()
    };
    let manager = BlocklistManager::new(config.clone(), Some(metrics.clone()));
    let token = CancellationToken::new();

    manager.update(&token).await.expect("first update");
    assert!(manager.is_blocked("old.example.com."));
    assert_eq!(metrics.blocked_domains_total.get(), 1);

    // Point at the second source; the next update swaps wholesale
    manager.update_config(BlocklistConfig {
        sources: vec![format!("http://{}/second.txt", addr)],
        ..config
    });
    manager.update(&token).await.expect("second update");

    assert!(!manager.is_blocked("old.example.com."));
    assert!(manager.is_blocked("new1.example.com."));
    assert!(manager.is_blocked("new2.example.com."));
    assert_eq!(manager.size(), 2);
    assert_eq!(metrics.blocked_domains_total.get(), 2);
}

#[tokio::test]
async fn test_injected_http_client_is_used() {
    let addr = serve(Router::new().route("/hosts.txt", get(|| async { HOSTS_FIXTURE }))).await;

    let config = BlocklistConfig {
        sources: vec![format!("http://{}/hosts.txt", addr)],
        auto_update: false,
        ..Default::default()
    };
    let manager = BlocklistManager::new(config, None);
    manager.set_http_client(
        reqwest::Client::builder()
            .user_agent("host-resolver")
            .build()
            .expect("client builds"),
    );

    let token = CancellationToken::new();
    manager.update(&token).await.expect("update succeeds");
    assert_eq!(manager.size(), 3);
}

#[tokio::test]
async fn test_patterns_and_exact_set_combine() {
    let addr = serve(Router::new().route("/hosts.txt", get(|| async { HOSTS_FIXTURE }))).await;

    let config = BlocklistConfig {
        sources: vec![format!("http://{}/hosts.txt", addr)],
        auto_update: false,
        ..Default::default()
    };
    let manager = BlocklistManager::new(config, None);
    let token = CancellationToken::new();
    manager.update(&token).await.expect("update succeeds");

    manager
        .set_patterns(&["*.ads.com.".to_string()])
        .expect("patterns compile");

    // Exact tier
    assert!(manager.is_blocked("ads.example.com."));
    // Pattern tier
    assert!(manager.is_blocked("x.ads.com."));
    assert!(manager.is_blocked("x.y.ads.com."));
    assert!(!manager.is_blocked("ads.com."));

    let stats = manager.stats();
    assert_eq!(stats.exact, 3);
    assert_eq!(stats.pattern_wildcard, 1);
    assert_eq!(stats.total, 4);
}
