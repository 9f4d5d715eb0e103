//! Readiness probing and metrics scraping against a local axum server

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use placement_bench::common::BenchError;
use placement_bench::config::CounterConfig;
use placement_bench::extract::scrape_counters;
use placement_bench::host::{HttpFetcher, ReqwestFetcher};
use placement_bench::supervisor::{HttpProbe, ReadinessProbe};

const SCRAPE: &str = "\
# HELP bench_processed_total Units processed
# TYPE bench_processed_total counter
bench_processed_total{stage=\"import\"} 1500
bench_processed_total{stage=\"exec\"} 500
bench_pause_seconds_total 0.25
";

/// Serve `/health` (503 until `ready` is set) and `/metrics`
async fn serve(ready: Arc<AtomicBool>) -> String {
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::SeqCst) {
                        (StatusCode::OK, "ok")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "starting")
                    }
                }
            }),
        )
        .route("/metrics", get(|| async { SCRAPE }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn fetcher() -> Arc<dyn HttpFetcher> {
    Arc::new(ReqwestFetcher::new(Duration::from_secs(2)).unwrap())
}

#[tokio::test]
async fn test_probe_follows_health_endpoint() {
    let ready = Arc::new(AtomicBool::new(false));
    let base = serve(ready.clone()).await;
    let probe = HttpProbe::new(fetcher(), format!("{}/health", base));

    assert!(!probe.check().await);
    ready.store(true, Ordering::SeqCst);
    assert!(probe.check().await);
}

#[tokio::test]
async fn test_fetcher_reports_status_and_body() {
    let base = serve(Arc::new(AtomicBool::new(false))).await;
    let http = fetcher();

    let health = http.get(&format!("{}/health", base)).await.unwrap();
    assert_eq!(health.status, 503);
    assert!(!health.is_success());

    let missing = http.get(&format!("{}/nope", base)).await.unwrap();
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn test_live_scrape_counters() {
    let base = serve(Arc::new(AtomicBool::new(true))).await;
    let response = fetcher().get(&format!("{}/metrics", base)).await.unwrap();
    assert!(response.is_success());

    let counters = scrape_counters(&response.body, &CounterConfig::default());
    assert_eq!(counters.processed, Some(2000.0));
    assert_eq!(counters.pause_secs, Some(0.25));
    assert_eq!(counters.stall_count, None);
}

#[tokio::test]
async fn test_closed_port_is_an_http_error_and_not_ready() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("http://{}/health", addr);

    let err = fetcher().get(&url).await.unwrap_err();
    assert!(matches!(err, BenchError::Http(_)));
    assert!(!HttpProbe::new(fetcher(), url).check().await);
}
