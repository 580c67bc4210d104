use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use ursync_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use uuid::Uuid;

async fn spawn_flaky_server(failures_before_success: usize) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/usuarios",
        get(move || {
            let counter = counter.clone();
            async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                if seen < failures_before_success {
                    (StatusCode::SERVICE_UNAVAILABLE, "busy".to_string())
                } else {
                    (StatusCode::OK, "[]".to_string())
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/usuarios"), hits)
}

fn fetcher(max_retries: usize) -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("ursync-test".into()),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    })
    .unwrap()
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let (url, hits) = spawn_flaky_server(2).await;
    let resp = fetcher(3).fetch_bytes(Uuid::new_v4(), &url).await.unwrap();

    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(resp.body, b"[]");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_retry_budget() {
    let (url, hits) = spawn_flaky_server(usize::MAX).await;
    let err = fetcher(1).fetch_bytes(Uuid::new_v4(), &url).await.unwrap_err();

    assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
