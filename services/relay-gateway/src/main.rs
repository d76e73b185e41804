//! Metered relay gateway
//!
//! Single-binary Rust service that:
//! 1. Authenticates callers by API key against usage quotas
//! 2. Applies a per-key sliding-window rate limit
//! 3. Forwards requests to a rotating pool of upstream accounts
//! 4. Fails over to the healthiest remaining account on upstream errors
//! 5. Records one usage record per terminal outcome

mod admin;
mod auth;
mod config;
mod error;
mod metrics;
mod relay;
mod service;
mod usage;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use rate_limiter::{RateLimiter, spawn_sweeper};
use relay_store::Store;
use token_pool::TokenPool;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::relay::RelayState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};
use crate::usage::UsageRecorder;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    prometheus: PrometheusHandle,
}

/// Build the main router: health, metrics, and the relay fallback.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(relay_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting relay-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.url,
        path_prefix = %config.relay.path_prefix,
        max_retries = config.relay.max_retries,
        admin_enabled = config.admin.listen_addr.is_some(),
        "configuration loaded"
    );

    let store = Arc::new(
        Store::open(&config.store.data_dir)
            .await
            .with_context(|| format!("failed to open datastore at {}", config.store.data_dir.display()))?,
    );
    let pool = Arc::new(TokenPool::new(
        store.clone(),
        config.pool.quarantine_threshold,
    ));
    let limiter = Arc::new(RateLimiter::new());
    let sweeper = spawn_sweeper(
        limiter.clone(),
        Duration::from_secs(config.rate_limit.sweep_interval_secs),
    );

    let metrics = ServiceMetrics::new();
    let relay_state = RelayState {
        store: store.clone(),
        pool: pool.clone(),
        limiter,
        usage: UsageRecorder::new(store.clone()),
        client: reqwest::Client::new(),
        upstream_url: config.upstream.url.clone(),
        api_version: config.upstream.api_version.clone(),
        path_prefix: config.relay.path_prefix.clone(),
        max_retries: config.relay.max_retries,
        timeout: Duration::from_secs(config.upstream.timeout_secs),
        metrics: metrics.clone(),
    };

    let app = build_router(
        AppState {
            relay: relay_state,
            prometheus: prometheus_handle,
        },
        config.server.max_connections,
    );

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    // Both listeners drain on the same signal
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let admin_handle = match config.admin.listen_addr {
        Some(admin_addr) => {
            if config.admin.token.is_none() {
                warn!("admin API enabled without an admin token");
            }
            let admin_app = build_admin_router(AdminState::new(
                pool.clone(),
                store.clone(),
                config.admin.token.clone(),
            ));
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
            info!(addr = %admin_addr, "admin API listening");
            let mut rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    })
                    .await
            }))
        }
        None => None,
    };

    info!(addr = %config.server.listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let mut rx = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = admin_handle {
        handle.abort();
    }
    sweeper.abort();

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary plus uptime and request counters.
/// Returns 200 when at least one upstream account is active, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.relay.pool.health().await;
    let active = body["accounts_active"].as_u64().unwrap_or(0);

    let service = &state.relay.metrics;
    body["uptime_seconds"] = serde_json::json!(service.started_at.elapsed().as_secs());
    body["requests_served"] = serde_json::json!(service.requests_total.load(Ordering::Relaxed));
    body["errors_total"] = serde_json::json!(service.errors_total.load(Ordering::Relaxed));

    let status_code = if active > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that relays every other request.
async fn relay_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    relay::relay_request(&state.relay, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use relay_store::{AccountStatus, NewCredential};
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Create a PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    /// Start a mock upstream that answers by the bearer token it receives:
    /// `fail*` → 500, `bad*` → 400, `slow*` → 200 after 2s, anything else →
    /// 200 echoing the request. Returns the base URL and the tokens seen.
    async fn start_mock_upstream() -> (String, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new().fallback(move |request: Request<Body>| {
            let calls = recorded.clone();
            async move {
                let authorization = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let token = authorization.trim_start_matches("Bearer ").to_string();
                calls.lock().unwrap().push(token.clone());

                if token.starts_with("fail") {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response();
                }
                if token.starts_with("bad") {
                    return (
                        StatusCode::BAD_REQUEST,
                        [("x-upstream-echo", "true")],
                        r#"{"error":"bad prompt"}"#,
                    )
                        .into_response();
                }
                if token.starts_with("slow") {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }

                let content_type = request
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let caller_header = request.headers().contains_key("x-caller-only");
                let method = request.method().to_string();
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or("").to_string();
                let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                    .await
                    .unwrap();
                (
                    StatusCode::OK,
                    [("x-upstream-echo", "true")],
                    axum::Json(serde_json::json!({
                        "authorization": authorization,
                        "content_type": content_type,
                        "caller_header_forwarded": caller_header,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": String::from_utf8_lossy(&body),
                    })),
                )
                    .into_response()
            }
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), calls)
    }

    struct TestGateway {
        app: Router,
        store: Arc<Store>,
        key: String,
        credential_id: String,
        dir: tempfile::TempDir,
    }

    async fn test_gateway(
        upstream_url: &str,
        tokens: &[&str],
        usage_quota: Option<u64>,
        rate_limit: u32,
    ) -> TestGateway {
        test_gateway_with_timeout(upstream_url, tokens, usage_quota, rate_limit, Duration::from_secs(5))
            .await
    }

    async fn test_gateway_with_timeout(
        upstream_url: &str,
        tokens: &[&str],
        usage_quota: Option<u64>,
        rate_limit: u32,
        timeout: Duration,
    ) -> TestGateway {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        store
            .add_accounts(tokens.iter().map(|t| t.to_string()).collect(), None)
            .await
            .unwrap();
        let credential = store
            .create_credential(NewCredential {
                user_id: "user-1".into(),
                name: "test".into(),
                rate_limit_per_minute: rate_limit,
                usage_quota,
            })
            .await
            .unwrap();

        let state = AppState {
            relay: RelayState {
                store: store.clone(),
                pool: Arc::new(TokenPool::new(store.clone(), 5)),
                limiter: Arc::new(RateLimiter::new()),
                usage: UsageRecorder::new(store.clone()),
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                api_version: "/v1".into(),
                path_prefix: "/v1".into(),
                max_retries: 3,
                timeout,
                metrics: ServiceMetrics::new(),
            },
            prometheus: test_prometheus_handle(),
        };

        TestGateway {
            app: build_router(state, 1000),
            store,
            key: credential.key,
            credential_id: credential.id,
            dir,
        }
    }

    impl TestGateway {
        fn request(&self, method: &str, uri: &str) -> axum::http::request::Builder {
            Request::builder()
                .method(method)
                .uri(uri)
                .header("authorization", format!("Bearer {}", self.key))
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
            (status, headers, json)
        }

        async fn post(&self, uri: &str) -> (StatusCode, HeaderMap, serde_json::Value) {
            let request = self
                .request("POST", uri)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"prompt":"a cat"}"#))
                .unwrap();
            self.send(request).await
        }

        async fn usage_count(&self) -> u64 {
            self.store
                .credential(&self.credential_id)
                .await
                .unwrap()
                .usage_count
        }

        async fn usage_records(&self) -> Vec<relay_store::UsageRecord> {
            self.store.usage_records().await.unwrap()
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_pool() {
        let gw = test_gateway("http://unused", &["ok-1"], None, 60).await;

        let (status, _, json) = gw
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["accounts_active"], 1);
        assert!(json["uptime_seconds"].is_u64());
        assert_eq!(json["requests_served"], 0);
    }

    #[tokio::test]
    async fn health_endpoint_unavailable_without_active_accounts() {
        let gw = test_gateway("http://unused", &[], None, 60).await;

        let (status, _, json) = gw
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let gw = test_gateway("http://unused", &[], None, 60).await;
        let response = gw
            .app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn relay_success_round_trip() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], Some(10), 60).await;

        let request = gw
            .request("POST", "/v1/images/generations?size=large")
            .header("content-type", "application/json")
            .header("x-caller-only", "dropped")
            .body(Body::from(r#"{"prompt":"a cat"}"#))
            .unwrap();
        let (status, headers, json) = gw.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["authorization"], "Bearer ok-1", "caller key must never reach upstream");
        assert_eq!(json["path"], "/v1/images/generations");
        assert_eq!(json["query"], "size=large");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["content_type"], "application/json");
        assert_eq!(json["body"], r#"{"prompt":"a cat"}"#);
        assert_eq!(json["caller_header_forwarded"], false);

        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(headers["x-ratelimit-remaining"], "59");
        assert!(headers["x-response-time"].to_str().unwrap().ends_with("ms"));
        assert_eq!(headers["x-upstream-echo"], "true");

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(gw.usage_count().await, 1);

        let records = gw.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 200);
        assert_eq!(records[0].endpoint, "/v1/images/generations");
        assert_eq!(records[0].user_id, "user-1");
        let accounts = gw.store.accounts().await;
        let account = &accounts[0];
        assert_eq!(records[0].upstream_account_id.as_deref(), Some(account.id.as_str()));
        assert!(account.last_used_at.is_some());
    }

    #[tokio::test]
    async fn get_requests_forward_no_body() {
        let (upstream_url, _calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        let request = gw.request("GET", "/v1/models").body(Body::empty()).unwrap();
        let (status, _, json) = gw.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["method"], "GET");
        assert_eq!(json["body"], "");
    }

    #[tokio::test]
    async fn missing_or_unknown_key_is_401_without_usage_record() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        let (status, _, json) = gw
            .send(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["type"], "authentication_error");
        assert_eq!(json["error"]["code"], "invalid_api_key");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));

        let (status, _, _) = gw
            .send(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", "Bearer rk_unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert!(calls.lock().unwrap().is_empty());
        assert!(gw.usage_records().await.is_empty());
    }

    #[tokio::test]
    async fn zero_quota_is_403_before_any_upstream_call() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1", "ok-2"], Some(0), 60).await;

        let (status, headers, json) = gw.post("/v1/images/generations").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["type"], "quota_error");
        assert_eq!(json["error"]["code"], "quota_exceeded");
        assert!(headers.contains_key("x-ratelimit-limit"));

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(gw.store.rotation_index().await, 0, "no account acquired");
        assert_eq!(gw.usage_count().await, 0);

        let records = gw.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 403);
        assert!(records[0].upstream_account_id.is_none());
    }

    #[tokio::test]
    async fn quota_stops_admission_once_reached() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], Some(2), 60).await;

        assert_eq!(gw.post("/v1/x").await.0, StatusCode::OK);
        assert_eq!(gw.post("/v1/x").await.0, StatusCode::OK);
        assert_eq!(gw.post("/v1/x").await.0, StatusCode::FORBIDDEN);

        assert_eq!(gw.usage_count().await, 2);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failover_to_alternative_after_server_error() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["fail-a", "ok-b"], None, 60).await;

        let (status, _, json) = gw.post("/v1/images/generations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["authorization"], "Bearer ok-b");
        assert_eq!(*calls.lock().unwrap(), vec!["fail-a", "ok-b"]);

        let records = gw.usage_records().await;
        assert_eq!(records.len(), 1, "only the terminal outcome is recorded");
        assert_eq!(records[0].status_code, 200);

        let accounts = gw.store.accounts().await;
        assert_eq!(accounts[0].fail_count, 1);
        assert_eq!(accounts[1].fail_count, 0);
        assert_eq!(records[0].upstream_account_id.as_deref(), Some(accounts[1].id.as_str()));
    }

    #[tokio::test]
    async fn empty_pool_is_503_no_tokens_available() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &[], None, 60).await;

        let (status, _, json) = gw.post("/v1/images/generations").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "service_error");
        assert_eq!(json["error"]["code"], "no_tokens_available");

        assert!(calls.lock().unwrap().is_empty());
        let records = gw.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 503);
        assert!(records[0].upstream_account_id.is_none());
    }

    #[tokio::test]
    async fn all_attempts_failing_is_502() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["fail-a", "fail-b", "fail-c"], None, 60).await;

        let (status, _, json) = gw.post("/v1/images/generations").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["type"], "upstream_error");
        assert_eq!(json["error"]["code"], "upstream_failure");
        assert!(json["error"]["message"].as_str().unwrap().contains("500"));

        // a (rotation) → b (fewest failures, oldest) → c (fewest failures)
        assert_eq!(*calls.lock().unwrap(), vec!["fail-a", "fail-b", "fail-c"]);

        let records = gw.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 500);
        assert!(records[0].upstream_account_id.is_none());
        assert_eq!(gw.usage_count().await, 0);
    }

    #[tokio::test]
    async fn single_failing_account_stops_when_no_alternative() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["fail-a"], None, 60).await;

        let (status, _, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["error"]["message"].as_str().unwrap().contains("after 1 attempts"));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_failures_quarantine_account() {
        let (upstream_url, _calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["fail-a"], None, 60).await;

        for _ in 0..5 {
            assert_eq!(gw.post("/v1/x").await.0, StatusCode::BAD_GATEWAY);
        }
        let accounts = gw.store.accounts().await;
        let account = &accounts[0];
        assert_eq!(account.status, AccountStatus::Error);
        assert_eq!(account.fail_count, 5);

        let (status, _, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "no_tokens_available");
    }

    #[tokio::test]
    async fn client_error_passes_through_without_retry() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["bad-a", "ok-b"], None, 60).await;

        let (status, headers, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "bad prompt");
        assert_eq!(headers["x-upstream-echo"], "true");
        assert!(headers.contains_key("x-ratelimit-remaining"));
        assert_eq!(*calls.lock().unwrap(), vec!["bad-a"]);

        assert_eq!(gw.usage_count().await, 0, "only successes count against quota");
        assert_eq!(gw.store.accounts().await[0].fail_count, 0);
        let records = gw.usage_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 400);
        assert!(records[0].upstream_account_id.is_some());
    }

    #[tokio::test]
    async fn rate_limit_rejects_with_retry_after() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 2).await;

        assert_eq!(gw.post("/v1/x").await.0, StatusCode::OK);
        let (status, headers, _) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-ratelimit-remaining"], "0");

        let (status, headers, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["code"], "rate_limit_exceeded");
        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry_after));

        assert_eq!(calls.lock().unwrap().len(), 2);
        let records = gw.usage_records().await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].status_code, 429);
        assert!(records[2].upstream_account_id.is_none());
    }

    #[tokio::test]
    async fn upstream_timeout_is_retryable_failure() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway_with_timeout(
            &upstream_url,
            &["slow-a", "ok-b"],
            None,
            60,
            Duration::from_millis(200),
        )
        .await;

        let (status, _, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["authorization"], "Bearer ok-b");
        assert_eq!(*calls.lock().unwrap(), vec!["slow-a", "ok-b"]);
        assert_eq!(gw.store.accounts().await[0].fail_count, 1);
    }

    #[tokio::test]
    async fn dead_upstream_is_502() {
        let gw = test_gateway("http://127.0.0.1:1", &["ok-1"], None, 60).await;

        let (status, _, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["code"], "upstream_failure");

        // Transport failures record the 500 fallback status
        let records = gw.usage_records().await;
        assert_eq!(records[0].status_code, 500);
    }

    #[tokio::test]
    async fn path_outside_prefix_is_404() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        let (status, _, json) = gw.post("/other/path").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
        assert!(calls.lock().unwrap().is_empty());
        assert!(gw.usage_records().await.is_empty());
    }

    #[tokio::test]
    async fn dot_segments_cannot_escape_api_version() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        for path in [
            "/v1/../internal/admin",
            "/v1/%2e%2e/internal/admin",
            "/v1/%2E%2E/internal/admin",
            "/v1/images/./../../internal",
        ] {
            let (status, _, json) = gw.post(path).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "path {path}");
            assert_eq!(json["error"]["code"], "not_found", "path {path}");
        }

        assert!(calls.lock().unwrap().is_empty());
        assert!(gw.usage_records().await.is_empty());
        assert_eq!(gw.store.rotation_index().await, 0);
    }

    #[tokio::test]
    async fn usage_log_failure_does_not_reach_caller() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        // A directory where the usage log should be makes every append fail
        std::fs::create_dir(gw.dir.path().join("usage.jsonl")).unwrap();

        let (status, headers, json) = gw.post("/v1/x").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["authorization"], "Bearer ok-1");
        assert!(headers.contains_key("x-ratelimit-remaining"));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(gw.usage_count().await, 1);

        let rendered = handle.render();
        assert!(
            rendered.contains("relay_usage_write_failures_total{kind=\"record\"} 1"),
            "{rendered}"
        );
    }

    #[tokio::test]
    async fn oversized_body_is_400() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        let oversized = vec![b'x'; relay::MAX_BODY_BYTES + 1];
        let request = gw
            .request("POST", "/v1/upload")
            .body(Body::from(oversized))
            .unwrap();
        let (status, _, json) = gw.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(gw.usage_records().await[0].status_code, 400);
    }

    #[tokio::test]
    async fn rotation_alternates_between_accounts() {
        let (upstream_url, calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-a", "ok-b"], None, 60).await;

        for _ in 0..4 {
            assert_eq!(gw.post("/v1/x").await.0, StatusCode::OK);
        }
        assert_eq!(*calls.lock().unwrap(), vec!["ok-a", "ok-b", "ok-a", "ok-b"]);
    }

    #[tokio::test]
    async fn relay_records_prometheus_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let (upstream_url, _calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["fail-a", "ok-b"], None, 60).await;

        assert_eq!(gw.post("/v1/x").await.0, StatusCode::OK);

        let rendered = handle.render();
        assert!(rendered.contains("relay_requests_total"), "{rendered}");
        assert!(rendered.contains("relay_request_duration_seconds"), "{rendered}");
        assert!(rendered.contains("relay_upstream_errors_total"), "{rendered}");
        assert!(rendered.contains("error_type=\"status\""), "{rendered}");
    }

    #[tokio::test]
    async fn requests_served_counter_increments() {
        let (upstream_url, _calls) = start_mock_upstream().await;
        let gw = test_gateway(&upstream_url, &["ok-1"], None, 60).await;

        gw.post("/v1/x").await;
        gw.post("/v1/x").await;

        let (_, _, json) = gw
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(json["requests_served"], 2);
    }
}
