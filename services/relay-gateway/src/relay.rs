//! Relay forwarding
//!
//! One inbound request runs through: authenticate → rate check → quota check
//! → acquire account → upstream call with failover. Every terminal outcome
//! after authentication writes exactly one usage record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use rate_limiter::{RateDecision, RateLimiter};
use relay_store::Store;
use token_pool::{SelectedAccount, TokenPool, UpstreamOutcome, classify_status};
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{self, AuthContext, AuthFailure};
use crate::error::RelayError;
use crate::service::ServiceMetrics;
use crate::usage::UsageRecorder;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip from upstream responses (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the relay handler via axum State extractor
#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<Store>,
    pub pool: Arc<TokenPool>,
    pub limiter: Arc<RateLimiter>,
    pub usage: UsageRecorder,
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub api_version: String,
    pub path_prefix: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub metrics: ServiceMetrics,
}

impl RelayState {
    /// Upstream URL for a path already stripped of the relay prefix.
    pub fn upstream_url_for(&self, rest: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}{}{}",
            self.upstream_url.trim_end_matches('/'),
            self.api_version.trim_end_matches('/'),
            rest
        );
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

/// Strip the relay prefix from `path` on a segment boundary.
///
/// Paths with `.` or `..` segments (plain or percent-encoded) are refused:
/// the upstream URL parser would resolve them and step outside the
/// configured API version.
pub fn strip_relay_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix.trim_end_matches('/'))?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    if rest.split('/').any(is_dot_segment) {
        return None;
    }
    Some(rest)
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Rate-limit headers attached to every outcome after the rate check.
fn apply_rate_headers(headers: &mut HeaderMap, limit: u32, decision: &RateDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    if !decision.allowed {
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
    }
}

fn apply_response_time(headers: &mut HeaderMap, started: Instant) {
    let value = format!("{}ms", started.elapsed().as_millis());
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert("x-response-time", v);
    }
}

/// Upstream response copied for the caller, minus hop-by-hop headers.
fn passthrough(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    for (name, value) in upstream_headers {
        if !is_hop_by_hop(name.as_str()) {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    response
}

/// One fully-read upstream answer.
struct UpstreamReply {
    status: StatusCode,
    headers: HeaderMap,
    body: axum::body::Bytes,
}

/// Relay one inbound request and record request metrics for it.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn relay_request(
    state: &RelayState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = state.metrics.begin_request();
    let method = request.method().to_string();

    let response = relay(state, request, &request_id, started).await;

    let status = response.status();
    if status.is_server_error() {
        state.metrics.record_error();
    }
    crate::metrics::record_request(status.as_u16(), &method, started.elapsed().as_secs_f64());
    response
}

async fn relay(
    state: &RelayState,
    request: axum::http::Request<Body>,
    request_id: &str,
    started: Instant,
) -> Response {
    let (parts, body) = request.into_parts();
    let endpoint = parts.uri.path().to_string();

    let Some(rest) = strip_relay_prefix(&endpoint, &state.path_prefix) else {
        debug!("path outside relay prefix");
        return RelayError::NotFound(endpoint.clone()).into_response_with_id(request_id);
    };
    let upstream_url = state.upstream_url_for(rest, parts.uri.query());

    // 1. Authenticate
    let auth_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (ctx, quota_blocked) = match auth::authenticate(&state.store, auth_header).await {
        Ok(ctx) => (ctx, false),
        Err(AuthFailure::QuotaExhausted(ctx)) => (ctx, true),
        Err(reason) => {
            info!(?reason, "authentication failed");
            return RelayError::Authentication.into_response_with_id(request_id);
        }
    };

    // 2. Rate check
    let decision = state.limiter.check(&ctx.credential_id, ctx.rate_limit);
    if !decision.allowed {
        info!(
            credential_id = ctx.credential_id,
            limit = ctx.rate_limit,
            reset_ms = decision.reset_ms,
            "rate limited"
        );
        crate::metrics::record_rate_limited();
        state
            .usage
            .record(&ctx, &endpoint, 429, None, started)
            .await;
        return reject(
            RelayError::RateLimited {
                retry_after_secs: decision.retry_after_secs(),
            },
            request_id,
            &ctx,
            &decision,
        );
    }

    // 3. Quota check
    if quota_blocked {
        info!(
            credential_id = ctx.credential_id,
            usage_count = ctx.usage_count,
            "usage quota exhausted"
        );
        state
            .usage
            .record(&ctx, &endpoint, 403, None, started)
            .await;
        return reject(RelayError::QuotaExceeded, request_id, &ctx, &decision);
    }

    let content_type = parts.headers.get(header::CONTENT_TYPE).cloned();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            state
                .usage
                .record(&ctx, &endpoint, 400, None, started)
                .await;
            return reject(
                RelayError::InvalidRequest(format!("invalid request body: {e}")),
                request_id,
                &ctx,
                &decision,
            );
        }
    };

    // 4. Acquire an upstream account
    let first = match state.pool.acquire().await {
        Ok(account) => account,
        Err(e) => {
            error!(error = %e, "no upstream account available");
            state
                .usage
                .record(&ctx, &endpoint, 503, None, started)
                .await;
            return reject(RelayError::NoTokensAvailable, request_id, &ctx, &decision);
        }
    };

    // 5. Forward with failover
    let mut account: Option<SelectedAccount> = Some(first);
    let mut last_status: Option<u16> = None;
    let mut last_error = String::from("no upstream attempt completed");
    let mut attempts = 0u32;

    for attempt in 1..=state.max_retries {
        let Some(current) = account.take() else {
            break;
        };
        attempts = attempt;

        let mut req = state
            .client
            .request(parts.method.clone(), &upstream_url)
            .bearer_auth(current.token.expose())
            .timeout(state.timeout);
        if let Some(ct) = &content_type {
            req = req.header(header::CONTENT_TYPE, ct.clone());
        }
        if parts.method != Method::GET && !body.is_empty() {
            req = req.body(body.clone());
        }

        let reply = match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let headers = resp.headers().clone();
                resp.bytes().await.map(|body| UpstreamReply {
                    status,
                    headers,
                    body,
                })
            }
            Err(e) => Err(e),
        };

        match reply {
            Ok(reply) => {
                let status = reply.status.as_u16();
                match classify_status(status) {
                    UpstreamOutcome::Success => {
                        if let Err(e) = state.pool.report_success(&current.id).await {
                            warn!(account_id = current.id, error = %e, "failed to report success");
                        }
                        state.usage.increment_usage(&ctx).await;
                        state
                            .usage
                            .record(&ctx, &endpoint, status, Some(&current.id), started)
                            .await;
                        info!(account_id = current.id, attempt, status, "relay succeeded");
                        return forward(reply, &ctx, &decision, started);
                    }
                    UpstreamOutcome::ClientError => {
                        state
                            .usage
                            .record(&ctx, &endpoint, status, Some(&current.id), started)
                            .await;
                        info!(account_id = current.id, attempt, status, "upstream rejected request");
                        return forward(reply, &ctx, &decision, started);
                    }
                    UpstreamOutcome::Retryable => {
                        warn!(account_id = current.id, attempt, status, "upstream error, failing over");
                        crate::metrics::record_upstream_error("status");
                        last_status = Some(status);
                        last_error = format!("Upstream returned {status}");
                    }
                }
            }
            Err(e) => {
                let error_type = if e.is_timeout() { "timeout" } else { "connection" };
                warn!(account_id = current.id, attempt, error = %e, error_type, "upstream request failed, failing over");
                crate::metrics::record_upstream_error(error_type);
                last_error = e.to_string();
            }
        }

        if let Err(e) = state.pool.report_failure(&current.id).await {
            warn!(account_id = current.id, error = %e, "failed to report failure");
        }
        account = state.pool.acquire_alternative(&current.id).await;
    }

    // 6. Retries exhausted
    let final_status = last_status.unwrap_or(500);
    error!(attempts, final_status, last_error, "upstream failed on every attempt");
    state
        .usage
        .record(&ctx, &endpoint, final_status, None, started)
        .await;
    reject(
        RelayError::UpstreamFailure {
            attempts,
            message: last_error,
        },
        request_id,
        &ctx,
        &decision,
    )
}

fn reject(
    err: RelayError,
    request_id: &str,
    ctx: &AuthContext,
    decision: &RateDecision,
) -> Response {
    let mut response = err.into_response_with_id(request_id);
    apply_rate_headers(response.headers_mut(), ctx.rate_limit, decision);
    response
}

fn forward(
    reply: UpstreamReply,
    ctx: &AuthContext,
    decision: &RateDecision,
    started: Instant,
) -> Response {
    let mut response = passthrough(reply.status, &reply.headers, Body::from(reply.body));
    apply_rate_headers(response.headers_mut(), ctx.rate_limit, decision);
    apply_response_time(response.headers_mut(), started);
    response
}
