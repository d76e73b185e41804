//! Admin API for upstream accounts, API keys and usage
//!
//! Runs on a separate listener and is only started when `admin.listen_addr`
//! is configured. When an admin token is configured every request must carry
//! it as a bearer token.
//!
//! Endpoints:
//! - GET    /admin/tokens              list upstream accounts (no secrets)
//! - POST   /admin/tokens              add one account or a batch
//! - POST   /admin/tokens/{id}/reset   clear failures, lift quarantine
//! - POST   /admin/tokens/{id}/toggle  active ↔ disabled
//! - PATCH  /admin/tokens/{id}         relabel an account
//! - DELETE /admin/tokens/{id}         remove an account
//! - GET    /admin/pool                pool health summary
//! - GET    /admin/keys?user_id=       list a user's API keys (masked)
//! - POST   /admin/keys                create an API key
//! - PATCH  /admin/keys/{id}           rename / toggle active
//! - DELETE /admin/keys/{id}           delete an API key
//! - GET    /admin/usage?user_id=      paginated usage records

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use common::Secret;
use relay_store::{
    Credential, CredentialUpdate, DEFAULT_RATE_LIMIT_PER_MINUTE, DEFAULT_USAGE_QUOTA,
    NewCredential, Store, mask_key,
};
use serde::Deserialize;
use token_pool::TokenPool;
use tracing::{info, warn};

/// Default page size for usage listings.
const DEFAULT_USAGE_PAGE: usize = 100;
/// Largest page size a caller may request.
const MAX_USAGE_PAGE: usize = 1000;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<TokenPool>,
    store: Arc<Store>,
    token: Option<Secret<String>>,
}

impl AdminState {
    pub fn new(pool: Arc<TokenPool>, store: Arc<Store>, token: Option<Secret<String>>) -> Self {
        Self { pool, store, token }
    }
}

/// Build the admin axum router with all management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens", get(list_tokens).post(add_tokens))
        .route("/admin/tokens/{id}", patch(update_token).delete(delete_token))
        .route("/admin/tokens/{id}/reset", post(reset_token))
        .route("/admin/tokens/{id}/toggle", post(toggle_token))
        .route("/admin/pool", get(pool_status))
        .route("/admin/keys", get(list_keys).post(create_key))
        .route("/admin/keys/{id}", patch(update_key).delete(delete_key))
        .route("/admin/usage", get(list_usage))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

fn store_error_response(err: relay_store::Error) -> Response {
    let status = match &err {
        relay_store::Error::NotFound(_) => StatusCode::NOT_FOUND,
        relay_store::Error::Invalid(_) | relay_store::Error::LimitReached(_) => {
            StatusCode::BAD_REQUEST
        }
        relay_store::Error::Io(_) | relay_store::Error::Parse(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err)
}

fn pool_error_response(err: token_pool::Error) -> Response {
    let status = match &err {
        token_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        token_pool::Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        token_pool::Error::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        token_pool::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

/// Reject requests without the configured admin bearer token.
async fn require_admin_token(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.token {
        let presented = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(crate::auth::extract_bearer);
        if !presented.is_some_and(|p| expected.matches(p)) {
            warn!(path = %request.uri().path(), "admin request rejected");
            return error_response(StatusCode::UNAUTHORIZED, "invalid admin token");
        }
    }
    next.run(request).await
}

// --- Upstream accounts ---

/// GET /admin/tokens — accounts with status and failure counters, never secrets.
async fn list_tokens(State(state): State<AdminState>) -> Response {
    let health = state.pool.health().await;
    let accounts = health
        .get("accounts")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts }))
}

#[derive(Deserialize)]
struct AddTokensRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    tokens: Option<Vec<String>>,
    #[serde(default)]
    label: Option<String>,
}

/// POST /admin/tokens — add a single account (`token`) or a batch (`tokens`).
async fn add_tokens(
    State(state): State<AdminState>,
    Json(body): Json<AddTokensRequest>,
) -> Response {
    let added = match (body.tokens, body.token) {
        (Some(tokens), _) => state.store.add_accounts(tokens, body.label).await,
        (None, Some(token)) => state
            .store
            .add_account(token, body.label)
            .await
            .map(|a| vec![a]),
        (None, None) => {
            return error_response(StatusCode::BAD_REQUEST, "expected `token` or `tokens`");
        }
    };

    match added {
        Ok(accounts) => {
            let ids: Vec<&str> = accounts.iter().map(|a| a.id.as_str()).collect();
            info!(count = ids.len(), "upstream accounts added");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "added": ids.len(), "ids": ids }),
            )
        }
        Err(e) => store_error_response(e),
    }
}

/// POST /admin/tokens/{id}/reset
async fn reset_token(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.pool.reset(&id).await {
        Ok(account) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "id": account.id,
                "status": account.status.label(),
                "fail_count": account.fail_count,
            }),
        ),
        Err(e) => pool_error_response(e),
    }
}

/// POST /admin/tokens/{id}/toggle
async fn toggle_token(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.pool.toggle(&id).await {
        Ok(account) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "id": account.id,
                "status": account.status.label(),
            }),
        ),
        Err(e) => pool_error_response(e),
    }
}

#[derive(Deserialize)]
struct UpdateTokenRequest {
    /// Blank or `null` clears the label.
    #[serde(default)]
    label: Option<String>,
}

/// PATCH /admin/tokens/{id}
async fn update_token(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTokenRequest>,
) -> Response {
    let label = body
        .label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    let updated = state
        .store
        .update_account(&id, |account| {
            account.label = label;
            serde_json::json!({
                "id": account.id,
                "label": account.label,
                "status": account.status.label(),
            })
        })
        .await;

    match updated {
        Ok(view) => {
            info!(account_id = id, "upstream account relabeled");
            json_response(StatusCode::OK, view)
        }
        Err(e) => store_error_response(e),
    }
}

/// DELETE /admin/tokens/{id}
async fn delete_token(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.store.delete_account(&id).await {
        Ok(true) => {
            info!(account_id = id, "upstream account removed");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "id": id, "status": "removed" }),
            )
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, format!("account {id} not found")),
        Err(e) => store_error_response(e),
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.pool.health().await)
}

// --- API keys ---

/// Key view for listings; the full key is only revealed on creation.
fn credential_view(credential: &Credential, reveal_key: bool) -> serde_json::Value {
    let key = if reveal_key {
        credential.key.clone()
    } else {
        mask_key(&credential.key)
    };
    serde_json::json!({
        "id": credential.id,
        "user_id": credential.user_id,
        "name": credential.name,
        "key": key,
        "is_active": credential.is_active,
        "rate_limit_per_minute": credential.rate_limit_per_minute,
        "usage_quota": credential.usage_quota.map_or(-1, |q| q as i64),
        "usage_count": credential.usage_count,
        "created_at": credential.created_at,
    })
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

/// GET /admin/keys?user_id=
async fn list_keys(State(state): State<AdminState>, Query(q): Query<UserQuery>) -> Response {
    let keys: Vec<serde_json::Value> = state
        .store
        .credentials_for_user(&q.user_id)
        .await
        .iter()
        .map(|c| credential_view(c, false))
        .collect();
    json_response(StatusCode::OK, serde_json::json!({ "keys": keys }))
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    user_id: String,
    name: String,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
    /// `-1` for unlimited
    #[serde(default)]
    usage_quota: Option<i64>,
}

/// Convert the admin quota input to the stored form.
fn parse_quota(input: Option<i64>) -> Result<Option<u64>, String> {
    match input {
        None => Ok(Some(DEFAULT_USAGE_QUOTA)),
        Some(-1) => Ok(None),
        Some(q) if q >= 0 => Ok(Some(q as u64)),
        Some(q) => Err(format!("usage_quota must be >= 0 or -1, got {q}")),
    }
}

/// POST /admin/keys — the response is the only place the full key appears.
async fn create_key(
    State(state): State<AdminState>,
    Json(body): Json<CreateKeyRequest>,
) -> Response {
    if body.user_id.trim().is_empty() || body.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id and name are required");
    }
    let rate_limit = body
        .rate_limit_per_minute
        .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE);
    if rate_limit == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "rate_limit_per_minute must be greater than 0",
        );
    }
    let usage_quota = match parse_quota(body.usage_quota) {
        Ok(q) => q,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let created = state
        .store
        .create_credential(NewCredential {
            user_id: body.user_id,
            name: body.name.trim().to_string(),
            rate_limit_per_minute: rate_limit,
            usage_quota,
        })
        .await;

    match created {
        Ok(credential) => {
            info!(credential_id = credential.id, user_id = credential.user_id, "API key created");
            json_response(StatusCode::CREATED, credential_view(&credential, true))
        }
        Err(e) => store_error_response(e),
    }
}

/// PATCH /admin/keys/{id}
async fn update_key(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(mut update): Json<CredentialUpdate>,
) -> Response {
    if let Some(name) = update.name.take() {
        let name = name.trim();
        if name.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "name must not be empty");
        }
        update.name = Some(name.to_string());
    }

    match state.store.update_credential(&id, update).await {
        Ok(credential) => json_response(StatusCode::OK, credential_view(&credential, false)),
        Err(e) => store_error_response(e),
    }
}

/// DELETE /admin/keys/{id}
async fn delete_key(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.store.delete_credential(&id).await {
        Ok(true) => {
            info!(credential_id = id, "API key deleted");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "id": id, "status": "deleted" }),
            )
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, format!("key {id} not found")),
        Err(e) => store_error_response(e),
    }
}

// --- Usage ---

#[derive(Deserialize)]
struct UsageQuery {
    user_id: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /admin/usage?user_id=&offset=&limit=
async fn list_usage(State(state): State<AdminState>, Query(q): Query<UsageQuery>) -> Response {
    let offset = q.offset.unwrap_or(0);
    let limit = q.limit.unwrap_or(DEFAULT_USAGE_PAGE).min(MAX_USAGE_PAGE);

    match state.store.usage_for_user(&q.user_id, offset, limit).await {
        Ok(records) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "records": records,
                "offset": offset,
                "limit": limit,
            }),
        ),
        Err(e) => store_error_response(e),
    }
}
