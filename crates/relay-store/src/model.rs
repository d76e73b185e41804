//! Persistent record types
//!
//! Timestamps are unix milliseconds (absolute), matching what the relay
//! measures with `now_millis()`.

use serde::{Deserialize, Serialize};

/// Maximum live credentials a single user may hold.
pub const MAX_CREDENTIALS_PER_USER: usize = 10;

/// Rate limit applied when the creator does not choose one.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// Usage quota applied when the creator does not choose one.
pub const DEFAULT_USAGE_QUOTA: u64 = 1000;

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A caller-facing API key.
///
/// `usage_quota` of `None` means unlimited. For a finite quota the relay
/// keeps `usage_count <= usage_quota`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    /// The bearer secret presented by callers
    pub key: String,
    pub name: String,
    pub is_active: bool,
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub usage_quota: Option<u64>,
    pub usage_count: u64,
    pub created_at: u64,
}

impl Credential {
    /// Whether the usage count has reached a finite quota.
    pub fn quota_exhausted(&self) -> bool {
        matches!(self.usage_quota, Some(quota) if self.usage_count >= quota)
    }
}

/// Input for creating a credential.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub user_id: String,
    pub name: String,
    pub rate_limit_per_minute: u32,
    pub usage_quota: Option<u64>,
}

/// Owner-editable fields of a credential. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialUpdate {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

/// Upstream account status.
///
/// `Error` is the automatic quarantine state; `Disabled` is set by an
/// administrator. Only `Active` accounts are selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

impl AccountStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
            AccountStatus::Error => "error",
        }
    }
}

/// An upstream account ("token") in the rotation pool.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAccount {
    pub id: String,
    /// Bearer secret sent to the upstream service
    pub token: String,
    #[serde(default)]
    pub label: Option<String>,
    pub status: AccountStatus,
    pub fail_count: u32,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    pub created_at: u64,
}

impl std::fmt::Debug for UpstreamAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamAccount")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("label", &self.label)
            .field("status", &self.status)
            .field("fail_count", &self.fail_count)
            .field("last_used_at", &self.last_used_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// One accounting record per terminal relay outcome. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub credential_id: String,
    pub endpoint: String,
    pub status_code: u16,
    /// Absent when no upstream account completed the request
    pub upstream_account_id: Option<String>,
    pub response_time_ms: u64,
    pub created_at: u64,
}
