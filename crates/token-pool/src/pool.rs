//! Round-robin selection, failover and quarantine
//!
//! Status transitions:
//! - active → error (failure counter reaches the quarantine threshold)
//! - error → active (admin reset, clears the counter)
//! - active ↔ disabled (admin toggle)
//!
//! Successes never decay the failure counter; only `reset()` clears it.

use std::sync::Arc;

use common::Secret;
use relay_store::{AccountStatus, Store, UpstreamAccount, now_millis};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Consecutive failures after which an account is quarantined.
pub const DEFAULT_QUARANTINE_THRESHOLD: u32 = 5;

/// An account chosen for one relay attempt.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub id: String,
    pub token: Secret<String>,
}

impl From<&UpstreamAccount> for SelectedAccount {
    fn from(account: &UpstreamAccount) -> Self {
        Self {
            id: account.id.clone(),
            token: Secret::new(account.token.clone()),
        }
    }
}

/// Upstream account pool backed by the datastore.
pub struct TokenPool {
    store: Arc<Store>,
    quarantine_threshold: u32,
}

impl TokenPool {
    pub fn new(store: Arc<Store>, quarantine_threshold: u32) -> Self {
        info!(quarantine_threshold, "token pool initialized");
        Self {
            store,
            quarantine_threshold,
        }
    }

    /// The datastore this pool reads and writes.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Select the next active account round-robin.
    ///
    /// Serves the account at `pointer % pool_size` and persists
    /// `(pointer + 1) % pool_size`. Listing the pool and advancing the pointer
    /// are separate store calls, so concurrent acquisitions against a pool
    /// that changes size in between may repeat or skip an index. Rotation is
    /// best-effort fairness, not a guarantee.
    ///
    /// Returns `PoolExhausted` when no account is active.
    pub async fn acquire(&self) -> Result<SelectedAccount> {
        let accounts = self.store.active_accounts().await;
        let pool_size = accounts.len();
        if pool_size == 0 {
            return Err(Error::PoolExhausted(self.exhausted_message().await));
        }

        let pointer = match self.store.advance_rotation(pool_size).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to persist rotation pointer, serving first account");
                0
            }
        };

        let account = &accounts[pointer % pool_size];
        debug!(account_id = account.id, pointer, pool_size, "account acquired");
        Ok(SelectedAccount::from(account))
    }

    /// Select the active account with the fewest failures, excluding `exclude_id`.
    ///
    /// Ties go to the oldest account. Returns `None` when nothing else is active.
    pub async fn acquire_alternative(&self, exclude_id: &str) -> Option<SelectedAccount> {
        let accounts = self.store.active_accounts().await;
        let selected = accounts
            .iter()
            .filter(|a| a.id != exclude_id)
            .min_by_key(|a| a.fail_count)
            .map(SelectedAccount::from);
        match &selected {
            Some(s) => debug!(account_id = s.id, excluded = exclude_id, "alternative account acquired"),
            None => debug!(excluded = exclude_id, "no alternative account available"),
        }
        selected
    }

    /// Record a failed attempt against an account.
    ///
    /// Increments the failure counter and last-used time in one store update;
    /// an active account whose counter reaches the threshold moves to `error`
    /// in the same update. Returns the account's resulting status.
    pub async fn report_failure(&self, account_id: &str) -> Result<AccountStatus> {
        let threshold = self.quarantine_threshold;
        let now = now_millis();
        let (fail_count, status, quarantined) = self
            .store
            .update_account(account_id, move |account| {
                account.fail_count = account.fail_count.saturating_add(1);
                account.last_used_at = Some(now);
                let quarantined =
                    account.status == AccountStatus::Active && account.fail_count >= threshold;
                if quarantined {
                    account.status = AccountStatus::Error;
                }
                (account.fail_count, account.status, quarantined)
            })
            .await?;

        if quarantined {
            warn!(account_id, fail_count, "account quarantined after repeated failures");
            metrics::counter!("pool_account_quarantined_total").increment(1);
        } else {
            debug!(account_id, fail_count, "account failure recorded");
        }
        Ok(status)
    }

    /// Record a successful attempt: updates last-used time only.
    pub async fn report_success(&self, account_id: &str) -> Result<()> {
        let now = now_millis();
        self.store
            .update_account(account_id, move |account| {
                account.last_used_at = Some(now);
            })
            .await?;
        Ok(())
    }

    /// Administrative reset: clears the failure counter and lifts quarantine.
    ///
    /// A `disabled` account stays disabled; only its counter is cleared.
    pub async fn reset(&self, account_id: &str) -> Result<UpstreamAccount> {
        let account = self
            .store
            .update_account(account_id, |account| {
                account.fail_count = 0;
                if account.status == AccountStatus::Error {
                    account.status = AccountStatus::Active;
                }
                account.clone()
            })
            .await?;
        info!(account_id, status = account.status.label(), "account reset");
        Ok(account)
    }

    /// Administrative toggle between `active` and `disabled`.
    ///
    /// Quarantined accounts leave `error` only through `reset()`. A disabled
    /// account whose counter is already at the threshold must be reset before
    /// it can be enabled.
    pub async fn toggle(&self, account_id: &str) -> Result<UpstreamAccount> {
        let threshold = self.quarantine_threshold;
        let outcome = self
            .store
            .update_account(account_id, move |account| match account.status {
                AccountStatus::Active => {
                    account.status = AccountStatus::Disabled;
                    Ok(account.clone())
                }
                AccountStatus::Disabled if account.fail_count >= threshold => {
                    Err(Error::InvalidTransition {
                        action: "enable (reset required)",
                        from: AccountStatus::Disabled,
                    })
                }
                AccountStatus::Disabled => {
                    account.status = AccountStatus::Active;
                    Ok(account.clone())
                }
                AccountStatus::Error => Err(Error::InvalidTransition {
                    action: "toggle",
                    from: AccountStatus::Error,
                }),
            })
            .await?;

        let account = outcome?;
        info!(account_id, status = account.status.label(), "account toggled");
        Ok(account)
    }

    /// Pool health summary. Never includes account secrets.
    ///
    /// Status mapping: all active → healthy, some active → degraded,
    /// none active (or empty pool) → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let accounts = self.store.accounts().await;
        let (total, active, disabled, error) = count_statuses(&accounts);

        let pool_status = if active == total && total > 0 {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let listed: Vec<serde_json::Value> = accounts
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "label": a.label,
                    "status": a.status.label(),
                    "fail_count": a.fail_count,
                    "last_used_at": a.last_used_at,
                    "created_at": a.created_at,
                })
            })
            .collect();

        serde_json::json!({
            "status": pool_status,
            "accounts_total": total,
            "accounts_active": active,
            "accounts_disabled": disabled,
            "accounts_error": error,
            "accounts": listed
        })
    }

    /// Build the exhausted error message JSON.
    async fn exhausted_message(&self) -> String {
        let accounts = self.store.accounts().await;
        let (total, active, disabled, error) = count_statuses(&accounts);
        serde_json::json!({
            "accounts_total": total,
            "accounts_active": active,
            "accounts_disabled": disabled,
            "accounts_error": error
        })
        .to_string()
    }
}

/// Count accounts by status: (total, active, disabled, error).
fn count_statuses(accounts: &[UpstreamAccount]) -> (usize, usize, usize, usize) {
    let mut active = 0usize;
    let mut disabled = 0usize;
    let mut error = 0usize;
    for account in accounts {
        match account.status {
            AccountStatus::Active => active += 1,
            AccountStatus::Disabled => disabled += 1,
            AccountStatus::Error => error += 1,
        }
    }
    (accounts.len(), active, disabled, error)
}
