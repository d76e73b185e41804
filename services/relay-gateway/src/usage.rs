//! Best-effort usage accounting
//!
//! Failures are logged and counted, never returned: a broken usage log must
//! not change the response already decided for the caller.

use std::sync::Arc;
use std::time::Instant;

use relay_store::{Store, UsageRecord, now_millis};
use tracing::{debug, warn};

use crate::auth::AuthContext;

#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<Store>,
}

impl UsageRecorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append one usage record for a terminal outcome.
    pub async fn record(
        &self,
        ctx: &AuthContext,
        endpoint: &str,
        status_code: u16,
        upstream_account_id: Option<&str>,
        started: Instant,
    ) {
        let record = UsageRecord {
            user_id: ctx.user_id.clone(),
            credential_id: ctx.credential_id.clone(),
            endpoint: endpoint.to_string(),
            status_code,
            upstream_account_id: upstream_account_id.map(str::to_string),
            response_time_ms: started.elapsed().as_millis() as u64,
            created_at: now_millis(),
        };

        if let Err(e) = self.store.append_usage(&record).await {
            warn!(credential_id = ctx.credential_id, status_code, error = %e, "failed to write usage record");
            crate::metrics::record_usage_write_failure("record");
        }
    }

    /// Count one successful relay against the credential's quota.
    pub async fn increment_usage(&self, ctx: &AuthContext) {
        match self.store.increment_usage(&ctx.credential_id).await {
            Ok(count) => debug!(credential_id = ctx.credential_id, usage_count = count, "usage incremented"),
            Err(e) => {
                warn!(credential_id = ctx.credential_id, error = %e, "failed to increment usage");
                crate::metrics::record_usage_write_failure("increment");
            }
        }
    }
}
