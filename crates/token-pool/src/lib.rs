//! Upstream account pool for the metered relay
//!
//! Selects an upstream account for each relay attempt and tracks upstream
//! health. Account records, failure counters and the rotation pointer live in
//! the `relay_store::Store`; the pool holds no account state of its own, so
//! every selection sees the live pool.
//!
//! Account lifecycle:
//! 1. Admin adds account → `active`, failure counter 0
//! 2. `acquire()` rotates round-robin over `active` accounts by creation order
//! 3. Upstream 5xx / transport failure → `report_failure()` bumps the counter;
//!    reaching the quarantine threshold moves the account to `error`
//! 4. Failover uses `acquire_alternative()`: the healthiest remaining account
//! 5. `error` accounts return to `active` only through `reset()`
//! 6. `toggle()` moves accounts between `active` and `disabled`

pub mod classify;
pub mod error;
pub mod pool;

pub use classify::{UpstreamOutcome, classify_status};
pub use error::{Error, Result};
pub use pool::{DEFAULT_QUARANTINE_THRESHOLD, SelectedAccount, TokenPool};
