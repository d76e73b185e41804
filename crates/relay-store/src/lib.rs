//! Datastore adapter for the metered relay
//!
//! Holds the three record types the relay reads and writes (caller credentials,
//! upstream accounts, usage records) and the shared rotation pointer. The
//! `Store` is the arbiter of truth for all of them; the relay keeps no copies
//! across requests.
//!
//! Record flow:
//! 1. Owner creates a `Credential` via `Store::create_credential()` (max 10 per user)
//! 2. Administrator adds `UpstreamAccount`s via `Store::add_account()` / `add_accounts()`
//! 3. Relay looks up the caller with `Store::credential_by_key()`
//! 4. Token pool rotates with `Store::advance_rotation()` and mutates accounts
//!    with `Store::update_account()`
//! 5. Relay appends one `UsageRecord` per terminal outcome and bumps the
//!    credential counter with `Store::increment_usage()`

pub mod error;
pub mod keys;
pub mod model;
pub mod store;

pub use error::{Error, Result};
pub use keys::{generate_key, mask_key};
pub use model::{
    AccountStatus, Credential, CredentialUpdate, DEFAULT_RATE_LIMIT_PER_MINUTE,
    DEFAULT_USAGE_QUOTA, MAX_CREDENTIALS_PER_USER, NewCredential, UpstreamAccount, UsageRecord,
    now_millis,
};
pub use store::Store;
