//! JSON-file datastore
//!
//! `state.json` holds credentials, upstream accounts and the rotation pointer.
//! Every mutation runs under a tokio Mutex and persists with an atomic
//! temp-file + rename, so each operation below is one read-modify-write step
//! with no window for another request to interleave. Usage records go to an
//! append-only `usage.jsonl` beside it.
//!
//! The store is process-local: two gateway processes pointed at the same
//! directory would each hold their own copy of the document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keys::generate_key;
use crate::model::{
    AccountStatus, Credential, CredentialUpdate, MAX_CREDENTIALS_PER_USER, NewCredential,
    UpstreamAccount, UsageRecord, now_millis,
};

const STATE_FILE: &str = "state.json";
const USAGE_FILE: &str = "usage.jsonl";

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    credentials: Vec<Credential>,
    #[serde(default)]
    accounts: Vec<UpstreamAccount>,
    #[serde(default)]
    rotation_index: usize,
}

/// Datastore shared by the relay, the token pool and the admin API.
pub struct Store {
    state_path: PathBuf,
    usage_path: PathBuf,
    state: Mutex<Snapshot>,
    usage_lock: Mutex<()>,
}

impl Store {
    /// Open the datastore in `data_dir`, creating the directory and an empty
    /// document on first start.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating data dir {}: {e}", dir.display())))?;

        let state_path = dir.join(STATE_FILE);
        let usage_path = dir.join(USAGE_FILE);

        let state = if state_path.exists() {
            let contents = tokio::fs::read_to_string(&state_path)
                .await
                .map_err(|e| Error::Io(format!("reading state file: {e}")))?;
            let snapshot: Snapshot = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing state file: {e}")))?;
            info!(
                path = %state_path.display(),
                credentials = snapshot.credentials.len(),
                accounts = snapshot.accounts.len(),
                "loaded datastore"
            );
            snapshot
        } else {
            info!(path = %state_path.display(), "state file not found, starting with empty store");
            let snapshot = Snapshot::default();
            write_atomic(&state_path, &snapshot).await?;
            snapshot
        };

        Ok(Self {
            state_path,
            usage_path,
            state: Mutex::new(state),
            usage_lock: Mutex::new(()),
        })
    }

    // --- Credentials ---

    /// Look up a credential by its bearer secret.
    pub async fn credential_by_key(&self, key: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state.credentials.iter().find(|c| c.key == key).cloned()
    }

    /// Look up a credential by id.
    pub async fn credential(&self, id: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state.credentials.iter().find(|c| c.id == id).cloned()
    }

    /// All credentials owned by `user_id`, newest first.
    pub async fn credentials_for_user(&self, user_id: &str) -> Vec<Credential> {
        let state = self.state.lock().await;
        let mut owned: Vec<Credential> = state
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned
    }

    /// Create a credential with a freshly generated secret.
    ///
    /// Fails with `LimitReached` when the owner already holds
    /// `MAX_CREDENTIALS_PER_USER` credentials.
    pub async fn create_credential(&self, new: NewCredential) -> Result<Credential> {
        let mut state = self.state.lock().await;
        let owned = state
            .credentials
            .iter()
            .filter(|c| c.user_id == new.user_id)
            .count();
        if owned >= MAX_CREDENTIALS_PER_USER {
            return Err(Error::LimitReached(format!(
                "maximum {MAX_CREDENTIALS_PER_USER} API keys per user"
            )));
        }

        let credential = Credential {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new.user_id,
            key: generate_key(),
            name: new.name,
            is_active: true,
            rate_limit_per_minute: new.rate_limit_per_minute,
            usage_quota: new.usage_quota,
            usage_count: 0,
            created_at: now_millis(),
        };
        state.credentials.push(credential.clone());
        debug!(credential_id = credential.id, user_id = credential.user_id, "created credential");
        write_atomic(&self.state_path, &state).await?;
        Ok(credential)
    }

    /// Apply an owner edit (rename / toggle active).
    pub async fn update_credential(&self, id: &str, update: CredentialUpdate) -> Result<Credential> {
        let mut state = self.state.lock().await;
        let credential = state
            .credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
        if let Some(name) = update.name {
            credential.name = name;
        }
        if let Some(is_active) = update.is_active {
            credential.is_active = is_active;
        }
        let updated = credential.clone();
        debug!(credential_id = id, "updated credential");
        write_atomic(&self.state_path, &state).await?;
        Ok(updated)
    }

    /// Delete a credential. Returns whether it existed.
    pub async fn delete_credential(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.credentials.len();
        state.credentials.retain(|c| c.id != id);
        if state.credentials.len() == before {
            return Ok(false);
        }
        debug!(credential_id = id, "deleted credential");
        write_atomic(&self.state_path, &state).await?;
        Ok(true)
    }

    /// Increment a credential's usage count and return the new value.
    ///
    /// A finite quota caps the count: once reached, further increments leave
    /// it unchanged.
    pub async fn increment_usage(&self, id: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let credential = state
            .credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
        if credential.quota_exhausted() {
            return Ok(credential.usage_count);
        }
        credential.usage_count += 1;
        let count = credential.usage_count;
        write_atomic(&self.state_path, &state).await?;
        Ok(count)
    }

    // --- Upstream accounts ---

    /// All accounts, oldest first.
    pub async fn accounts(&self) -> Vec<UpstreamAccount> {
        let state = self.state.lock().await;
        let mut accounts = state.accounts.clone();
        accounts.sort_by_key(|a| a.created_at);
        accounts
    }

    /// Selectable accounts (`Active`), oldest first.
    pub async fn active_accounts(&self) -> Vec<UpstreamAccount> {
        let state = self.state.lock().await;
        let mut accounts: Vec<UpstreamAccount> = state
            .accounts
            .iter()
            .filter(|a| a.status == AccountStatus::Active)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        accounts
    }

    /// Look up an account by id.
    pub async fn account(&self, id: &str) -> Option<UpstreamAccount> {
        let state = self.state.lock().await;
        state.accounts.iter().find(|a| a.id == id).cloned()
    }

    /// Add one upstream account in `Active` state.
    pub async fn add_account(&self, token: String, label: Option<String>) -> Result<UpstreamAccount> {
        let mut added = self.add_accounts(vec![token], label).await?;
        added
            .pop()
            .ok_or_else(|| Error::Invalid("upstream token must not be empty".into()))
    }

    /// Add a batch of upstream accounts sharing one label. Blank tokens are skipped.
    pub async fn add_accounts(
        &self,
        tokens: Vec<String>,
        label: Option<String>,
    ) -> Result<Vec<UpstreamAccount>> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        let added: Vec<UpstreamAccount> = tokens
            .into_iter()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .map(|token| UpstreamAccount {
                id: uuid::Uuid::new_v4().to_string(),
                token,
                label: label.clone(),
                status: AccountStatus::Active,
                fail_count: 0,
                last_used_at: None,
                created_at: now,
            })
            .collect();
        if added.is_empty() {
            return Ok(added);
        }
        state.accounts.extend(added.iter().cloned());
        debug!(count = added.len(), "added upstream accounts");
        write_atomic(&self.state_path, &state).await?;
        Ok(added)
    }

    /// Apply `f` to an account and persist, as one step under the store lock.
    ///
    /// This is the compare-and-update primitive the token pool builds its
    /// counters and status transitions on.
    pub async fn update_account<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut UpstreamAccount) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("upstream account {id}")))?;
        let result = f(account);
        write_atomic(&self.state_path, &state).await?;
        Ok(result)
    }

    /// Delete an account. Returns whether it existed.
    pub async fn delete_account(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.accounts.len();
        state.accounts.retain(|a| a.id != id);
        if state.accounts.len() == before {
            return Ok(false);
        }
        debug!(account_id = id, "deleted upstream account");
        write_atomic(&self.state_path, &state).await?;
        Ok(true)
    }

    // --- Rotation pointer ---

    /// Current rotation pointer.
    pub async fn rotation_index(&self) -> usize {
        self.state.lock().await.rotation_index
    }

    /// Return the current rotation pointer and persist `(pointer + 1) % pool_size`.
    ///
    /// `pool_size` is whatever the caller observed when it listed the pool;
    /// the list and this call are separate steps.
    pub async fn advance_rotation(&self, pool_size: usize) -> Result<usize> {
        let mut state = self.state.lock().await;
        let current = state.rotation_index;
        state.rotation_index = if pool_size == 0 {
            0
        } else {
            (current + 1) % pool_size
        };
        write_atomic(&self.state_path, &state).await?;
        Ok(current)
    }

    // --- Usage records ---

    /// Append one usage record to the usage log.
    pub async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| Error::Parse(format!("serializing usage record: {e}")))?;
        line.push('\n');

        let _guard = self.usage_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.usage_path)
            .await
            .map_err(|e| Error::Io(format!("opening usage log: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("appending usage record: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Error::Io(format!("flushing usage log: {e}")))?;
        Ok(())
    }

    /// Every usage record, oldest first. Unparseable lines are skipped.
    pub async fn usage_records(&self) -> Result<Vec<UsageRecord>> {
        let _guard = self.usage_lock.lock().await;
        let contents = match tokio::fs::read_to_string(&self.usage_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(format!("reading usage log: {e}"))),
        };

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed usage record"),
            }
        }
        Ok(records)
    }

    /// A page of `user_id`'s usage records, newest first.
    pub async fn usage_for_user(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UsageRecord>> {
        let records = self.usage_records().await?;
        Ok(records
            .into_iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .skip(offset)
            .take(limit)
            .collect())
    }
}

/// Write the document atomically (temp file + rename, mode 0600 on unix).
async fn write_atomic(path: &Path, data: &Snapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("state path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "persisted state");
    Ok(())
}
