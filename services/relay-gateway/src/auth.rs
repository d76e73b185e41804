//! Credential authentication
//!
//! Every relay request re-reads the credential from the store; nothing is
//! cached between requests.

use relay_store::{Credential, Store};

/// Authenticated caller, as read from the store for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub credential_id: String,
    pub user_id: String,
    pub rate_limit: u32,
    /// `None` is unlimited
    pub usage_quota: Option<u64>,
    pub usage_count: u64,
}

impl AuthContext {
    pub fn quota_exhausted(&self) -> bool {
        matches!(self.usage_quota, Some(quota) if self.usage_count >= quota)
    }
}

impl From<&Credential> for AuthContext {
    fn from(credential: &Credential) -> Self {
        Self {
            credential_id: credential.id.clone(),
            user_id: credential.user_id.clone(),
            rate_limit: credential.rate_limit_per_minute,
            usage_quota: credential.usage_quota,
            usage_count: credential.usage_count,
        }
    }
}

/// Why a request carries no usable credential.
///
/// `QuotaExhausted` still identifies the caller, so the relay can apply rate
/// accounting and answer with a quota error instead of an authentication error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    MissingKey,
    UnknownKey,
    Inactive,
    QuotaExhausted(AuthContext),
}

/// Extract the bearer secret from an Authorization header value.
///
/// The `Bearer` scheme is matched case-insensitively and optional; surrounding
/// whitespace is ignored. Returns `None` for an empty secret.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let trimmed = header.trim_start();
    let rest = match trimmed.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer") => {
            let after = &trimmed[6..];
            if after.starts_with(char::is_whitespace) {
                after
            } else {
                trimmed
            }
        }
        _ => trimmed,
    };
    let key = rest.trim();
    if key.is_empty() { None } else { Some(key) }
}

/// Resolve an Authorization header to an authenticated context.
pub async fn authenticate(
    store: &Store,
    header: Option<&str>,
) -> Result<AuthContext, AuthFailure> {
    let key = header
        .and_then(extract_bearer)
        .ok_or(AuthFailure::MissingKey)?;

    let credential = store
        .credential_by_key(key)
        .await
        .ok_or(AuthFailure::UnknownKey)?;

    if !credential.is_active {
        return Err(AuthFailure::Inactive);
    }

    let ctx = AuthContext::from(&credential);
    if ctx.quota_exhausted() {
        return Err(AuthFailure::QuotaExhausted(ctx));
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::{CredentialUpdate, NewCredential};

    #[test]
    fn extract_bearer_variants() {
        let cases = [
            ("Bearer rk_abc", Some("rk_abc")),
            ("bearer rk_abc", Some("rk_abc")),
            ("BEARER   rk_abc  ", Some("rk_abc")),
            ("Bearer\trk_abc", Some("rk_abc")),
            ("rk_abc", Some("rk_abc")),
            ("Bearerrk_abc", Some("Bearerrk_abc")),
            ("Bearer ", None),
            ("   ", None),
            ("", None),
        ];
        for (header, expected) in cases {
            assert_eq!(extract_bearer(header), expected, "header {header:?}");
        }
    }

    async fn store_with_key(
        dir: &tempfile::TempDir,
        quota: Option<u64>,
    ) -> (Store, Credential) {
        let store = Store::open(dir.path()).await.unwrap();
        let credential = store
            .create_credential(NewCredential {
                user_id: "user-1".into(),
                name: "test".into(),
                rate_limit_per_minute: 60,
                usage_quota: quota,
            })
            .await
            .unwrap();
        (store, credential)
    }

    #[tokio::test]
    async fn valid_key_authenticates() {
        let dir = tempfile::tempdir().unwrap();
        let (store, credential) = store_with_key(&dir, Some(10)).await;

        let header = format!("Bearer {}", credential.key);
        let ctx = authenticate(&store, Some(&header)).await.unwrap();
        assert_eq!(ctx.credential_id, credential.id);
        assert_eq!(ctx.user_id, "user-1");
        assert_eq!(ctx.rate_limit, 60);
        assert_eq!(ctx.usage_quota, Some(10));
        assert_eq!(ctx.usage_count, 0);
    }

    #[tokio::test]
    async fn missing_and_unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with_key(&dir, None).await;

        assert_eq!(
            authenticate(&store, None).await,
            Err(AuthFailure::MissingKey)
        );
        assert_eq!(
            authenticate(&store, Some("Bearer ")).await,
            Err(AuthFailure::MissingKey)
        );
        assert_eq!(
            authenticate(&store, Some("Bearer rk_nope")).await,
            Err(AuthFailure::UnknownKey)
        );
    }

    #[tokio::test]
    async fn inactive_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, credential) = store_with_key(&dir, None).await;
        store
            .update_credential(
                &credential.id,
                CredentialUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let header = format!("Bearer {}", credential.key);
        assert_eq!(
            authenticate(&store, Some(&header)).await,
            Err(AuthFailure::Inactive)
        );
    }

    #[tokio::test]
    async fn zero_quota_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, credential) = store_with_key(&dir, Some(0)).await;

        let header = format!("Bearer {}", credential.key);
        match authenticate(&store, Some(&header)).await {
            Err(AuthFailure::QuotaExhausted(ctx)) => {
                assert_eq!(ctx.credential_id, credential.id);
                assert_eq!(ctx.usage_count, 0);
            }
            other => panic!("expected QuotaExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quota_reached_after_increments() {
        let dir = tempfile::tempdir().unwrap();
        let (store, credential) = store_with_key(&dir, Some(2)).await;
        let header = format!("Bearer {}", credential.key);

        store.increment_usage(&credential.id).await.unwrap();
        assert!(authenticate(&store, Some(&header)).await.is_ok());

        store.increment_usage(&credential.id).await.unwrap();
        assert!(matches!(
            authenticate(&store, Some(&header)).await,
            Err(AuthFailure::QuotaExhausted(_))
        ));
    }

    #[tokio::test]
    async fn unlimited_quota_never_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let (store, credential) = store_with_key(&dir, None).await;
        for _ in 0..5 {
            store.increment_usage(&credential.id).await.unwrap();
        }

        let header = format!("Bearer {}", credential.key);
        let ctx = authenticate(&store, Some(&header)).await.unwrap();
        assert_eq!(ctx.usage_count, 5);
        assert!(!ctx.quota_exhausted());
    }
}
