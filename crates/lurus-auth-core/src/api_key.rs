//! Internal service API keys
//!
//! Raw keys are `lurus_ik_` followed by 32 alphanumerics. Only the SHA-256
//! hash and a display prefix are stored; the raw key leaves the process once,
//! in the mint response.

use chrono::{DateTime, Utc};
use lurus_db::{ApiKeyUpdate, CreateApiKey, Store};
use lurus_types::{
    contains_wildcard, validate_scopes, ApiKey, ApiKeyId, CreateApiKeyRequest,
    CreateApiKeyResponse, Pagination, Principal, Role, TenantId, UpdateApiKeyRequest, UserId,
    API_KEY_DISPLAY_PREFIX_LEN, API_KEY_PREFIX, API_KEY_RANDOM_LEN,
};
use tracing::instrument;

use crate::crypto::{hash_token, random_alphanumeric};
use crate::AuthError;

/// Generate a fresh raw key
pub fn generate_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", random_alphanumeric(API_KEY_RANDOM_LEN))
}

/// Whether `raw` has the shape of an internal API key
pub fn looks_like_api_key(raw: &str) -> bool {
    raw.strip_prefix(API_KEY_PREFIX).is_some_and(|rest| {
        rest.len() == API_KEY_RANDOM_LEN && rest.chars().all(|c| c.is_ascii_alphanumeric())
    })
}

/// Display prefix kept alongside the hash
pub fn display_prefix(raw: &str) -> String {
    raw.chars().take(API_KEY_DISPLAY_PREFIX_LEN).collect()
}

/// Only root may hand out the wildcard scope
fn guard_wildcard<S: AsRef<str>>(scopes: &[S], actor_role: Role) -> Result<(), AuthError> {
    if contains_wildcard(scopes) && actor_role != Role::Root {
        return Err(AuthError::Forbidden(
            "Only root users may grant the wildcard scope".into(),
        ));
    }
    Ok(())
}

/// Mints, resolves and administers internal API keys
#[derive(Clone)]
pub struct ApiKeyService {
    store: Store,
}

impl ApiKeyService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve a raw key to its service principal.
    ///
    /// `last_used_at` is written by a detached task; the write may be lost.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, raw: &str, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        if !looks_like_api_key(raw) {
            return Err(AuthError::AuthFailed);
        }

        let key = self
            .store
            .api_keys
            .find_by_hash(&hash_token(raw))
            .await?
            .ok_or(AuthError::AuthFailed)?;

        if !key.is_valid(now) {
            tracing::debug!(key_id = %key.id, enabled = key.enabled, "API key disabled or expired");
            return Err(AuthError::AuthFailed);
        }

        let repo = self.store.api_keys.clone();
        let id = key.id;
        tokio::spawn(async move {
            if let Err(e) = repo.touch_last_used(id, now).await {
                tracing::debug!(key_id = %id, error = %e, "Failed to record API key use");
            }
        });

        Ok(Principal::service(key.tenant_id, key.name, key.scopes))
    }

    /// Mint a key; the response is the only place the raw key appears
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        request: CreateApiKeyRequest,
        actor: UserId,
        actor_role: Role,
    ) -> Result<CreateApiKeyResponse, AuthError> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.chars().count() > 64 {
            return Err(AuthError::Validation("Name must be 1-64 characters".into()));
        }
        validate_scopes(&request.scopes)?;
        guard_wildcard(&request.scopes, actor_role)?;
        if request.expires_at < 0 {
            return Err(AuthError::Validation("Invalid expiry".into()));
        }

        let tenant_id = match request.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            Some(id) => {
                let tenant_id = TenantId::new(id);
                self.store
                    .tenants
                    .find_by_id(&tenant_id)
                    .await?
                    .ok_or_else(|| AuthError::Validation("Unknown tenant".into()))?;
                Some(tenant_id)
            }
            None => None,
        };

        let raw = generate_api_key();
        let key = self
            .store
            .api_keys
            .create(CreateApiKey {
                tenant_id,
                name,
                key_hash: hash_token(&raw),
                key_prefix: display_prefix(&raw),
                scopes: request.scopes,
                created_by: Some(actor),
                expires_at: request.expires_at,
                description: request.description,
            })
            .await?;

        if contains_wildcard(&key.scopes) {
            tracing::warn!(key_id = %key.id, actor = %actor, "Wildcard API key minted");
        } else {
            tracing::info!(key_id = %key.id, actor = %actor, "API key minted");
        }

        Ok(CreateApiKeyResponse {
            id: key.id,
            key: raw,
            key_prefix: key.key_prefix,
            name: key.name,
            scopes: key.scopes,
            expires_at: key.expires_at,
        })
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        id: ApiKeyId,
        request: UpdateApiKeyRequest,
        actor: UserId,
        actor_role: Role,
    ) -> Result<ApiKey, AuthError> {
        if let Some(scopes) = &request.scopes {
            validate_scopes(scopes)?;
            guard_wildcard(scopes, actor_role)?;
        }
        let existing = self.get(id).await?;
        // A non-root operator may not edit a key that already holds the wildcard
        guard_wildcard(&existing.scopes, actor_role)?;

        if let Some(name) = &request.name {
            if name.trim().is_empty() {
                return Err(AuthError::Validation("Name must not be empty".into()));
            }
        }

        let update = ApiKeyUpdate {
            name: request.name.map(|n| n.trim().to_string()),
            scopes: request.scopes,
            description: request.description,
            expires_at: request.expires_at,
            enabled: request.enabled,
        };
        let key = self
            .store
            .api_keys
            .update(id, update)
            .await?
            .ok_or_else(|| AuthError::NotFound("API key not found".into()))?;
        tracing::info!(key_id = %id, actor = %actor, "API key updated");
        Ok(key)
    }

    /// Flip the enabled flag
    pub async fn toggle(&self, id: ApiKeyId, actor: UserId, actor_role: Role) -> Result<ApiKey, AuthError> {
        let existing = self.get(id).await?;
        let request = UpdateApiKeyRequest {
            enabled: Some(!existing.enabled),
            ..Default::default()
        };
        self.update(id, request, actor, actor_role).await
    }

    pub async fn delete(&self, id: ApiKeyId, actor: UserId) -> Result<(), AuthError> {
        if !self.store.api_keys.delete(id).await? {
            return Err(AuthError::NotFound("API key not found".into()));
        }
        tracing::info!(key_id = %id, actor = %actor, "API key deleted");
        Ok(())
    }

    pub async fn get(&self, id: ApiKeyId) -> Result<ApiKey, AuthError> {
        self.store
            .api_keys
            .find_by_id(id)
            .await?
            .ok_or_else(|| AuthError::NotFound("API key not found".into()))
    }

    pub async fn list(&self, page: &Pagination) -> Result<(Vec<ApiKey>, i64), AuthError> {
        Ok(self.store.api_keys.list(&page.normalized()).await?)
    }

    /// Log every stored key that carries the wildcard. Keys minted before
    /// the root-only rule stay valid; they are surfaced for review.
    pub async fn audit_wildcard_keys(&self) -> Result<usize, AuthError> {
        let keys = self.store.api_keys.list_wildcard().await?;
        for key in &keys {
            tracing::warn!(
                key_id = %key.id,
                name = %key.name,
                created_by = ?key.created_by,
                "API key holds the wildcard scope"
            );
        }
        Ok(keys.len())
    }
}

/// Display name of each scope in the vocabulary
pub fn scope_descriptions() -> Vec<(&'static str, &'static str)> {
    lurus_types::KNOWN_SCOPES
        .iter()
        .map(|scope| {
            let name = match *scope {
                "user:read" => "Read users",
                "user:write" => "Create and update users",
                "user:delete" => "Delete users",
                "subscription:read" => "Read subscriptions",
                "subscription:write" => "Grant subscriptions",
                "quota:read" => "Read quota",
                "quota:write" => "Adjust quota",
                "balance:read" => "Read balance",
                "balance:write" => "Top up balance",
                "token:read" => "Read relay tokens",
                "token:write" => "Create relay tokens",
                "auth:login" => "Authenticate users",
                _ => "All scopes",
            };
            (*scope, name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lurus_types::{AuthPlane, KNOWN_SCOPES};

    fn request(scopes: &[&str]) -> CreateApiKeyRequest {
        CreateApiKeyRequest {
            name: "billing".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
            expires_at: 0,
            tenant_id: None,
        }
    }

    #[test]
    fn generated_keys_have_the_documented_shape() {
        let key = generate_api_key();
        assert_eq!(key.len(), 41);
        assert!(key.starts_with("lurus_ik_"));
        assert!(looks_like_api_key(&key));
        assert_eq!(display_prefix(&key).len(), 16);
        assert!(!looks_like_api_key("lurus_ik_short"));
        assert!(!looks_like_api_key("sk-abcdefabcdefabcdefabcdefabcdefab"));
    }

    #[test]
    fn every_scope_has_a_description() {
        let descriptions = scope_descriptions();
        assert_eq!(descriptions.len(), KNOWN_SCOPES.len());
        assert!(descriptions.contains(&("*", "All scopes")));
    }

    #[tokio::test]
    async fn wildcard_needs_root() {
        let service = ApiKeyService::new(Store::memory());
        let err = service
            .create(request(&["*"]), UserId(1), Role::Admin)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let minted = service
            .create(request(&["*"]), UserId(1), Role::Root)
            .await
            .unwrap();
        assert_eq!(minted.key.len(), 41);
    }

    #[tokio::test]
    async fn minted_key_authenticates() {
        let service = ApiKeyService::new(Store::memory());
        let minted = service
            .create(request(&["quota:write"]), UserId(1), Role::Admin)
            .await
            .unwrap();

        let principal = service.authenticate(&minted.key, Utc::now()).await.unwrap();
        assert_eq!(principal.plane, AuthPlane::ServiceKey);
        assert!(principal.user_id.is_none());
        assert!(principal.has_scope("quota:write"));
        assert!(!principal.has_scope("quota:read"));
        assert_eq!(principal.key_name.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn disabled_or_expired_keys_fail() {
        let service = ApiKeyService::new(Store::memory());
        let minted = service
            .create(request(&["user:read"]), UserId(1), Role::Admin)
            .await
            .unwrap();

        service.toggle(minted.id, UserId(1), Role::Admin).await.unwrap();
        assert!(matches!(
            service.authenticate(&minted.key, Utc::now()).await,
            Err(AuthError::AuthFailed)
        ));

        service.toggle(minted.id, UserId(1), Role::Admin).await.unwrap();
        let mut req = request(&["user:read"]);
        req.name = "short-lived".into();
        req.expires_at = Utc::now().timestamp() + 60;
        let expiring = service.create(req, UserId(1), Role::Admin).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(service.authenticate(&expiring.key, later).await.is_err());
        assert!(service.authenticate(&minted.key, later).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_key_fails() {
        let service = ApiKeyService::new(Store::memory());
        assert!(matches!(
            service.authenticate(&generate_api_key(), Utc::now()).await,
            Err(AuthError::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn admin_cannot_edit_wildcard_key() {
        let service = ApiKeyService::new(Store::memory());
        let minted = service
            .create(request(&["*"]), UserId(1), Role::Root)
            .await
            .unwrap();
        let err = service
            .toggle(minted.id, UserId(2), Role::Admin)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let update = UpdateApiKeyRequest {
            scopes: Some(vec!["*".into()]),
            ..Default::default()
        };
        let plain = service
            .create(request(&["user:read"]), UserId(2), Role::Admin)
            .await
            .unwrap();
        assert!(service.update(plain.id, update, UserId(2), Role::Admin).await.is_err());
        assert_eq!(service.audit_wildcard_keys().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_scope_rejected() {
        let service = ApiKeyService::new(Store::memory());
        let err = service
            .create(request(&["user:admin"]), UserId(1), Role::Root)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }
}
