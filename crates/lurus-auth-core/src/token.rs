//! OIDC bearer token validation with JWKS caching

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{AuthError, OidcConfig};

/// JWKS (JSON Web Key Set) structure
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JWK (JSON Web Key)
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    pub alg: Option<String>,
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub e: String,
}

/// `aud` may be a single string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains_ct(&self, expected: &str) -> bool {
        let eq = |aud: &str| -> bool { aud.as_bytes().ct_eq(expected.as_bytes()).into() };
        match self {
            Self::One(aud) => eq(aud),
            Self::Many(auds) => auds.iter().fold(false, |found, aud| found | eq(aud)),
        }
    }
}

/// Claims of an identity-provider access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcClaims {
    pub sub: String,
    pub iss: String,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default, rename = "urn:zitadel:iam:org:id")]
    pub org_id: String,
    #[serde(default, rename = "urn:zitadel:iam:org:domain:primary")]
    pub org_domain: String,
    #[serde(default, rename = "urn:zitadel:iam:user:resourceowner:id")]
    pub resource_owner_id: String,
    #[serde(default, rename = "urn:zitadel:iam:user:resourceowner:name")]
    pub resource_owner_name: String,
    /// Role name to granting-organisation map
    #[serde(default, rename = "urn:zitadel:iam:org:project:roles")]
    pub roles: BTreeMap<String, serde_json::Value>,
}

impl OidcClaims {
    /// Organisation the subject acts for; falls back to the resource owner
    pub fn organisation(&self) -> Option<&str> {
        [self.org_id.as_str(), self.resource_owner_id.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
    }

    /// Role claim names, sorted
    pub fn role_names(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    /// Best display name available in the token
    pub fn display_name(&self) -> &str {
        [
            self.name.as_str(),
            self.preferred_username.as_str(),
            self.email.as_str(),
            self.sub.as_str(),
        ]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_default()
    }
}

/// In-memory JWKS keyed by `kid`.
///
/// A failed refresh leaves the cached keys in place; a successful one
/// replaces the set.
#[derive(Clone)]
pub struct JwksCache {
    keys: Cache<String, Arc<DecodingKey>>,
    last_kid_miss_refresh: Arc<Mutex<Option<Instant>>>,
}

impl JwksCache {
    fn new() -> Self {
        Self {
            keys: Cache::builder().max_capacity(100).build(),
            last_kid_miss_refresh: Arc::new(Mutex::new(None)),
        }
    }

    async fn get(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.keys.get(kid).await
    }

    /// Install a freshly fetched key set. Returns the number of usable keys.
    async fn replace(&self, jwks: &Jwks) -> usize {
        let mut fresh = HashSet::new();
        for jwk in jwks.keys.iter().filter(|k| k.kty == "RSA") {
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    self.keys.insert(jwk.kid.clone(), Arc::new(key)).await;
                    fresh.insert(jwk.kid.clone());
                }
                Err(e) => tracing::error!(kid = %jwk.kid, error = %e, "Unusable JWK"),
            }
        }
        if !fresh.is_empty() {
            let stale: Vec<String> = self
                .keys
                .iter()
                .map(|(kid, _)| kid.as_ref().clone())
                .filter(|kid| !fresh.contains(kid))
                .collect();
            for kid in stale {
                self.keys.invalidate(&kid).await;
            }
        }
        fresh.len()
    }

    pub fn len(&self) -> u64 {
        self.keys.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validates RS256 bearer tokens against the provider's JWKS.
///
/// Keys are fetched at start-up, on every unknown `kid` (at most once per
/// cooldown window), and on a periodic timer.
#[derive(Clone)]
pub struct OidcValidator {
    config: OidcConfig,
    http_client: reqwest::Client,
    cache: JwksCache,
}

impl OidcValidator {
    pub fn new(config: OidcConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.fetch_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(2)
            .tcp_nodelay(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(config, http_client)
    }

    /// Create a validator with custom HTTP client
    pub fn with_client(config: OidcConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
            cache: JwksCache::new(),
        }
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    pub fn cache(&self) -> &JwksCache {
        &self.cache
    }

    /// Validate a JWT and return its claims
    pub async fn validate(&self, token: &str) -> Result<OidcClaims, AuthError> {
        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "Failed to decode token header");
            AuthError::InvalidToken
        })?;
        if header.alg != Algorithm::RS256 {
            tracing::debug!(alg = ?header.alg, "Unsupported token algorithm");
            return Err(AuthError::InvalidToken);
        }
        let kid = header.kid.ok_or_else(|| {
            tracing::debug!("Token missing kid");
            AuthError::InvalidToken
        })?;

        let decoding_key = self.get_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        let claims = decode::<OidcClaims>(token, &decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token validation failed");
                match e.kind() {
                    ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                    _ => AuthError::InvalidToken,
                }
            })?
            .claims;

        if !self.config.client_id.is_empty() {
            let audience_ok = claims
                .aud
                .as_ref()
                .is_some_and(|aud| aud.contains_ct(&self.config.client_id));
            if !audience_ok {
                tracing::debug!(sub = %claims.sub, "Token audience does not include client");
                return Err(AuthError::InvalidToken);
            }
        }

        Ok(claims)
    }

    async fn get_key(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        if let Some(key) = self.cache.get(kid).await {
            return Ok(key);
        }

        // Serialise kid-miss refreshes so a burst of unknown kids costs at
        // most one fetch per cooldown window.
        let mut last = self.cache.last_kid_miss_refresh.lock().await;
        if let Some(key) = self.cache.get(kid).await {
            return Ok(key);
        }
        let cooling_down = last.is_some_and(|at| at.elapsed() < self.config.kid_miss_cooldown);
        if cooling_down {
            tracing::debug!(kid, "Unknown key ID during refresh cooldown");
            return Err(AuthError::InvalidToken);
        }
        *last = Some(Instant::now());
        drop(last);

        self.refresh().await?;

        self.cache.get(kid).await.ok_or_else(|| {
            tracing::debug!(kid, "Key not found in JWKS");
            AuthError::InvalidToken
        })
    }

    /// Fetch the key set and install it. On failure the cached keys stay.
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let jwks = self.fetch_jwks().await?;
        let count = self.cache.replace(&jwks).await;
        tracing::info!(keys = count, "Refreshed JWKS");
        Ok(count)
    }

    async fn fetch_jwks(&self) -> Result<Jwks, AuthError> {
        let url = self.config.jwks_url();
        tracing::debug!(%url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&url)
            .timeout(self.config.fetch_timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to fetch JWKS");
                AuthError::Upstream("Failed to fetch JWKS".to_string())
            })?;

        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "JWKS fetch returned error status");
            return Err(AuthError::Upstream("Failed to fetch JWKS".to_string()));
        }

        response.json::<Jwks>().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse JWKS");
            AuthError::Upstream("Failed to parse JWKS".to_string())
        })
    }

    /// Refresh now and then on every interval tick until cancelled
    pub fn spawn_refresh(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let validator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(validator.config.jwks_refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("JWKS refresh stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = validator.refresh().await {
                            tracing::warn!(error = %e, cached = validator.cache.len(), "JWKS refresh failed, keeping cached keys");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for OidcValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
