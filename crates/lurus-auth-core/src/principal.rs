//! Principal resolution across the four credential planes
//!
//! - password: username and password against the tenant's user table
//! - phone: one-shot SMS codes, with auto-registration
//! - bearer: OIDC JWTs verified against the provider's JWKS
//! - service key: `X-API-Key` internal keys
//!
//! Password and phone logins mint a session cookie that later requests
//! present instead.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lurus_db::{CreateUser, DbError, Store, TenantDb};
use lurus_types::{
    is_valid_chinese_phone, validate_email, validate_password, validate_username, AuthPlane,
    Principal, Role, Tenant, User, UserId, UserUpdate, DEFAULT_GROUP,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api_key::ApiKeyService;
use crate::crypto::{hash_token, random_digits};
use crate::invitation::{check_invitation, redeem_invitation};
use crate::password::{hash_password_async, verify_password_async};
use crate::session::{SessionManager, SessionPayload};
use crate::sms::{mask_phone, SmsSender};
use crate::tenant::{ensure_enabled, TenantBinder};
use crate::token::{OidcClaims, OidcValidator};
use crate::verification::{CodePurpose, VerificationStore, VERIFICATION_CODE_LEN};
use crate::{AuthConfig, AuthError, RegistrationMode};

/// Credentials found on a request, strongest plane first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials<'a> {
    ServiceKey(&'a str),
    Bearer(&'a str),
    Session(&'a str),
    None,
}

impl Credentials<'_> {
    pub fn plane(&self) -> AuthPlane {
        match self {
            Self::ServiceKey(_) => AuthPlane::ServiceKey,
            Self::Bearer(_) => AuthPlane::BearerJwt,
            Self::Session(_) => AuthPlane::Session,
            Self::None => AuthPlane::Public,
        }
    }
}

/// A successful password or phone login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    /// Signed cookie value
    pub cookie: String,
    pub session: SessionPayload,
    /// The account was created by this login
    pub created: bool,
}

/// Body of `POST /api/user/register`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub invitation_code: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub verification_code: Option<String>,
}

fn record_attempt(plane: AuthPlane, result: &Result<Principal, AuthError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.error_code(),
    };
    metrics::counter!(
        "iam_auth_attempts_total",
        "plane" => plane.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Resolves credentials to principals and runs the login flows
pub struct PrincipalResolver {
    store: Store,
    config: AuthConfig,
    sessions: SessionManager,
    binder: TenantBinder,
    oidc: Option<Arc<OidcValidator>>,
    api_keys: ApiKeyService,
    verification: Arc<VerificationStore>,
    sms: Option<Arc<dyn SmsSender>>,
}

impl PrincipalResolver {
    pub fn new(store: Store, config: AuthConfig) -> Result<Self, AuthError> {
        let sessions = SessionManager::new(config.session_secret.as_bytes(), config.session_duration)
            .map_err(|e| AuthError::Configuration(e.to_string()))?;
        let auto_create_tenant = config.oidc.as_ref().is_some_and(|o| o.auto_create_tenant);
        let binder = TenantBinder::new(store.clone(), config.platform_admin_role.clone())
            .with_auto_create(auto_create_tenant);
        let oidc = config.oidc.clone().map(|o| Arc::new(OidcValidator::new(o)));

        Ok(Self {
            api_keys: ApiKeyService::new(store.clone()),
            verification: Arc::new(VerificationStore::from_config(&config)),
            store,
            config,
            sessions,
            binder,
            oidc,
            sms: None,
        })
    }

    /// Enable the phone plane
    pub fn with_sms(mut self, sender: Arc<dyn SmsSender>) -> Self {
        self.sms = Some(sender);
        self
    }

    /// Replace the OIDC validator, e.g. one using a custom HTTP client
    pub fn with_oidc_validator(mut self, validator: OidcValidator) -> Self {
        self.oidc = Some(Arc::new(validator));
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn binder(&self) -> &TenantBinder {
        &self.binder
    }

    pub fn oidc(&self) -> Option<&Arc<OidcValidator>> {
        self.oidc.as_ref()
    }

    pub fn api_keys(&self) -> &ApiKeyService {
        &self.api_keys
    }

    pub fn verification(&self) -> &Arc<VerificationStore> {
        &self.verification
    }

    pub fn sms_enabled(&self) -> bool {
        self.sms.is_some()
    }

    // ------------------------------------------------------------------
    // Request credentials
    // ------------------------------------------------------------------

    /// Resolve the principal of a request
    pub async fn resolve(&self, credentials: Credentials<'_>, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let plane = credentials.plane();
        let result = match credentials {
            Credentials::ServiceKey(raw) => self.api_keys.authenticate(raw, now).await,
            Credentials::Bearer(token) => self.bearer(token).await,
            Credentials::Session(cookie) => self.session(cookie, now).await,
            Credentials::None => Err(AuthError::UnknownPlane),
        };
        record_attempt(plane, &result);
        result
    }

    /// Validate a session cookie and reload its user
    pub async fn session(&self, cookie: &str, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let payload = self.sessions.validate_cookie(cookie, now)?;
        let db = self.store.for_tenant(payload.tenant_id.clone());
        let user = db
            .find_user(payload.user_id)
            .await?
            .ok_or(AuthError::AuthFailed)?;
        if !user.is_enabled() {
            return Err(AuthError::UserDisabled);
        }
        Ok(Principal::session(user.tenant_id, user.id, user.role))
    }

    /// Verify an OIDC bearer token and map its subject to a local user
    #[instrument(skip_all)]
    pub async fn bearer(&self, token: &str) -> Result<Principal, AuthError> {
        let Some(validator) = &self.oidc else {
            tracing::debug!("Bearer token presented but OIDC is not configured");
            return Err(AuthError::AuthFailed);
        };
        let claims = validator.validate(token).await?;
        let tenant = self.binder.resolve_org(&claims).await?;
        ensure_enabled(&tenant)?;

        let user = self.map_subject(&tenant, &claims).await?;
        if !user.is_enabled() {
            return Err(AuthError::UserDisabled);
        }
        Ok(Principal::bearer(tenant.id, user.id, user.role, claims.role_names()))
    }

    async fn map_subject(&self, tenant: &Tenant, claims: &OidcClaims) -> Result<User, AuthError> {
        let identities = &self.store.identities;
        let db = self.store.for_tenant(tenant.id.clone());

        if let Some(mapping) = identities.find(&tenant.id, &claims.sub).await? {
            if mapping.display_name != claims.display_name() || mapping.email != claims.email {
                identities
                    .sync(&tenant.id, &claims.sub, claims.display_name(), &claims.email)
                    .await?;
            }
            return db
                .find_user(UserId(mapping.user_id))
                .await?
                .ok_or(AuthError::UserNotFound);
        }

        let auto_create = self.config.oidc.as_ref().is_some_and(|o| o.auto_create_user);
        if !auto_create {
            tracing::debug!(tenant_id = %tenant.id, "No local user for OIDC subject");
            return Err(AuthError::UserNotFound);
        }

        let user = CreateUser {
            tenant_id: tenant.id.clone(),
            username: oidc_username(&claims.sub),
            password_hash: None,
            display_name: claims.display_name().to_string(),
            email: claims.email.clone(),
            phone: String::new(),
            phone_verified: false,
            role: Role::Common,
            group: DEFAULT_GROUP.to_string(),
            quota: self.new_user_quota(tenant).await,
            aff_code: String::new(),
        };
        match identities.create_with_user(user, &claims.sub).await {
            Ok((user, _)) => {
                tracing::info!(tenant_id = %tenant.id, user_id = %user.id, "Auto-created user for OIDC subject");
                Ok(user)
            }
            // First logins of the same subject raced; the winner's row is there
            Err(DbError::Conflict(_)) => {
                let mapping = identities
                    .find(&tenant.id, &claims.sub)
                    .await?
                    .ok_or_else(|| AuthError::Conflict("Identity already linked".into()))?;
                db.find_user(UserId(mapping.user_id))
                    .await?
                    .ok_or(AuthError::UserNotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Password plane
    // ------------------------------------------------------------------

    /// Username and password login.
    ///
    /// A disabled account is reported as such whatever the password. Unknown
    /// users cost the same hashing work as a wrong password.
    #[instrument(skip(self, tenant, password), fields(tenant_id = %tenant.id))]
    pub async fn password_login(
        &self,
        tenant: &Tenant,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<LoginOutcome, AuthError> {
        let db = self.store.for_tenant(tenant.id.clone());
        let user = db.find_user_by_username(username.trim()).await?;
        let hash = user.as_ref().and_then(|u| u.password_hash.clone());
        let verified = verify_password_async(password.to_string(), hash).await;

        let result = match user {
            None => Err(AuthError::AuthFailed),
            Some(user) if !user.is_enabled() => Err(AuthError::UserDisabled),
            Some(user) if verified => self.login(user, false, now),
            Some(_) => Err(AuthError::AuthFailed),
        };
        record_login(AuthPlane::Session, "password", &result);
        result
    }

    /// Create a password account.
    ///
    /// In `invite_only` mode the invitation code is consumed once the user
    /// exists; if that fails the user is removed again.
    #[instrument(skip(self, tenant, request), fields(tenant_id = %tenant.id, username = %request.username))]
    pub async fn register(
        &self,
        tenant: &Tenant,
        request: RegisterRequest,
        now: DateTime<Utc>,
    ) -> Result<LoginOutcome, AuthError> {
        let db = self.store.for_tenant(tenant.id.clone());
        let mode = self.registration_mode(tenant).await;
        if mode == RegistrationMode::Closed {
            return Err(AuthError::RegistrationClosed("Registration is closed".into()));
        }

        validate_username(&request.username)?;
        validate_password(&request.password)?;
        validate_email(&request.email)?;

        let invitation = match mode {
            RegistrationMode::InviteOnly => {
                let code = request
                    .invitation_code
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| AuthError::Validation("Invitation code is required".into()))?;
                check_invitation(&db, code, now).await?;
                Some(code.to_string())
            }
            _ => None,
        };

        let phone = match request.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(phone) => {
                if !is_valid_chinese_phone(phone) {
                    return Err(AuthError::Validation("Invalid phone number format".into()));
                }
                let code = request.verification_code.as_deref().unwrap_or_default();
                if !self.verification.verify(CodePurpose::Register, phone, code, now) {
                    return Err(AuthError::InvalidCode);
                }
                phone.to_string()
            }
            None => String::new(),
        };

        if db.find_user_by_username(&request.username).await?.is_some() {
            return Err(AuthError::UserExists("Username already exists".into()));
        }

        let hash = hash_password_async(request.password).await?;
        let display_name = if request.display_name.trim().is_empty() {
            request.username.clone()
        } else {
            request.display_name.trim().to_string()
        };
        let user = db
            .create_user(CreateUser {
                tenant_id: tenant.id.clone(),
                username: request.username,
                password_hash: Some(hash),
                display_name,
                email: request.email,
                phone_verified: !phone.is_empty(),
                phone,
                role: Role::Common,
                group: DEFAULT_GROUP.to_string(),
                quota: self.new_user_quota(tenant).await,
                aff_code: String::new(),
            })
            .await
            .map_err(user_conflict)?;

        if let Some(code) = invitation {
            if let Err(e) = redeem_invitation(&db, &code, user.id, now).await {
                tracing::warn!(user_id = %user.id, error = %e, "Invitation redeem failed, removing new user");
                if let Err(cleanup) = db.delete_user(user.id).await {
                    tracing::error!(user_id = %user.id, error = %cleanup, "Failed to remove user after invitation failure");
                }
                return Err(e);
            }
        }

        tracing::info!(user_id = %user.id, "User registered");
        self.login(user, true, now)
    }

    // ------------------------------------------------------------------
    // Phone plane
    // ------------------------------------------------------------------

    fn sms(&self) -> Result<&Arc<dyn SmsSender>, AuthError> {
        self.sms
            .as_ref()
            .ok_or_else(|| AuthError::Validation("SMS service is not enabled".into()))
    }

    /// Send a verification code to `phone`
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id, phone = %mask_phone(phone)))]
    pub async fn send_code(
        &self,
        tenant: &Tenant,
        phone: &str,
        purpose: CodePurpose,
        ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let sms = self.sms()?;
        if !purpose.is_phone() {
            return Err(AuthError::Validation(format!("{} codes are not sent by SMS", purpose.as_str())));
        }
        if !is_valid_chinese_phone(phone) {
            return Err(AuthError::Validation("Invalid phone number format".into()));
        }
        if purpose == CodePurpose::Register {
            let db = self.store.for_tenant(tenant.id.clone());
            if db.find_user_by_phone(phone).await?.is_some() {
                return Err(AuthError::Validation("Phone number is already registered".into()));
            }
        }

        self.verification.reserve_send(phone, ip, now)?;
        let code = random_digits(VERIFICATION_CODE_LEN);
        if let Err(e) = sms.send_code(phone, purpose, &code).await {
            self.verification.release_send(phone);
            tracing::warn!(error = %e, "Failed to send verification code");
            return Err(e);
        }
        self.verification.store(purpose, phone, code, now);
        Ok(())
    }

    /// Log in with a phone code, registering the phone when allowed
    #[instrument(skip(self, tenant, code), fields(tenant_id = %tenant.id, phone = %mask_phone(phone)))]
    pub async fn phone_login(
        &self,
        tenant: &Tenant,
        phone: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<LoginOutcome, AuthError> {
        self.sms()?;
        let result = self.phone_login_inner(tenant, phone, code, now).await;
        record_login(AuthPlane::Session, "phone", &result);
        result
    }

    async fn phone_login_inner(
        &self,
        tenant: &Tenant,
        phone: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<LoginOutcome, AuthError> {
        if !is_valid_chinese_phone(phone) {
            return Err(AuthError::Validation("Invalid phone number format".into()));
        }
        if !self.verification.verify(CodePurpose::Login, phone, code, now) {
            return Err(AuthError::InvalidCode);
        }

        let db = self.store.for_tenant(tenant.id.clone());
        if let Some(user) = db.find_user_by_phone(phone).await? {
            if !user.is_enabled() {
                return Err(AuthError::UserDisabled);
            }
            return self.login(user, false, now);
        }

        if !self.sms_auto_register(tenant).await {
            return Err(AuthError::UserNotFound);
        }
        match self.registration_mode(tenant).await {
            RegistrationMode::Closed => {
                return Err(AuthError::RegistrationClosed("Registration is closed".into()))
            }
            RegistrationMode::InviteOnly => {
                return Err(AuthError::RegistrationClosed(
                    "Registration requires an invitation code. Please register through the registration page."
                        .into(),
                ))
            }
            RegistrationMode::Open => {}
        }

        let user = self.create_phone_user(&db, tenant, phone).await?;
        tracing::info!(user_id = %user.id, "Auto-registered user by phone");
        self.login(user, true, now)
    }

    async fn create_phone_user(&self, db: &TenantDb, tenant: &Tenant, phone: &str) -> Result<User, AuthError> {
        let created = db
            .create_user(CreateUser {
                tenant_id: tenant.id.clone(),
                username: format!("phone_{phone}"),
                password_hash: None,
                display_name: mask_phone(phone),
                email: String::new(),
                phone: phone.to_string(),
                phone_verified: true,
                role: Role::Common,
                group: DEFAULT_GROUP.to_string(),
                quota: self.new_user_quota(tenant).await,
                aff_code: String::new(),
            })
            .await;
        match created {
            Ok(user) => Ok(user),
            // A concurrent login with the same phone created it first
            Err(DbError::Conflict(_)) => db
                .find_user_by_phone(phone)
                .await?
                .ok_or_else(|| AuthError::UserExists("Username already exists".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Bind a verified phone to the logged-in user
    #[instrument(skip(self, db, code), fields(user_id = %user_id, phone = %mask_phone(phone)))]
    pub async fn bind_phone(
        &self,
        db: &TenantDb,
        user_id: UserId,
        phone: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<User, AuthError> {
        self.sms()?;
        if !is_valid_chinese_phone(phone) {
            return Err(AuthError::Validation("Invalid phone number format".into()));
        }
        if !self.verification.verify(CodePurpose::Bind, phone, code, now) {
            return Err(AuthError::InvalidCode);
        }
        if let Some(existing) = db.find_user_by_phone(phone).await? {
            if existing.id != user_id {
                return Err(AuthError::Conflict(
                    "Phone number is already bound to another account".into(),
                ));
            }
        }
        let update = UserUpdate {
            phone: Some(phone.to_string()),
            ..Default::default()
        };
        db.update_user(user_id, &update)
            .await
            .map_err(|e| match e {
                DbError::Conflict(_) => {
                    AuthError::Conflict("Phone number is already bound to another account".into())
                }
                other => other.into(),
            })?
            .ok_or(AuthError::UserNotFound)
    }

    /// Set a new password after proving control of the account's phone
    #[instrument(skip(self, tenant, code, new_password), fields(tenant_id = %tenant.id))]
    pub async fn reset_password(
        &self,
        tenant: &Tenant,
        phone: &str,
        code: &str,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        self.sms()?;
        validate_password(new_password)?;
        if !self.verification.verify(CodePurpose::Reset, phone, code, now) {
            return Err(AuthError::InvalidCode);
        }
        let db = self.store.for_tenant(tenant.id.clone());
        let user = db
            .find_user_by_phone(phone)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        let hash = hash_password_async(new_password.to_string()).await?;
        db.set_password_hash(user.id, &hash).await?;
        tracing::info!(user_id = %user.id, "Password reset by phone");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn login(&self, user: User, created: bool, now: DateTime<Utc>) -> Result<LoginOutcome, AuthError> {
        let (cookie, session) = self.sessions.issue(&user, now)?;
        Ok(LoginOutcome {
            user,
            cookie,
            session,
            created,
        })
    }

    /// Registration mode of `tenant`; a tenant config row overrides the
    /// process default
    pub async fn registration_mode(&self, tenant: &Tenant) -> RegistrationMode {
        self.tenant_setting(tenant, "registration_mode")
            .await
            .and_then(|v| RegistrationMode::parse(&v))
            .unwrap_or(self.config.registration_mode)
    }

    async fn sms_auto_register(&self, tenant: &Tenant) -> bool {
        self.tenant_setting(tenant, "sms_auto_register")
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.config.sms_auto_register)
    }

    /// Starting balance of accounts created in `tenant`
    async fn new_user_quota(&self, tenant: &Tenant) -> i64 {
        self.tenant_setting(tenant, "quota.new_user_quota")
            .await
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|q| *q >= 0)
            .unwrap_or(0)
    }

    async fn tenant_setting(&self, tenant: &Tenant, key: &str) -> Option<String> {
        match self.store.tenant_configs.get(&tenant.id, key).await {
            Ok(row) => row.map(|r| r.value),
            Err(e) => {
                tracing::warn!(tenant_id = %tenant.id, key, error = %e, "Tenant config lookup failed");
                None
            }
        }
    }
}

fn record_login(plane: AuthPlane, method: &'static str, result: &Result<LoginOutcome, AuthError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.error_code(),
    };
    metrics::counter!(
        "iam_auth_attempts_total",
        "plane" => plane.as_str(),
        "method" => method,
        "outcome" => outcome
    )
    .increment(1);
}

/// Local username for an OIDC subject; stable so racing first logins
/// collide on it
fn oidc_username(sub: &str) -> String {
    format!("oidc_{}", &hash_token(sub)[..12])
}

fn user_conflict(err: DbError) -> AuthError {
    match err {
        DbError::Conflict(msg) => AuthError::UserExists(msg),
        other => other.into(),
    }
}

impl std::fmt::Debug for PrincipalResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalResolver")
            .field("oidc", &self.oidc.is_some())
            .field("sms", &self.sms.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::LogSmsSender;
    use lurus_types::{CreateInvitationRequest, TenantId, UserStatus};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    async fn setup(mode: RegistrationMode) -> (PrincipalResolver, Tenant, Store) {
        let store = Store::memory();
        let config = AuthConfig::new(SECRET).with_registration_mode(mode);
        let resolver = PrincipalResolver::new(store.clone(), config)
            .unwrap()
            .with_sms(Arc::new(LogSmsSender));
        let tenant = store
            .tenants
            .find_by_id(&TenantId::default_tenant())
            .await
            .unwrap()
            .unwrap();
        (resolver, tenant, store)
    }

    fn register(username: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.into(),
            password: "correct-horse".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn password_login_paths() {
        let (resolver, tenant, store) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        let outcome = resolver.register(&tenant, register("alice"), now).await.unwrap();
        assert!(outcome.created);

        let ok = resolver
            .password_login(&tenant, "alice", "correct-horse", now)
            .await
            .unwrap();
        assert_eq!(ok.user.id, outcome.user.id);

        let wrong = resolver.password_login(&tenant, "alice", "nope-nope", now).await;
        assert!(matches!(wrong, Err(AuthError::AuthFailed)));
        let missing = resolver.password_login(&tenant, "bob", "correct-horse", now).await;
        assert!(matches!(missing, Err(AuthError::AuthFailed)));

        let db = store.for_tenant(tenant.id.clone());
        let disable = UserUpdate {
            status: Some(UserStatus::Disabled),
            ..Default::default()
        };
        db.update_user(ok.user.id, &disable).await.unwrap();
        let disabled = resolver
            .password_login(&tenant, "alice", "correct-horse", now)
            .await;
        assert!(matches!(disabled, Err(AuthError::UserDisabled)));
    }

    #[tokio::test]
    async fn disabled_account_is_reported_even_with_wrong_password() {
        let (resolver, tenant, store) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        let outcome = resolver.register(&tenant, register("ivan"), now).await.unwrap();
        let disable = UserUpdate {
            status: Some(UserStatus::Disabled),
            ..Default::default()
        };
        store
            .for_tenant(tenant.id.clone())
            .update_user(outcome.user.id, &disable)
            .await
            .unwrap();

        let err = resolver
            .password_login(&tenant, "ivan", "not-the-password", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserDisabled));
        assert_eq!(err.error_code(), "USER_DISABLED");
    }

    #[tokio::test]
    async fn session_cookie_resolves_to_principal() {
        let (resolver, tenant, _) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        let outcome = resolver.register(&tenant, register("carol"), now).await.unwrap();

        let principal = resolver
            .resolve(Credentials::Session(&outcome.cookie), now)
            .await
            .unwrap();
        assert_eq!(principal.user_id, Some(outcome.user.id));
        assert_eq!(principal.plane, AuthPlane::Session);

        assert!(matches!(
            resolver.resolve(Credentials::None, now).await,
            Err(AuthError::UnknownPlane)
        ));
    }

    #[tokio::test]
    async fn closed_registration() {
        let (resolver, tenant, _) = setup(RegistrationMode::Closed).await;
        let err = resolver
            .register(&tenant, register("dave"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn invite_only_registration_consumes_code() {
        let (resolver, tenant, store) = setup(RegistrationMode::InviteOnly).await;
        let now = Utc::now();
        let db = store.for_tenant(tenant.id.clone());

        let err = resolver.register(&tenant, register("erin"), now).await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));

        let admin = db
            .create_user(CreateUser {
                tenant_id: tenant.id.clone(),
                username: "admin".into(),
                password_hash: None,
                display_name: "Admin".into(),
                email: String::new(),
                phone: String::new(),
                phone_verified: false,
                role: Role::Admin,
                group: DEFAULT_GROUP.into(),
                quota: 0,
                aff_code: String::new(),
            })
            .await
            .unwrap();
        let codes = crate::invitation::create_invitations(
            &db,
            admin.id,
            &CreateInvitationRequest { count: 1, expires_in: None },
            now,
        )
        .await
        .unwrap();

        let mut request = register("erin");
        request.invitation_code = Some(codes[0].code.clone());
        resolver.register(&tenant, request.clone(), now).await.unwrap();

        request.username = "frank".into();
        let err = resolver.register(&tenant, request, now).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(db.find_user_by_username("frank").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn phone_login_auto_registers_once() {
        let (resolver, tenant, _) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        let phone = "13800138000";

        resolver.verification().store(CodePurpose::Login, phone, "123456".into(), now);
        let first = resolver.phone_login(&tenant, phone, "123456", now).await.unwrap();
        assert!(first.created);
        assert_eq!(first.user.username, "phone_13800138000");
        assert!(first.user.phone_verified);

        // One-shot: the same code cannot be replayed
        let replay = resolver.phone_login(&tenant, phone, "123456", now).await;
        assert!(matches!(replay, Err(AuthError::InvalidCode)));

        resolver.verification().store(CodePurpose::Login, phone, "654321".into(), now);
        let second = resolver.phone_login(&tenant, phone, "654321", now).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.user.id, first.user.id);
    }

    #[tokio::test]
    async fn phone_login_respects_registration_mode() {
        for mode in [RegistrationMode::InviteOnly, RegistrationMode::Closed] {
            let (resolver, tenant, _) = setup(mode).await;
            let now = Utc::now();
            resolver
                .verification()
                .store(CodePurpose::Login, "13900139000", "111111".into(), now);
            let err = resolver
                .phone_login(&tenant, "13900139000", "111111", now)
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::RegistrationClosed(_)), "{mode:?}");
        }
    }

    #[tokio::test]
    async fn unknown_phone_without_auto_register_is_not_found() {
        let store = Store::memory();
        let config = AuthConfig::new(SECRET).with_sms_auto_register(false);
        let resolver = PrincipalResolver::new(store.clone(), config)
            .unwrap()
            .with_sms(Arc::new(LogSmsSender));
        let tenant = store
            .tenants
            .find_by_id(&TenantId::default_tenant())
            .await
            .unwrap()
            .unwrap();
        let now = Utc::now();
        resolver
            .verification()
            .store(CodePurpose::Login, "13700137000", "222222".into(), now);

        let err = resolver
            .phone_login(&tenant, "13700137000", "222222", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserNotFound));
        assert_eq!(err.error_code(), "USER_NOT_FOUND");
    }

    #[tokio::test]
    async fn send_code_validates_and_throttles() {
        let (resolver, tenant, _) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        let bad = resolver
            .send_code(&tenant, "12345", CodePurpose::Login, None, now)
            .await;
        assert!(matches!(bad, Err(AuthError::Validation(_))));
        let email_purpose = resolver
            .send_code(&tenant, "13800138000", CodePurpose::EmailVerify, None, now)
            .await;
        assert!(matches!(email_purpose, Err(AuthError::Validation(_))));

        resolver
            .send_code(&tenant, "13800138000", CodePurpose::Login, None, now)
            .await
            .unwrap();
        assert_eq!(resolver.verification().len(), 1);
        let again = resolver
            .send_code(&tenant, "13800138000", CodePurpose::Login, None, now)
            .await;
        assert!(matches!(again, Err(AuthError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn sms_disabled_rejects_phone_plane() {
        let store = Store::memory();
        let resolver = PrincipalResolver::new(store.clone(), AuthConfig::new(SECRET)).unwrap();
        let tenant = store
            .tenants
            .find_by_id(&TenantId::default_tenant())
            .await
            .unwrap()
            .unwrap();
        let err = resolver
            .send_code(&tenant, "13800138000", CodePurpose::Login, None, Utc::now())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }

    #[tokio::test]
    async fn bind_phone_conflicts_with_other_account() {
        let (resolver, tenant, store) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        let db = store.for_tenant(tenant.id.clone());
        let a = resolver.register(&tenant, register("gina"), now).await.unwrap();
        let b = resolver.register(&tenant, register("hank"), now).await.unwrap();

        resolver.verification().store(CodePurpose::Bind, "13700137000", "222222".into(), now);
        let bound = resolver
            .bind_phone(&db, a.user.id, "13700137000", "222222", now)
            .await
            .unwrap();
        assert_eq!(bound.phone, "13700137000");

        resolver.verification().store(CodePurpose::Bind, "13700137000", "333333".into(), now);
        let err = resolver
            .bind_phone(&db, b.user.id, "13700137000", "333333", now)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn reset_password_by_phone() {
        let (resolver, tenant, _) = setup(RegistrationMode::Open).await;
        let now = Utc::now();
        resolver.verification().store(CodePurpose::Register, "13600136000", "444444".into(), now);
        let mut request = register("ivan");
        request.phone = Some("13600136000".into());
        request.verification_code = Some("444444".into());
        resolver.register(&tenant, request, now).await.unwrap();

        resolver.verification().store(CodePurpose::Reset, "13600136000", "555555".into(), now);
        resolver
            .reset_password(&tenant, "13600136000", "555555", "brand-new-pass", now)
            .await
            .unwrap();
        assert!(resolver
            .password_login(&tenant, "ivan", "brand-new-pass", now)
            .await
            .is_ok());
    }

    #[test]
    fn oidc_usernames_are_valid() {
        let name = oidc_username("281937461293847");
        assert!(validate_username(&name).is_ok(), "{name}");
        assert_eq!(name, oidc_username("281937461293847"));
    }
}
