//! Lurus Auth Core - Identity and access logic
//!
//! Resolves request credentials to principals, binds them to tenants and
//! gates them on scopes and roles. Also owns the credential codes: internal
//! API keys, invitation codes and SMS verification codes.
//!
//! # Example
//!
//! ```rust,ignore
//! use lurus_auth_core::{AuthConfig, Credentials, PrincipalResolver};
//!
//! let resolver = PrincipalResolver::new(store, AuthConfig::new(secret))?;
//! let principal = resolver
//!     .resolve(Credentials::ServiceKey(raw_key), chrono::Utc::now())
//!     .await?;
//! ```

pub mod api_key;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod invitation;
pub mod password;
pub mod principal;
pub mod session;
pub mod sms;
pub mod tenant;
pub mod token;
pub mod verification;

pub use api_key::{generate_api_key, scope_descriptions, ApiKeyService};
pub use config::{AuthConfig, OidcConfig, RegistrationMode};
pub use crypto::{constant_time_eq, hash_token, hmac_sha256_hex, HmacKey, HmacKeyError};
pub use error::AuthError;
pub use gate::Gate;
pub use principal::{Credentials, LoginOutcome, PrincipalResolver, RegisterRequest};
pub use session::{SessionManager, SessionPayload, SESSION_COOKIE_NAME};
pub use sms::{HttpSmsSender, LogSmsSender, SmsConfig, SmsSender};
pub use tenant::{BindRequest, TenantBinder, TARGET_TENANT_HEADER};
pub use token::{OidcClaims, OidcValidator};
pub use verification::{CodePurpose, VerificationStore};
