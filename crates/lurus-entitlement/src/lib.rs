//! Lurus Entitlement - Quota ledger and subscription lifecycle
//!
//! Balance mutators, the subscription state machine with its payment
//! gateways and webhooks, the daily quota engine, and the background loops
//! that expire subscriptions and reset daily quotas.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lurus_entitlement::{EntitlementConfig, PaymentProviders, PlanCatalog, SubscriptionService};
//!
//! let config = Arc::new(EntitlementConfig::new("https://api.lurus.cn"));
//! let plans = Arc::new(PlanCatalog::new(store.options.clone()));
//! let providers = PaymentProviders::from_config(&config)?;
//! let subscriptions = SubscriptionService::new(store.clone(), plans, providers, config);
//!
//! let order = subscriptions
//!     .create(&db, user_id, "monthly", "stripe", false, chrono::Utc::now())
//!     .await?;
//! let checkout = subscriptions
//!     .initiate_payment(&db, user_id, order.id, chrono::Utc::now())
//!     .await?;
//! ```

pub mod config;
pub mod creem;
pub mod epay;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod plans;
pub mod provider;
pub mod quota;
pub mod retry;
pub mod stripe;
pub mod subscription;
pub mod watchdog;
pub mod webhook;

pub use config::{CreemConfig, EntitlementConfig, EpayConfig, JobSettings, StripeConfig, WatchdogConfig};
pub use error::EntitlementError;
pub use jobs::{run_periodic, spawn_catalog_sync, spawn_code_purge, JobRunner, RenewalScan};
pub use ledger::{AccountOutcome, Balance, Ledger, NewAccount, QuotaChange, QuotaInfo, TopUp};
pub use plans::{validate_plans, PlanCatalog, PLANS_OPTION_KEY};
pub use provider::{Checkout, PaymentProvider, PaymentProviders};
pub use quota::{DailyQuotaEngine, QuotaCheck};
pub use retry::{with_retry, RetryPolicy, Transient};
pub use subscription::{CurrentSubscription, PaymentStatus, SubscriptionService, WebhookOutcome};
pub use watchdog::{CpuProfile, CpuWatchdog};
pub use webhook::{
    CreemWebhook, EpayNotify, PaymentEvent, PaymentNotice, StripeWebhook, WebhookError,
    CREEM_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER,
};
