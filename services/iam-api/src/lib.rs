//! Lurus IAM API
//!
//! Identity, access and entitlement service: sessions, service keys and
//! OIDC tokens on the way in; users, subscriptions and quota behind them.

pub mod app;
pub mod config;
pub mod handlers;
pub mod state;

pub use app::build_router;
pub use config::{Config, ConfigError};
pub use state::{AppState, StateError};
