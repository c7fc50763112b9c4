//! Lurus Types - Shared domain types
//!
//! This crate contains the domain vocabulary used across Lurus services:
//! - Tenants, users and authenticated principals
//! - Subscriptions, plans and the daily quota state machine
//! - Service API keys, scopes and invitation codes
//! - The uniform API response envelope
//!
//! Everything here is free of I/O so the state transitions can be shared by
//! the PostgreSQL and in-memory stores alike.

pub mod api;
pub mod api_key;
pub mod error;
pub mod invitation;
pub mod plan;
pub mod principal;
pub mod quota;
pub mod subscription;
pub mod tenant;
pub mod token;
pub mod user;

pub use api::*;
pub use api_key::*;
pub use error::*;
pub use invitation::*;
pub use plan::*;
pub use principal::*;
pub use quota::*;
pub use subscription::*;
pub use tenant::*;
pub use token::*;
pub use user::*;
