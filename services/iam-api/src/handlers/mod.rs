//! HTTP handlers

pub mod admin;
pub mod auth;
pub mod health;
pub mod internal;
pub mod shared;
pub mod subscription;
pub mod tenants;
pub mod user;
pub mod webhook;

pub use health::{health, ready};
