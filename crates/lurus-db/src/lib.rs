//! Lurus DB - Tenant-scoped data access
//!
//! SQLx-based repositories for tenants, users, subscriptions and credentials,
//! plus an in-memory implementation of the same traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use lurus_db::{create_pool, run_migrations, Store};
//! use lurus_types::TenantId;
//!
//! let pool = create_pool("postgres://localhost/lurus").await?;
//! run_migrations(&pool).await?;
//! let store = Store::postgres(pool);
//!
//! // Request handlers only ever see their own tenant's rows
//! let db = store.for_tenant(TenantId::new("acme"));
//! let user = db.find_user_by_username("alice").await?;
//! ```

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod pool;
pub mod repo;
pub mod scope;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use models::*;
pub use pool::{create_pool, create_pool_with_options, run_migrations, DbPool, PoolOptions};
pub use repo::*;
pub use scope::TenantScope;
pub use store::{Store, TenantDb};
