//! Durable tenant store
//!
//! Tenant configuration and per-item watermarks live in a single SQLite
//! database. Opening the store creates the schema, imports tables left by
//! older deployments, and upgrades any credential not yet stored as a hash.

mod models;
mod sqlite;

pub use models::{NotificationMode, Readiness, TenantConfig, TenantEdit, TenantSetup, Watermark};
pub use sqlite::{MigrationReport, StoreConfig, TenantStore};
