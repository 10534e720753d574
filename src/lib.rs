//! Herald - announces Ghost posts into Discord channels
//!
//! Herald polls each tenant's Ghost site on a fixed cadence, works out which
//! posts are new or updated since the last successful announcement, and posts
//! one embed per item to the tenant's Discord channel. Watermarks are committed
//! only after Discord accepted the message, so restarts never re-announce the
//! back catalog and never silently drop an item.
//!
//! # Architecture
//!
//! - **store**: Tenant configuration and per-item watermarks (SQLite)
//! - **credentials**: Hashed credentials at rest, bounded plaintext cache in memory
//! - **source**: Content source boundary and the Ghost Content API client
//! - **notify**: Destination boundary and the Discord REST notifier
//! - **sync**: Reconciler, dispatcher, cycle engine and the scheduler daemon
//! - **admin**: Tenant setup, edits and discovery for a command layer
//! - **server**: Health, metrics and manual-trigger HTTP endpoint
//! - **config**: YAML process configuration

// Core modules
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;

// Collaborators
pub mod credentials;
pub mod notify;
pub mod source;
pub mod store;

// Scheduler and command layer
pub mod admin;
pub mod server;
pub mod sync;

// Re-exports
pub use error::{ErrorKind, HeraldError, Result};
