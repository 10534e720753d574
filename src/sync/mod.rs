//! Content synchronization
//!
//! The pipeline for one tenant is fetch → [`reconcile`] → [`Dispatcher`]:
//!
//! - [`reconcile`]: classify a fetched page as new/updated/unchanged, oldest first
//! - [`dispatch`]: send a notification, then commit the item's watermark
//! - [`engine`]: one cycle across tenants, with per-tenant isolation and locks
//! - [`scheduler`]: the timer and manual-trigger daemon around the engine
//! - [`metrics`]: Prometheus counters for cycles and notifications

pub mod dispatch;
pub mod engine;
pub mod locks;
pub mod metrics;
pub mod reconcile;
pub mod scheduler;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::{
    CycleReport, EngineConfig, SyncEngine, TenantFailure, TenantSkip, Trigger, DEFAULT_PAGE_SIZE,
};
pub use locks::TenantLocks;
pub use reconcile::{classify, reconcile, Classification, Classified, Reconciliation};
pub use scheduler::{
    Scheduler, SchedulerCommand, SchedulerConfig, SchedulerEvent, SchedulerHandle,
    DEFAULT_POLL_INTERVAL,
};
