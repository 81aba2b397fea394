//! Upstream account model and the schedulable-account registry.
//!
//! The registry is a snapshot reader: callers get `Arc<Account>` views
//! filtered by group, platform and model support. Transient unscheduling
//! windows (rate-limited, overloaded, per-model) live on the account as
//! epoch-ms atomics so writers publish atomically and readers never block.

pub mod account;
pub mod registry;

pub use {
    account::{Account, Platform},
    registry::{AccountSource, SnapshotFilter, StaticRegistry},
};
