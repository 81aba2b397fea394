//! Shared concurrency state: slot counters with bounded wait queues,
//! sticky session bindings, and per-minute request counters.
//!
//! Everything is exposed through traits so the gateway can be tested
//! against in-memory implementations and a networked store can be
//! substituted without touching callers.

pub mod rpm;
pub mod slots;
pub mod sticky;

pub use {
    rpm::RpmCounters,
    slots::{AcquireError, MemorySlotStore, Scope, SlotPermit, SlotStore},
    sticky::{MemoryStickyStore, StickyStore},
};
