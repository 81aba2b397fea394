//! Shared plumbing for the ferry workspace: epoch-time utilities used by
//! slot and RPM key layouts.

pub mod time;
