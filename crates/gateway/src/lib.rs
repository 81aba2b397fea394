//! The request-admission-and-dispatch gateway.
//!
//! One inbound request flows: validate → admit user slot → select account →
//! admit account slot → forward upstream → classify failures and fail over,
//! or relay the response and submit a usage-recording task. WebSocket
//! sessions take the same first-turn path, then re-enter admission for
//! every subsequent turn.

pub mod admission;
pub mod auth;
pub mod classify;
pub mod context;
pub mod dispatch;
pub mod emit;
pub mod errors;
pub mod server;
pub mod state;
pub mod usage;
pub mod validate;
pub mod ws;

pub use {
    server::{build_app, serve},
    state::AppState,
};
