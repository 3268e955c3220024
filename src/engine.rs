//! The per-session exchange simulator (C1).
//!
//! One engine process owns the authoritative portfolio, accounts, orders,
//! impacts and convictions for exactly one `(user_id, session_id)` binding.
//! All state lives behind a single coordinator task; the gRPC surface talks
//! to it through a bounded command channel, which is what makes a minute tick
//! atomic without explicit transactions.

pub mod accounts;
pub mod coordinator;
pub mod execution;
pub mod pipeline;
pub mod portfolio;
pub mod replay;
pub mod service;
pub mod state;
pub mod watchdog;

pub use coordinator::{EngineCoordinator, EngineHandle};
pub use state::EngineState;
