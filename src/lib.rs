// === Public Modules (The Canonical Paths) ===
pub mod breaker;
pub mod config;
pub mod distributor;
pub mod domain;
pub mod engine;
pub mod error;
pub mod external;
pub mod gateway;
pub mod generated;
pub mod orchestrator;
pub mod session;
pub mod storage;

// === Shared internals ===
mod macros;
pub mod sorted_vec_map;
pub mod telemetry;

// === Convenience ===
pub use crate::error::{SimdeskError, SimdeskResult};
