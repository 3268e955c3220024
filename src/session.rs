//! The session core (C2).
//!
//! Terminates the client WebSocket, enforces the one-active-(user, device)
//! binding, proxies the simulator's exchange stream to the socket and relays
//! heartbeats in both directions.

pub mod manager;
pub mod protocol;
pub mod simulator_ops;
pub mod socket;
pub mod stream;

pub use manager::SessionManager;
pub use simulator_ops::{SimulatorOps, SimulatorProvisioner, SimulatorRequestStatus};
