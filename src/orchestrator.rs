//! The exchange-schedule-driven control plane (C3).
//!
//! Owns the mapping from exchange to simulator pod, starts and stops pods by
//! exchange calendar and reconciles drift against the container API.

pub mod calendar;
pub mod container;
pub mod control;

pub use container::{ContainerApi, PodInfo, PodPhase, PodRef, PodSpec};
pub use control::ControlLoop;
