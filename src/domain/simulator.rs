use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::{SessionId, SimulatorId, UserId};

/// Lifecycle of a simulator pod.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulatorStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SimulatorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// The control-plane record of one simulator instance.
///
/// While the owning session is ACTIVE, `session_id` is 1:1 with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulator {
    pub simulator_id: SimulatorId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub endpoint: String,
    pub status: SimulatorStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub termination_reason: Option<String>,
}

impl Simulator {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        endpoint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            simulator_id: SimulatorId::generate(),
            session_id,
            user_id,
            endpoint: endpoint.into(),
            status: SimulatorStatus::Creating,
            created_at: now,
            last_active: now,
            termination_reason: None,
        }
    }
}
