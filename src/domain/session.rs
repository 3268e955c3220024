use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::{DeviceId, SessionId, SimulatorId, UserId, simulator::SimulatorStatus};

/// Lifecycle state of a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Reconnecting,
    Inactive,
    Expired,
    Error,
}

impl SessionStatus {
    /// A live session either holds a socket or is inside its reconnect grace.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Reconnecting)
    }
}

/// Derived connection quality, updated on every client heartbeat.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionQuality {
    Good,
    Degraded,
    Poor,
}

impl ConnectionQuality {
    /// Classifies a heartbeat report.
    ///
    /// POOR when three or more heartbeats were missed (reconnect is
    /// recommended); DEGRADED on any missed heartbeat or latency above
    /// 500 ms; GOOD otherwise.
    pub fn classify(latency_ms: i64, missed_heartbeats: u32) -> (Self, bool) {
        if missed_heartbeats >= 3 {
            (Self::Poor, true)
        } else if missed_heartbeats > 0 || latency_ms > 500 {
            (Self::Degraded, false)
        } else {
            (Self::Good, false)
        }
    }
}

/// Connection quality metrics, derived and non-authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionDetails {
    pub latency_ms: i64,
    pub missed_heartbeats: u32,
    pub reconnect_count: u32,
    pub quality: ConnectionQuality,
}

impl Default for SessionDetails {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            missed_heartbeats: 0,
            reconnect_count: 0,
            quality: ConnectionQuality::Good,
        }
    }
}

/// Explicit session metadata record.
///
/// Every field the platform attaches to a session is enumerated here; there
/// is intentionally no free-form map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub device_id: Option<DeviceId>,
    pub simulator_id: Option<SimulatorId>,
    pub simulator_status: Option<SimulatorStatus>,
    pub simulator_endpoint: Option<String>,
    pub ip_address: Option<String>,
    pub connection_quality: Option<ConnectionQuality>,
    pub heartbeat_latency: Option<i64>,
    pub missed_heartbeats: Option<u32>,
    pub reconnect_count: Option<u32>,
    pub termination_reason: Option<String>,
}

/// A binding of one user (on one device) to one simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub pod_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub details: SessionDetails,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn open(
        user_id: UserId,
        device_id: DeviceId,
        pod_name: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let metadata = SessionMetadata {
            device_id: Some(device_id.clone()),
            ..SessionMetadata::default()
        };
        Self {
            session_id: SessionId::generate(),
            user_id,
            device_id,
            pod_name: pod_name.into(),
            status: SessionStatus::Active,
            created_at: now,
            last_active: now,
            expires_at: now + ttl,
            details: SessionDetails::default(),
            metadata,
        }
    }

    pub fn touch(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.last_active = now;
        self.expires_at = now + ttl;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quality_thresholds() {
        assert_eq!(
            ConnectionQuality::classify(50, 0),
            (ConnectionQuality::Good, false)
        );
        assert_eq!(
            ConnectionQuality::classify(900, 0),
            (ConnectionQuality::Degraded, false)
        );
        assert_eq!(
            ConnectionQuality::classify(50, 1),
            (ConnectionQuality::Degraded, false)
        );
        assert_eq!(
            ConnectionQuality::classify(50, 3),
            (ConnectionQuality::Poor, true)
        );
    }

    #[test]
    fn open_session_is_active_with_ttl() {
        let now = Utc::now();
        let session = Session::open(
            UserId::from("u1"),
            DeviceId::from("d1"),
            "session-pod-0",
            Duration::seconds(120),
            now,
        );
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.expires_at, now + Duration::seconds(120));
        assert_eq!(session.metadata.device_id, Some(DeviceId::from("d1")));
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + Duration::seconds(121)));
    }

    #[test]
    fn touch_extends_expiry() {
        let now = Utc::now();
        let mut session = Session::open(
            UserId::from("u1"),
            DeviceId::from("d1"),
            "pod",
            Duration::seconds(10),
            now,
        );
        let later = now + Duration::seconds(8);
        session.touch(Duration::seconds(10), later);
        assert!(!session.is_expired(now + Duration::seconds(12)));
    }

    #[test]
    fn live_statuses() {
        assert!(SessionStatus::Active.is_live());
        assert!(SessionStatus::Reconnecting.is_live());
        assert!(!SessionStatus::Expired.is_live());
    }
}
