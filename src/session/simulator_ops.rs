use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::Mutex;
use tonic::async_trait;
use tracing::{info, warn};

use crate::{
    domain::{
        SessionId, SimulatorId, UserId,
        simulator::{Simulator, SimulatorStatus},
    },
    error::{SessionError, SimdeskResult},
    session::stream::SimulatorLink,
    storage::DatabaseGateway,
};

const READINESS_POLL: Duration = Duration::from_millis(500);

/// Progress of a `start_simulator` request, tracked per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulatorRequestStatus {
    None,
    Checking,
    Creating,
    Starting,
    Initializing,
    Running,
    Error,
}

impl SimulatorRequestStatus {
    fn in_progress(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::Creating | Self::Starting | Self::Initializing
        )
    }
}

/// What a start request produced.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The simulator is up and ready.
    Ready(Simulator),
    /// Another request is already driving the start; here is where it stands.
    InProgress(SimulatorRequestStatus),
}

/// Allocates and tears down simulator pods. Backed by the orchestrator in
/// production, by in-process fakes in tests.
#[async_trait]
pub trait SimulatorProvisioner: Send + Sync + 'static {
    async fn provision(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> SimdeskResult<Simulator>;

    async fn teardown(&self, simulator_id: &SimulatorId) -> SimdeskResult<()>;
}

/// Simulator lifecycle coordination for the session pod.
///
/// Start requests collapse onto one pod creation: the per-user status is
/// checked and flipped under one lock, so concurrent `start_simulator`
/// messages during a start observe `InProgress` instead of racing a second
/// provision call.
pub struct SimulatorOps {
    gateway: Arc<dyn DatabaseGateway>,
    provisioner: Arc<dyn SimulatorProvisioner>,
    link: Arc<dyn SimulatorLink>,
    start_timeout: Duration,
    statuses: Mutex<HashMap<UserId, SimulatorRequestStatus>>,
}

impl SimulatorOps {
    pub fn new(
        gateway: Arc<dyn DatabaseGateway>,
        provisioner: Arc<dyn SimulatorProvisioner>,
        link: Arc<dyn SimulatorLink>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            provisioner,
            link,
            start_timeout,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub async fn request_status(&self, user_id: &UserId) -> SimulatorRequestStatus {
        self.statuses
            .lock()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(SimulatorRequestStatus::None)
    }

    /// Ensures a running simulator for the session.
    pub async fn start_simulator(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> SimdeskResult<StartOutcome> {
        {
            let mut statuses = self.statuses.lock().await;
            let current = statuses
                .get(user_id)
                .copied()
                .unwrap_or(SimulatorRequestStatus::None);
            if current.in_progress() {
                return Ok(StartOutcome::InProgress(current));
            }
            statuses.insert(user_id.clone(), SimulatorRequestStatus::Checking);
        }

        match self.drive_start(session_id, user_id).await {
            Ok(simulator) => {
                self.set_status(user_id, SimulatorRequestStatus::Running).await;
                Ok(StartOutcome::Ready(simulator))
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "simulator start failed");
                self.set_status(user_id, SimulatorRequestStatus::Error).await;
                Err(err)
            }
        }
    }

    async fn drive_start(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> SimdeskResult<Simulator> {
        // Reuse a live pod when one is already bound to this user.
        if let Some(existing) = self.gateway.simulator_for_user(user_id).await?
            && existing.status == SimulatorStatus::Running
            && self
                .link
                .heartbeat(&existing.endpoint, session_id)
                .await
                .is_ok()
        {
            info!(simulator_id = %existing.simulator_id, "reusing running simulator");
            return Ok(existing);
        }

        self.set_status(user_id, SimulatorRequestStatus::Creating).await;
        let mut simulator = self.provisioner.provision(session_id, user_id).await?;
        simulator.status = SimulatorStatus::Starting;
        self.gateway.upsert_simulator(&simulator).await?;

        self.set_status(user_id, SimulatorRequestStatus::Starting).await;
        self.await_readiness(session_id, &simulator.endpoint, user_id)
            .await?;

        simulator.status = SimulatorStatus::Running;
        simulator.last_active = Utc::now();
        self.gateway.upsert_simulator(&simulator).await?;
        info!(simulator_id = %simulator.simulator_id, endpoint = %simulator.endpoint, "simulator running");
        Ok(simulator)
    }

    async fn await_readiness(
        &self,
        session_id: &SessionId,
        endpoint: &str,
        user_id: &UserId,
    ) -> SimdeskResult<()> {
        self.set_status(user_id, SimulatorRequestStatus::Initializing)
            .await;
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            if self.link.heartbeat(endpoint, session_id).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(
                    SessionError::SimulatorStartTimeout(self.start_timeout.as_secs()).into(),
                );
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }

    /// Stops the user's simulator, recording `reason` on the instance.
    pub async fn stop_simulator(&self, user_id: &UserId, reason: &str) {
        self.set_status(user_id, SimulatorRequestStatus::None).await;
        let simulator = match self.gateway.simulator_for_user(user_id).await {
            Ok(Some(simulator)) => simulator,
            Ok(None) => return,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "simulator lookup failed during stop");
                return;
            }
        };

        if let Err(err) = self.provisioner.teardown(&simulator.simulator_id).await {
            warn!(simulator_id = %simulator.simulator_id, error = %err, "simulator teardown failed");
        }
        if let Err(err) = self
            .gateway
            .mark_simulator_stopped(&simulator.simulator_id, reason)
            .await
        {
            warn!(simulator_id = %simulator.simulator_id, error = %err, "failed to mark simulator stopped");
        }
    }

    async fn set_status(&self, user_id: &UserId, status: SimulatorRequestStatus) {
        self.statuses.lock().await.insert(user_id.clone(), status);
    }
}

/// Provisioner that launches per-session pods straight through the container
/// API, the way the session pod owns its simulators in production.
pub struct PodProvisioner {
    containers: Arc<dyn crate::orchestrator::ContainerApi>,
    image: String,
    grpc_port: u16,
}

impl PodProvisioner {
    pub fn new(
        containers: Arc<dyn crate::orchestrator::ContainerApi>,
        image: impl Into<String>,
        grpc_port: u16,
    ) -> Self {
        Self {
            containers,
            image: image.into(),
            grpc_port,
        }
    }
}

impl PodProvisioner {
    fn pod_name(simulator_id: &SimulatorId) -> String {
        let prefix = &simulator_id.0[..simulator_id.0.len().min(8)];
        format!("sim-sess-{prefix}")
    }
}

#[async_trait]
impl SimulatorProvisioner for PodProvisioner {
    async fn provision(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> SimdeskResult<Simulator> {
        use crate::orchestrator::PodSpec;

        let mut simulator = Simulator::new(session_id.clone(), user_id.clone(), "", Utc::now());
        let spec = PodSpec {
            name: Self::pod_name(&simulator.simulator_id),
            image: self.image.clone(),
            labels: std::collections::HashMap::from([
                ("app".to_string(), "simdesk-simulator".to_string()),
                ("session".to_string(), session_id.to_string()),
            ]),
            env: vec![
                ("SESSION_ID".to_string(), session_id.to_string()),
                ("USER_ID".to_string(), user_id.to_string()),
            ],
            grpc_port: self.grpc_port,
        };
        let pod = self.containers.start(spec).await?;
        let info = self.containers.read(&pod).await?;
        let host = info.ip.unwrap_or_else(|| pod.name.clone());
        simulator.endpoint = format!("http://{host}:{}", self.grpc_port);
        Ok(simulator)
    }

    async fn teardown(&self, simulator_id: &SimulatorId) -> SimdeskResult<()> {
        use crate::orchestrator::PodRef;

        self.containers
            .stop(&PodRef {
                name: Self::pod_name(simulator_id),
            })
            .await
    }
}
