use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tonic::async_trait;

use crate::error::{OrchestratorError, SimdeskResult};

/// Everything the orchestrator needs to launch one simulator pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    pub grpc_port: u16,
}

/// Opaque reference to a launched pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub phase: PodPhase,
    pub ip: Option<String>,
    pub ports: Vec<u16>,
}

/// The four container-orchestrator verbs this subsystem is allowed to use.
/// Everything beyond start/stop/read/list belongs to the platform team.
#[async_trait]
pub trait ContainerApi: Send + Sync + 'static {
    async fn start(&self, spec: PodSpec) -> SimdeskResult<PodRef>;

    async fn stop(&self, pod: &PodRef) -> SimdeskResult<()>;

    async fn read(&self, pod: &PodRef) -> SimdeskResult<PodInfo>;

    async fn list(&self, label_selector: &str) -> SimdeskResult<Vec<PodRef>>;
}

/// In-memory container API for tests and single-node runs.
///
/// Supports injecting a number of start failures to exercise the backoff
/// path.
#[derive(Default)]
pub struct InMemoryContainerApi {
    pods: Mutex<HashMap<String, PodSpec>>,
    fail_next_starts: AtomicU32,
}

impl InMemoryContainerApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.fail_next_starts.store(count, Ordering::SeqCst);
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().unwrap().len()
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.pods.lock().unwrap().contains_key(name)
    }

    /// Registers a pod behind the orchestrator's back, as a crashed-and-
    /// restarted control plane would find it.
    pub fn inject_pod(&self, spec: PodSpec) {
        self.pods.lock().unwrap().insert(spec.name.clone(), spec);
    }
}

#[async_trait]
impl ContainerApi for InMemoryContainerApi {
    async fn start(&self, spec: PodSpec) -> SimdeskResult<PodRef> {
        let remaining = self.fail_next_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(
                OrchestratorError::Container("injected start failure".to_string()).into(),
            );
        }
        let name = spec.name.clone();
        self.pods.lock().unwrap().insert(name.clone(), spec);
        Ok(PodRef { name })
    }

    async fn stop(&self, pod: &PodRef) -> SimdeskResult<()> {
        self.pods.lock().unwrap().remove(&pod.name);
        Ok(())
    }

    async fn read(&self, pod: &PodRef) -> SimdeskResult<PodInfo> {
        let pods = self.pods.lock().unwrap();
        match pods.get(&pod.name) {
            Some(spec) => Ok(PodInfo {
                phase: PodPhase::Running,
                ip: Some("10.0.0.1".to_string()),
                ports: vec![spec.grpc_port],
            }),
            None => Ok(PodInfo {
                phase: PodPhase::Unknown,
                ip: None,
                ports: Vec::new(),
            }),
        }
    }

    async fn list(&self, label_selector: &str) -> SimdeskResult<Vec<PodRef>> {
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|spec| {
                wanted
                    .iter()
                    .all(|(k, v)| spec.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|spec| PodRef {
                name: spec.name.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(name: &str, exch: &str) -> PodSpec {
        PodSpec {
            name: name.to_string(),
            image: "simdesk/simulator:latest".to_string(),
            labels: HashMap::from([
                ("app".to_string(), "simdesk-simulator".to_string()),
                ("exch".to_string(), exch.to_string()),
            ]),
            env: vec![],
            grpc_port: 50060,
        }
    }

    #[tokio::test]
    async fn start_read_stop_roundtrip() {
        let api = InMemoryContainerApi::new();
        let pod = api.start(spec("sim-a", "a")).await.unwrap();
        assert_eq!(api.read(&pod).await.unwrap().phase, PodPhase::Running);

        api.stop(&pod).await.unwrap();
        assert_eq!(api.read(&pod).await.unwrap().phase, PodPhase::Unknown);
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let api = InMemoryContainerApi::new();
        api.start(spec("sim-a", "a")).await.unwrap();
        api.start(spec("sim-b", "b")).await.unwrap();

        let all = api.list("app=simdesk-simulator").await.unwrap();
        assert_eq!(all.len(), 2);
        let only_a = api.list("app=simdesk-simulator,exch=a").await.unwrap();
        assert_eq!(only_a, vec![PodRef { name: "sim-a".to_string() }]);
    }

    #[tokio::test]
    async fn injected_failures_consume() {
        let api = InMemoryContainerApi::new();
        api.fail_next_starts(1);
        assert!(api.start(spec("sim-a", "a")).await.is_err());
        assert!(api.start(spec("sim-a", "a")).await.is_ok());
    }
}
