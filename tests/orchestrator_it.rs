//! Exchange-calendar-driven pod lifecycle.

mod common;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use simdesk::{
    config::OrchestratorConfig,
    orchestrator::{ControlLoop, container::InMemoryContainerApi},
    storage::{ExchangeRecord, memory::MemoryGateway},
};

fn exchange(exch_id: &str) -> ExchangeRecord {
    ExchangeRecord {
        exch_id: exch_id.to_string(),
        timezone: "America/New_York".to_string(),
        pre_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        post_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
    }
}

fn ny_utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    // 2026-03-02 is EST (UTC-5).
    Utc.with_ymd_and_hms(2026, 3, 2, h + 5, m, s).unwrap()
}

#[tokio::test]
async fn pods_follow_the_exchange_session() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.seed_exchanges(vec![exchange("us_equity")]).await;
    let containers = Arc::new(InMemoryContainerApi::new());
    let cfg = OrchestratorConfig {
        start_backoff: Duration::from_millis(1),
        sweep_probability: 0.0,
        ..OrchestratorConfig::default()
    };
    let mut control = ControlLoop::new(cfg, gateway.clone(), containers.clone());

    // 09:29:50 local: before pre-open, no pod.
    control.tick(ny_utc(9, 29, 50)).await.unwrap();
    assert_eq!(containers.pod_count(), 0);

    // 09:30:05 local: pod up within one cycle.
    control.tick(ny_utc(9, 30, 5)).await.unwrap();
    assert!(containers.has_pod("sim-us_equity"));

    // 16:00:05 local: torn down within one cycle.
    control.tick(ny_utc(16, 0, 5)).await.unwrap();
    assert_eq!(containers.pod_count(), 0);
}

#[tokio::test]
async fn multiple_exchanges_converge_independently() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut tokyo = exchange("jp_equity");
    tokyo.timezone = "Asia/Tokyo".to_string();
    gateway
        .seed_exchanges(vec![exchange("us_equity"), tokyo])
        .await;
    let containers = Arc::new(InMemoryContainerApi::new());
    let cfg = OrchestratorConfig {
        start_backoff: Duration::from_millis(1),
        sweep_probability: 0.0,
        ..OrchestratorConfig::default()
    };
    let mut control = ControlLoop::new(cfg, gateway, containers.clone());

    // Noon in New York is the middle of the night in Tokyo.
    control.tick(ny_utc(12, 0, 0)).await.unwrap();
    assert!(containers.has_pod("sim-us_equity"));
    assert!(!containers.has_pod("sim-jp_equity"));
}

#[tokio::test]
async fn removed_exchange_is_swept() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.seed_exchanges(vec![exchange("us_equity")]).await;
    let containers = Arc::new(InMemoryContainerApi::new());
    let cfg = OrchestratorConfig {
        start_backoff: Duration::from_millis(1),
        sweep_probability: 0.0,
        ..OrchestratorConfig::default()
    };
    let mut control = ControlLoop::new(cfg, gateway.clone(), containers.clone());
    control.tick(ny_utc(12, 0, 0)).await.unwrap();
    assert_eq!(containers.pod_count(), 1);

    // Exchange disappears from the DB: the sweep removes its pod.
    gateway.seed_exchanges(vec![]).await;
    control.sweep(&[]).await.unwrap();
    assert_eq!(containers.pod_count(), 0);

    // And the next cycle does not resurrect it.
    control.tick(ny_utc(12, 1, 0)).await.unwrap();
    assert_eq!(containers.pod_count(), 0);
}
