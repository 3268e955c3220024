//! End-to-end flows through the simulator's gRPC surface.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tonic::Request;
use tokio_stream::StreamExt;

use common::{TestExchange, bar};
use simdesk::{
    domain::{SessionId, UserId, simulator::{Simulator, SimulatorStatus}},
    engine::watchdog::{TtlWatchdog, WatchdogVerdict},
    generated::simdesk::v1::{self as pb, exchange_simulator_server::ExchangeSimulator},
    storage::{DatabaseGateway, memory::MemoryGateway},
};

fn order_request(quantity: f64, request_id: &str) -> pb::SubmitOrderRequest {
    pb::SubmitOrderRequest {
        session_id: "s1".to_string(),
        symbol: "AAPL".to_string(),
        side: "BUY".to_string(),
        order_type: "MARKET".to_string(),
        quantity,
        price: 0.0,
        request_id: request_id.to_string(),
    }
}

#[tokio::test]
async fn happy_path_order_fills_and_streams() {
    let gateway = Arc::new(MemoryGateway::new());
    let exchange = TestExchange::spawn("s1", "u1", gateway.clone());

    let mut stream = exchange
        .service
        .stream_exchange_data(Request::new(pb::StreamRequest {
            session_id: "s1".to_string(),
            symbols: vec!["AAPL".to_string()],
        }))
        .await
        .unwrap()
        .into_inner();

    exchange.feed(bar("AAPL", 100.0, 30)).await;
    let first_frame = stream.next().await.unwrap().unwrap();
    assert_eq!(first_frame.update_id, 1);

    let response = exchange
        .service
        .submit_order(Request::new(order_request(10.0, "r1")))
        .await
        .unwrap()
        .into_inner();
    assert!(response.success, "{}", response.error_message);
    let order_id = response.order_id;
    assert!(!order_id.is_empty());

    // Position and cash reflect the fill on the next frame.
    exchange.feed(bar("AAPL", 100.0, 31)).await;
    let frame = stream.next().await.unwrap().unwrap();
    let portfolio = frame.portfolio.unwrap();
    let position = portfolio
        .positions
        .iter()
        .find(|p| p.symbol == "AAPL")
        .expect("AAPL position");
    assert_eq!(position.quantity, 10.0);
    assert!((portfolio.cash_balance - 99_000.0).abs() < 1e-6);
    let order = frame
        .orders_data
        .iter()
        .find(|o| o.order_id == order_id)
        .expect("filled order in frame");
    assert_eq!(order.status, "FILLED");
    assert_eq!(order.filled_quantity, 10.0);

    // Every fill produced its cash-flow records.
    assert!(gateway.cash_flow_count().await > 0);
}

#[tokio::test]
async fn idempotent_replay_returns_identical_response() {
    let gateway = Arc::new(MemoryGateway::new());
    let exchange = TestExchange::spawn("s1", "u1", gateway);
    exchange.feed(bar("AAPL", 100.0, 30)).await;

    let first = exchange
        .service
        .submit_order(Request::new(order_request(10.0, "r1")))
        .await
        .unwrap()
        .into_inner();
    let replay = exchange
        .service
        .submit_order(Request::new(order_request(10.0, "r1")))
        .await
        .unwrap()
        .into_inner();

    assert!(first.success && replay.success);
    assert_eq!(first.order_id, replay.order_id);

    // Portfolio unchanged by the replay: still 10 shares.
    let snapshot = exchange.handle.portfolio_snapshot().await.unwrap();
    assert_eq!(snapshot.positions[0].quantity, 10.0);

    // Same request id with a different payload is refused.
    let conflicting = exchange
        .service
        .submit_order(Request::new(order_request(11.0, "r1")))
        .await
        .unwrap()
        .into_inner();
    assert!(!conflicting.success);
    assert!(conflicting.error_message.contains("request id"));
}

#[tokio::test]
async fn cancel_is_idempotent_through_the_rpc() {
    let gateway = Arc::new(MemoryGateway::new());
    let exchange = TestExchange::spawn("s1", "u1", gateway);
    exchange.feed(bar("AAPL", 100.0, 30)).await;

    let limit = pb::SubmitOrderRequest {
        order_type: "LIMIT".to_string(),
        price: 90.0,
        ..order_request(5.0, "r-limit")
    };
    let submitted = exchange
        .service
        .submit_order(Request::new(limit))
        .await
        .unwrap()
        .into_inner();
    assert!(submitted.success);

    for _ in 0..2 {
        let canceled = exchange
            .service
            .cancel_order(Request::new(pb::CancelOrderRequest {
                session_id: "s1".to_string(),
                order_id: submitted.order_id.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(canceled.success);
    }
}

#[tokio::test]
async fn conviction_batch_generates_orders_and_decision_log() {
    let gateway = Arc::new(MemoryGateway::new());
    let exchange = TestExchange::spawn("s1", "u1", gateway);
    exchange.feed(bar("AAPL", 100.0, 30)).await;
    exchange.feed(bar("MSFT", 200.0, 31)).await;

    let response = exchange
        .service
        .submit_conviction(Request::new(pb::SubmitConvictionRequest {
            session_id: "s1".to_string(),
            convictions: vec![
                pb::ConvictionItem {
                    conviction_id: "c1".to_string(),
                    symbol: "AAPL".to_string(),
                    target_weight: 0.05,
                    target_notional: 0.0,
                    score: 0.0,
                    urgency: "HIGH".to_string(),
                },
                pb::ConvictionItem {
                    conviction_id: "c2".to_string(),
                    symbol: "MSFT".to_string(),
                    target_weight: 0.04,
                    target_notional: 0.0,
                    score: 0.0,
                    urgency: "LOW".to_string(),
                },
            ],
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.results.len(), 2);
    for result in &response.results {
        assert!(result.success, "{}", result.error_message);
        assert_eq!(result.order_ids.len(), 1);
    }
    // The decision log is ordered: alpha entries precede generator entries.
    let alpha_idx = response
        .decision_log
        .iter()
        .position(|l| l.starts_with("alpha:"))
        .unwrap();
    let generator_idx = response
        .decision_log
        .iter()
        .position(|l| l.starts_with("generator:"))
        .unwrap();
    assert!(alpha_idx < generator_idx);

    // Orders landed in the portfolio.
    let snapshot = exchange.handle.portfolio_snapshot().await.unwrap();
    assert_eq!(snapshot.positions.len(), 2);
}

#[tokio::test]
async fn ttl_expiry_stops_simulator_and_allows_replacement() {
    let gateway = Arc::new(MemoryGateway::new());
    let exchange = TestExchange::spawn("s1", "u1", gateway.clone());

    let simulator = Simulator::new(
        SessionId::from("s1"),
        UserId::from("u1"),
        "http://127.0.0.1:50060",
        chrono::Utc::now(),
    );
    gateway.upsert_simulator(&simulator).await.unwrap();

    let watchdog = TtlWatchdog::new(
        exchange.handle.clone(),
        gateway.clone(),
        simulator.simulator_id.clone(),
        Duration::ZERO,
        Duration::from_millis(5),
        exchange.shutdown.clone(),
    );
    assert_eq!(watchdog.run().await.unwrap(), WatchdogVerdict::TtlExpired);

    let stored = gateway
        .simulator(&simulator.simulator_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SimulatorStatus::Stopped);
    assert!(stored.termination_reason.unwrap().contains("TTL"));

    // The record is terminal, so a new start allocates a fresh pod.
    assert!(
        gateway
            .simulator_for_user(&UserId::from("u1"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn heartbeat_round_trip() {
    let gateway = Arc::new(MemoryGateway::new());
    let exchange = TestExchange::spawn("s1", "u1", gateway);

    let response = exchange
        .service
        .heartbeat(Request::new(pb::HeartbeatRequest {
            session_id: "s1".to_string(),
            client_timestamp_ms: 42,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.ok);
    assert!(response.server_timestamp_ms > 0);
    assert!(exchange.handle.idle_ms() < 1_000);
}
