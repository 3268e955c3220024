use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{domain::session::ConnectionQuality, generated::simdesk::v1 as pb};

/// WebSocket close code sent to a socket displaced by a newer device.
pub const CLOSE_CONNECTION_REPLACED: u16 = 4000;

/// Messages a client may send, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Reconnect {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: i64,
        #[serde(rename = "latencyMs", default)]
        latency_ms: i64,
        #[serde(rename = "missedHeartbeats", default)]
        missed_heartbeats: u32,
        #[serde(rename = "connectionType", default)]
        connection_type: String,
    },
    SessionInfo,
    StopSession,
    StartSimulator,
    StopSimulator,
}

/// Messages the server emits, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "podName")]
        pod_name: String,
        timestamp: i64,
    },
    HeartbeatAck {
        timestamp: i64,
        #[serde(rename = "clientTimestamp")]
        client_timestamp: i64,
        quality: ConnectionQuality,
        #[serde(rename = "reconnectRecommended")]
        reconnect_recommended: bool,
    },
    SessionInfo {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "simulatorStatus")]
        simulator_status: Option<String>,
        #[serde(rename = "createdAt")]
        created_at: i64,
    },
    SimulatorStatus {
        status: String,
        endpoint: Option<String>,
    },
    ExchangeData {
        #[serde(flatten)]
        frame: ExchangeDataPayload,
    },
    ConnectionReplaced {
        message: String,
        #[serde(rename = "newDeviceInfo", skip_serializing_if = "Option::is_none")]
        new_device_info: Option<Value>,
        timestamp: i64,
    },
    Timeout {
        message: String,
        timestamp: i64,
    },
    Shutdown {
        message: String,
        timestamp: i64,
    },
    Error {
        error: String,
        #[serde(rename = "errorCode")]
        error_code: String,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

/// JSON mirror of the gRPC `ExchangeDataUpdate` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDataPayload {
    #[serde(rename = "updateId")]
    pub update_id: u64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    #[serde(rename = "marketData")]
    pub market_data: Vec<BarPayload>,
    #[serde(rename = "ordersData")]
    pub orders_data: Vec<OrderPayload>,
    pub portfolio: Option<PortfolioPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarPayload {
    pub symbol: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub quantity: f64,
    pub price: f64,
    pub status: String,
    #[serde(rename = "filledQuantity")]
    pub filled_quantity: f64,
    #[serde(rename = "averagePrice")]
    pub average_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPayload {
    #[serde(rename = "cashBalance")]
    pub cash_balance: f64,
    #[serde(rename = "totalValue")]
    pub total_value: f64,
    pub positions: Vec<PositionPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPayload {
    pub symbol: String,
    pub quantity: f64,
    #[serde(rename = "averageCost")]
    pub average_cost: f64,
    #[serde(rename = "marketValue")]
    pub market_value: f64,
}

impl From<pb::ExchangeDataUpdate> for ExchangeDataPayload {
    fn from(frame: pb::ExchangeDataUpdate) -> Self {
        Self {
            update_id: frame.update_id,
            timestamp_ms: frame.timestamp_ms,
            market_data: frame
                .market_data
                .into_iter()
                .map(|bar| BarPayload {
                    symbol: bar.symbol,
                    timestamp: bar.timestamp_utc_ms,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    vwap: bar.vwap,
                })
                .collect(),
            orders_data: frame
                .orders_data
                .into_iter()
                .map(|order| OrderPayload {
                    order_id: order.order_id,
                    symbol: order.symbol,
                    side: order.side,
                    order_type: order.order_type,
                    quantity: order.quantity,
                    price: order.price,
                    status: order.status,
                    filled_quantity: order.filled_quantity,
                    average_price: order.average_price,
                })
                .collect(),
            portfolio: frame.portfolio.map(|p| PortfolioPayload {
                cash_balance: p.cash_balance,
                total_value: p.total_value,
                positions: p
                    .positions
                    .into_iter()
                    .map(|pos| PositionPayload {
                        symbol: pos.symbol,
                        quantity: pos.quantity,
                        average_cost: pos.average_cost,
                        market_value: pos.market_value,
                    })
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_messages_parse_by_type_tag() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"heartbeat","timestamp":123,"latencyMs":45,"missedHeartbeats":0,"connectionType":"wifi"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Heartbeat {
                timestamp: 123,
                latency_ms: 45,
                missed_heartbeats: 0,
                connection_type: "wifi".to_string(),
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"start_simulator"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartSimulator);
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn connection_replaced_serializes_device_info() {
        let msg = ServerMessage::ConnectionReplaced {
            message: "Your connection has been replaced by a new device".to_string(),
            new_device_info: Some(serde_json::json!({"deviceId": "d2"})),
            timestamp: 1,
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "connection_replaced");
        assert_eq!(encoded["newDeviceInfo"]["deviceId"], "d2");
    }

    #[test]
    fn exchange_frame_converts_to_payload() {
        let frame = pb::ExchangeDataUpdate {
            update_id: 7,
            timestamp_ms: 1_000,
            market_data: vec![pb::MarketDataBar {
                symbol: "AAPL".into(),
                timestamp_utc_ms: 1_000,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 100.0,
                vwap: 1.2,
            }],
            orders_data: vec![],
            portfolio: None,
        };
        let payload = ExchangeDataPayload::from(frame);
        assert_eq!(payload.update_id, 7);
        assert_eq!(payload.market_data[0].symbol, "AAPL");

        let msg = ServerMessage::ExchangeData { frame: payload };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "exchange_data");
        assert_eq!(encoded["updateId"], 7);
    }
}
