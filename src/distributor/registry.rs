use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::async_trait;
use tracing::{info, warn};

use crate::{
    domain::bar::MinuteBar,
    error::{DistributorError, SimdeskResult, TransportError},
    generated::simdesk::v1::{self as pb, market_data_feed_client::MarketDataFeedClient},
};

const DEFAULT_FEED_PORT: u16 = 50060;

/// Transport used to reach a downstream simulator's feed.
#[async_trait]
pub trait FeedPusher: Send + Sync + 'static {
    /// Cheap reachability probe used at registration time.
    async fn probe(&self, endpoint: &str) -> SimdeskResult<()>;

    async fn push(&self, endpoint: &str, batch: pb::MinuteBarBatch) -> SimdeskResult<()>;
}

/// tonic-backed pusher used in production.
pub struct GrpcFeedPusher;

#[async_trait]
impl FeedPusher for GrpcFeedPusher {
    async fn probe(&self, endpoint: &str) -> SimdeskResult<()> {
        MarketDataFeedClient::connect(endpoint.to_string())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Grpc(e).into())
    }

    async fn push(&self, endpoint: &str, batch: pb::MinuteBarBatch) -> SimdeskResult<()> {
        let mut client = MarketDataFeedClient::connect(endpoint.to_string())
            .await
            .map_err(TransportError::Grpc)?;
        client
            .publish_bars(batch)
            .await
            .map_err(TransportError::Status)?;
        Ok(())
    }
}

/// In-memory set of registered downstream simulators.
///
/// Registration probes the host and refuses unreachable ones; push failures
/// afterwards are logged but never remove the downstream.
pub struct Registry {
    pusher: Arc<dyn FeedPusher>,
    downstreams: RwLock<HashMap<String, String>>,
}

impl Registry {
    pub fn new(pusher: Arc<dyn FeedPusher>) -> Self {
        Self {
            pusher,
            downstreams: RwLock::new(HashMap::new()),
        }
    }

    pub fn endpoint_for(host: &str, port: Option<u16>) -> String {
        format!("http://{host}:{}", port.unwrap_or(DEFAULT_FEED_PORT))
    }

    pub async fn register(&self, host: &str, port: Option<u16>) -> SimdeskResult<()> {
        let endpoint = Self::endpoint_for(host, port);
        self.pusher.probe(&endpoint).await.map_err(|err| {
            warn!(host, error = %err, "registration probe failed");
            DistributorError::Unreachable(host.to_string())
        })?;
        self.downstreams
            .write()
            .await
            .insert(host.to_string(), endpoint);
        info!(host, "downstream registered");
        Ok(())
    }

    pub async fn unregister(&self, host: &str) -> SimdeskResult<()> {
        if self.downstreams.write().await.remove(host).is_none() {
            return Err(DistributorError::NotRegistered(host.to_string()).into());
        }
        info!(host, "downstream unregistered");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.downstreams.read().await.len()
    }

    /// Pushes the batch to all registered downstreams concurrently.
    pub async fn broadcast(&self, bars: &[MinuteBar]) {
        let batch = pb::MinuteBarBatch {
            bars: bars.iter().map(pb::MarketDataBar::from).collect(),
        };
        let targets: Vec<(String, String)> = self
            .downstreams
            .read()
            .await
            .iter()
            .map(|(host, endpoint)| (host.clone(), endpoint.clone()))
            .collect();

        let pushes = targets.into_iter().map(|(host, endpoint)| {
            let pusher = self.pusher.clone();
            let batch = batch.clone();
            async move {
                if let Err(err) = pusher.push(&endpoint, batch).await {
                    warn!(host, error = %err, "bar push failed, keeping downstream");
                }
            }
        });
        join_all(pushes).await;
    }
}
