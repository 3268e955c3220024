use tonic::async_trait;

use crate::{
    domain::{UserId, simulator::{Simulator, SimulatorStatus}},
    error::{GatewayError, SimdeskResult, TransportError},
    gateway::GatewayState,
    generated::simdesk::v1::{self as pb, exchange_simulator_client::ExchangeSimulatorClient},
    storage::DatabaseGateway as _,
};

/// gRPC forwarding surface toward a user's simulator pod.
#[async_trait]
pub trait SimulatorRouter: Send + Sync + 'static {
    async fn submit_order(
        &self,
        endpoint: &str,
        request: pb::SubmitOrderRequest,
    ) -> SimdeskResult<pb::SubmitOrderResponse>;

    async fn cancel_order(
        &self,
        endpoint: &str,
        request: pb::CancelOrderRequest,
    ) -> SimdeskResult<pb::CancelOrderResponse>;

    async fn submit_convictions(
        &self,
        endpoint: &str,
        request: pb::SubmitConvictionRequest,
    ) -> SimdeskResult<pb::SubmitConvictionResponse>;
}

/// tonic-backed router used in production.
pub struct GrpcSimulatorRouter;

impl GrpcSimulatorRouter {
    async fn client(
        endpoint: &str,
    ) -> SimdeskResult<ExchangeSimulatorClient<tonic::transport::Channel>> {
        ExchangeSimulatorClient::connect(endpoint.to_string())
            .await
            .map_err(|e| TransportError::Grpc(e).into())
    }
}

#[async_trait]
impl SimulatorRouter for GrpcSimulatorRouter {
    async fn submit_order(
        &self,
        endpoint: &str,
        request: pb::SubmitOrderRequest,
    ) -> SimdeskResult<pb::SubmitOrderResponse> {
        let mut client = Self::client(endpoint).await?;
        Ok(client
            .submit_order(request)
            .await
            .map_err(TransportError::Status)?
            .into_inner())
    }

    async fn cancel_order(
        &self,
        endpoint: &str,
        request: pb::CancelOrderRequest,
    ) -> SimdeskResult<pb::CancelOrderResponse> {
        let mut client = Self::client(endpoint).await?;
        Ok(client
            .cancel_order(request)
            .await
            .map_err(TransportError::Status)?
            .into_inner())
    }

    async fn submit_convictions(
        &self,
        endpoint: &str,
        request: pb::SubmitConvictionRequest,
    ) -> SimdeskResult<pb::SubmitConvictionResponse> {
        let mut client = Self::client(endpoint).await?;
        Ok(client
            .submit_conviction(request)
            .await
            .map_err(TransportError::Status)?
            .into_inner())
    }
}

/// Finds the caller's running simulator, or fails with NOT_FOUND /
/// UNAVAILABLE shaped errors.
pub async fn resolve_simulator(
    state: &GatewayState,
    user_id: &UserId,
) -> SimdeskResult<Simulator> {
    let simulator = state
        .storage
        .simulator_for_user(user_id)
        .await?
        .ok_or_else(|| GatewayError::NoSession(user_id.to_string()))?;
    if simulator.status != SimulatorStatus::Running {
        return Err(GatewayError::Downstream(format!(
            "simulator {} is {}",
            simulator.simulator_id, simulator.status
        ))
        .into());
    }
    Ok(simulator)
}
