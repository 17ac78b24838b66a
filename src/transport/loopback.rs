use super::{
    CloseError, ConnectError, InvokeError, MethodRequest, MethodResponse, RpcTransport,
    TransportState,
};
use crate::device::SimulatedFleet;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// In-process transport that hands calls straight to a [`SimulatedFleet`]
pub struct LoopbackTransport {
    fleet: Arc<SimulatedFleet>,
    state: TransportState,
}

impl LoopbackTransport {
    pub fn new(fleet: Arc<SimulatedFleet>) -> Self {
        Self {
            fleet,
            state: TransportState::Uninitialized,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn open(&mut self) -> Result<(), ConnectError> {
        if !self.fleet.is_online() {
            return Err(ConnectError::Unavailable(
                "simulated fleet is offline".to_string(),
            ));
        }
        self.state = TransportState::Connected;
        debug!("Loopback transport opened");
        Ok(())
    }

    async fn invoke(
        &mut self,
        request: &MethodRequest,
        call_timeout: Duration,
    ) -> Result<MethodResponse, InvokeError> {
        if self.state != TransportState::Connected {
            return Err(InvokeError::NotOpen);
        }
        timeout(call_timeout, self.fleet.dispatch(request))
            .await
            .map_err(|_| InvokeError::Timeout(call_timeout))
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if self.state != TransportState::Connected {
            return Err(CloseError::NotOpen);
        }
        self.state = TransportState::Disconnected;
        debug!("Loopback transport closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
