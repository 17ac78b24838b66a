use crate::cli::TransportKind;
use crate::device::SimulatedFleet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod loopback;
pub mod tcp;

pub use loopback::LoopbackTransport;
pub use tcp::{serve_fleet, TcpBrokerClient, TcpTransport};

/// One direct-method call addressed to a device (or a module on it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRequest {
    pub device_id: String,
    pub module_id: Option<String>,
    pub method_name: String,
    /// Request body; `None` when no payload is attached
    pub payload: Option<Vec<u8>>,
}

/// Status and body returned by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl MethodResponse {
    pub const SUCCESS: u16 = 200;
    pub const NOT_FOUND: u16 = 404;

    /// Build a response whose body is the serialized JSON value
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string().into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }

    /// Parse the body as JSON
    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("transport is not open")]
    NotOpen,

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("transport was not open")]
    NotOpen,

    #[error("failed to close transport: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport state for tracking connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connected,
    Disconnected,
}

/// Connection used by one device loop to issue direct-method calls
///
/// Each device loop owns its transport for the whole run, so calls on one
/// transport are never concurrent.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Open the logical connection to the broker
    async fn open(&mut self) -> Result<(), ConnectError>;

    /// Perform one call, giving up after `timeout`
    async fn invoke(
        &mut self,
        request: &MethodRequest,
        timeout: Duration,
    ) -> Result<MethodResponse, InvokeError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), CloseError>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}

/// Source of per-device transports for the orchestrator
pub trait TransportProvider: Send + Sync {
    fn create(&self, device_id: &str) -> Box<dyn RpcTransport>;

    /// Label echoed in the run summary
    fn label(&self) -> String {
        "custom".to_string()
    }
}

/// Connection settings for the TCP broker
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    /// Upper bound on establishing a connection to the broker
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::HOST.to_string(),
            port: crate::defaults::PORT,
            buffer_size: 8192,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
        }
    }
}

impl TransportConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Transport factory for creating per-device transport instances
#[derive(Clone)]
pub enum TransportFactory {
    Loopback(Arc<SimulatedFleet>),
    Tcp(TransportConfig),
}

impl TransportProvider for TransportFactory {
    fn create(&self, _device_id: &str) -> Box<dyn RpcTransport> {
        match self {
            TransportFactory::Loopback(fleet) => Box::new(LoopbackTransport::new(fleet.clone())),
            TransportFactory::Tcp(config) => Box::new(TcpTransport::new(config.clone())),
        }
    }

    fn label(&self) -> String {
        match self {
            TransportFactory::Loopback(_) => TransportKind::Loopback.to_string(),
            TransportFactory::Tcp(config) => {
                format!("{} ({})", TransportKind::Tcp, config.address())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_helpers() {
        let ok = MethodResponse::json(200, &serde_json::json!({ "response-data": "invoked" }));
        assert!(ok.is_success());
        assert_eq!(ok.body_json().unwrap()["response-data"], "invoked");

        let garbage = MethodResponse {
            status: 200,
            body: b"not json".to_vec(),
        };
        assert!(garbage.is_success());
        assert!(garbage.body_json().is_err());

        let missing = MethodResponse::json(MethodResponse::NOT_FOUND, &serde_json::Value::Null);
        assert!(!missing.is_success());
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.address(), "127.0.0.1:8080");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_factory_label_and_transports() {
        let fleet = Arc::new(SimulatedFleet::with_devices(1));
        let loopback = TransportFactory::Loopback(fleet);
        assert_eq!(loopback.label(), "Loopback");
        assert_eq!(loopback.create("sim-device-000").name(), "loopback");

        let tcp = TransportFactory::Tcp(TransportConfig::default());
        assert_eq!(tcp.label(), "TCP (127.0.0.1:8080)");
        assert_eq!(tcp.create("any").name(), "tcp");
    }
}
