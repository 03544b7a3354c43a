use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::trace;

use sockswatch_config::Config;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Cannot probe invalid port {0}")]
    InvalidPort(u16),
}

/// Result of a single reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Open,
    Closed,
}

/// A TCP reachability check against a local port.
///
/// Refused connections and timeouts are `Closed`, never errors. Implementations
/// must return within a bounded time.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self, port: u16) -> Result<PortStatus, ProbeError>;
}

/// Connect-and-close probe: only the TCP handshake is exercised.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.probe_host.as_deref().unwrap_or("127.0.0.1"),
            Duration::from_millis(config.probe_timeout_ms.unwrap_or(2000)),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, port: u16) -> Result<PortStatus, ProbeError> {
        if port == 0 {
            return Err(ProbeError::InvalidPort(port));
        }
        let connect = TcpStream::connect((self.host.as_str(), port));
        let status = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => PortStatus::Open,
            Ok(Err(e)) => {
                trace!(port, "Probe refused: {}", e);
                PortStatus::Closed
            }
            Err(_) => {
                trace!(port, "Probe timed out after {:?}", self.timeout);
                PortStatus::Closed
            }
        };
        Ok(status)
    }
}
