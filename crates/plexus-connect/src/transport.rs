// ABOUTME: gRPC channel creation and per-channel runtime settings.
// ABOUTME: Provides configurable channel builder for plexus connections.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::ConnectorError;
use crate::outbound::DEFAULT_CHANNEL_BUFFER;

/// Configuration for gRPC channel keep-alive behavior.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between keep-alive pings when the connection is idle.
    pub interval: Duration,
    /// Timeout waiting for keep-alive response before considering connection dead.
    pub timeout: Duration,
    /// Whether to send keep-alive pings even when no streams are active.
    pub while_idle: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(20),
            while_idle: true,
        }
    }
}

/// Configuration for creating a gRPC channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server address to connect to (e.g., "http://localhost:8124").
    pub address: String,
    /// Keep-alive configuration. If None, keep-alive is disabled.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Connection timeout.
    pub connect_timeout: Option<Duration>,
}

impl ChannelConfig {
    /// Create a channel config with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into().trim().to_string(),
            keep_alive: Some(KeepAliveConfig::default()),
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Disable keep-alive.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    /// Set custom keep-alive configuration.
    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Create a gRPC channel with the specified configuration.
///
/// Keep-alive is important for long-lived streaming connections to detect
/// dead peers and prevent connection resets from load balancers.
pub async fn create_channel(config: &ChannelConfig) -> Result<Channel, ConnectorError> {
    let mut endpoint = Endpoint::from_shared(config.address.clone())
        .map_err(|e| ConnectorError::InvalidAddress(e.to_string()))?;

    if let Some(ka) = &config.keep_alive {
        endpoint = endpoint
            .http2_keep_alive_interval(ka.interval)
            .keep_alive_timeout(ka.timeout)
            .keep_alive_while_idle(ka.while_idle);
    }

    if let Some(timeout) = config.connect_timeout {
        endpoint = endpoint.connect_timeout(timeout);
    }

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

    tracing::debug!(
        address = %config.address,
        keep_alive = config.keep_alive.is_some(),
        "gRPC channel connected"
    );

    Ok(channel)
}

/// Runtime settings shared by the command and query channels.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Number of inbound permits granted to the server when a stream opens.
    pub permits: u64,
    /// Permits consumed before an additional grant of this size is sent.
    pub permits_batch: u64,
    /// Delay between reconnect attempts after a transport failure.
    pub reconnect_interval: Duration,
    /// Capacity of the outbound frame buffer per stream.
    pub outbound_buffer: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            permits: 5000,
            permits_batch: 1250,
            reconnect_interval: Duration::from_secs(2),
            outbound_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl ConnectorSettings {
    /// Set the inbound permit budget and refill batch.
    pub fn with_permits(mut self, permits: u64, permits_batch: u64) -> Self {
        self.permits = permits;
        self.permits_batch = permits_batch;
        self
    }

    /// Set the delay between reconnect attempts.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the outbound frame buffer capacity.
    pub fn with_outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity;
        self
    }
}
