//! Connection management shared by the 104 client and the 101 master.
//!
//! A [`Connector`] opens the byte stream (TCP socket or serial port); the
//! [`RetryBudget`] decides whether and when the next attempt happens.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectPolicy, SerialConfig};

/// Outer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected, no attempt scheduled
    #[default]
    Disconnected,
    /// Waiting for the reconnect delay
    Reconnecting,
    /// Attempt in progress
    Connecting,
    /// Byte stream open, data transfer not active
    Connected,
    /// Data transfer active
    Activated,
}

impl ConnectionState {
    /// Check whether commands may be submitted.
    pub fn is_activated(&self) -> bool {
        *self == Self::Activated
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Activated => "activated",
        };
        f.write_str(name)
    }
}

/// Opens the byte stream of a connection.
pub trait Connector: Send + 'static {
    /// Stream type produced by a successful attempt
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Make one connection attempt.
    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Called when the caller gave up on an attempt that never completed.
    fn attempt_timed_out(&mut self) {}

    /// Address or port name the next attempt goes to.
    fn describe(&self) -> String;
}

/// TCP connector with optional reserve address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    primary: String,
    reserve: Option<String>,
    failover_after: u32,
    failures: u32,
    on_reserve: bool,
}

impl TcpConnector {
    /// Connector for `primary`, switching to `reserve` after `failover_after`
    /// consecutive failures.
    pub fn new(primary: impl Into<String>, reserve: Option<String>, failover_after: u32) -> Self {
        Self {
            primary: primary.into(),
            reserve,
            failover_after: failover_after.max(1),
            failures: 0,
            on_reserve: false,
        }
    }

    /// Connector for a client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.address.clone(),
            config.reserve_address.clone(),
            config.failover_after,
        )
    }

    fn current(&self) -> &str {
        match (&self.reserve, self.on_reserve) {
            (Some(reserve), true) => reserve,
            _ => &self.primary,
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        if self.reserve.is_some() && self.failures >= self.failover_after {
            self.on_reserve = !self.on_reserve;
            self.failures = 0;
            info!(address = %self.current(), "Switching to alternate address");
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        let address = self.current().to_string();
        debug!(%address, "Connecting");
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                // Disable Nagle's algorithm for low latency
                stream.set_nodelay(true).ok();
                self.failures = 0;
                Ok(stream)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn attempt_timed_out(&mut self) {
        debug!(address = %self.current(), "Connect attempt timed out");
        self.record_failure();
    }

    fn describe(&self) -> String {
        self.current().to_string()
    }
}

/// Serial port connector, 8 data bits and 1 stop bit.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    parity: tokio_serial::Parity,
}

impl SerialConnector {
    /// Connector for a master configuration.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            parity: config.parity.into(),
        }
    }
}

impl Connector for SerialConnector {
    type Stream = SerialStream;

    async fn connect(&mut self) -> io::Result<SerialStream> {
        let builder = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(self.parity);

        builder.open_native_async().map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("failed to open serial port {}: {}", self.port, e),
            )
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }
}

/// Retry bookkeeping for one connection identity.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: Option<ReconnectPolicy>,
    retries: u32,
}

impl RetryBudget {
    /// Budget for `policy`; `None` never retries.
    pub fn new(policy: Option<ReconnectPolicy>) -> Self {
        Self { policy, retries: 0 }
    }

    /// Number of the attempt currently running, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Record a failure; returns the retry number and delay if another
    /// attempt is allowed.
    pub fn next_retry(&mut self) -> Option<(u32, Duration)> {
        let policy = self.policy?;
        let retry = self.retries + 1;
        if !policy.allows(retry) {
            warn!(retries = self.retries, "Retry budget exhausted");
            return None;
        }
        self.retries = retry;
        Some((retry, policy.delay))
    }

    /// Start over after a connection reached `Activated`.
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_limited() {
        let mut budget =
            RetryBudget::new(Some(ReconnectPolicy::limited(Duration::from_millis(10), 3)));
        assert_eq!(budget.attempt(), 1);
        assert_eq!(budget.next_retry(), Some((1, Duration::from_millis(10))));
        assert_eq!(budget.next_retry(), Some((2, Duration::from_millis(10))));
        assert_eq!(budget.next_retry(), Some((3, Duration::from_millis(10))));
        assert_eq!(budget.attempt(), 4);
        assert_eq!(budget.next_retry(), None);

        budget.reset();
        assert_eq!(budget.next_retry(), Some((1, Duration::from_millis(10))));
    }

    #[test]
    fn test_retry_budget_forever_and_never() {
        let mut budget = RetryBudget::new(Some(ReconnectPolicy::forever(Duration::from_secs(1))));
        for _ in 0..100 {
            assert!(budget.next_retry().is_some());
        }

        let mut budget = RetryBudget::new(None);
        assert_eq!(budget.next_retry(), None);
    }

    #[test]
    fn test_tcp_failover_alternates() {
        let mut connector =
            TcpConnector::new("10.0.0.1:2404", Some("10.0.0.2:2404".to_string()), 2);
        assert_eq!(connector.describe(), "10.0.0.1:2404");

        connector.record_failure();
        assert_eq!(connector.describe(), "10.0.0.1:2404");
        connector.record_failure();
        assert_eq!(connector.describe(), "10.0.0.2:2404");
        connector.record_failure();
        connector.record_failure();
        assert_eq!(connector.describe(), "10.0.0.1:2404");
    }

    #[test]
    fn test_tcp_timeouts_count_toward_failover() {
        let mut connector =
            TcpConnector::new("10.0.0.1:2404", Some("10.0.0.2:2404".to_string()), 2);
        connector.attempt_timed_out();
        assert_eq!(connector.describe(), "10.0.0.1:2404");
        connector.attempt_timed_out();
        assert_eq!(connector.describe(), "10.0.0.2:2404");
    }

    #[test]
    fn test_tcp_without_reserve_stays() {
        let mut connector = TcpConnector::new("10.0.0.1:2404", None, 1);
        for _ in 0..5 {
            connector.record_failure();
        }
        assert_eq!(connector.describe(), "10.0.0.1:2404");
    }

    #[tokio::test]
    async fn test_tcp_connect_refused_counts_failure() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut connector = TcpConnector::new(address.clone(), Some("127.0.0.1:1".into()), 1);
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.describe(), "127.0.0.1:1");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Activated.to_string(), "activated");
        assert!(ConnectionState::Activated.is_activated());
        assert!(!ConnectionState::Connected.is_activated());
    }
}
