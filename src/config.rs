//! Connection configuration.
//!
//! Plain structs with consuming builder setters. Every config is checked by
//! `validate()` before any I/O happens.

use std::time::Duration;

use crate::error::{Iec60870Error, Result};
use crate::types::SEQ_MODULUS;

/// Default IEC 104 port.
pub const DEFAULT_PORT: u16 = 2404;

/// Default T0 timeout (connection establishment / link reset).
pub const DEFAULT_T0: Duration = Duration::from_secs(30);

/// Default T1 timeout (send or test confirmation).
pub const DEFAULT_T1: Duration = Duration::from_secs(15);

/// Default T2 timeout (acknowledge without data / 101 repeat spacing).
pub const DEFAULT_T2: Duration = Duration::from_secs(10);

/// Default T3 timeout (test frame on idle).
pub const DEFAULT_T3: Duration = Duration::from_secs(20);

/// Default K parameter (max unconfirmed I-frames).
pub const DEFAULT_K: u16 = 12;

/// Default W parameter (max unconfirmed receives before sending S-frame).
pub const DEFAULT_W: u16 = 8;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default command queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Default capacity of the event delivery queue.
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1000;

/// Default time to wait for a command confirmation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time a file transfer may stall before it is aborted.
pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Failed attempts against one address before switching to the other.
pub const DEFAULT_FAILOVER_AFTER: u32 = 3;

/// Default serial baud rate (8E1 framing).
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default 101 link address.
pub const DEFAULT_LINK_ADDRESS: u8 = 1;

/// Default number of 101 retransmissions before a slave goes offline.
pub const DEFAULT_LINK_RETRIES: u32 = 3;

/// Default connection limit of the 104 server.
pub const DEFAULT_MAX_CLIENTS: usize = 10;

/// Reconnect policy: fixed delay, optional attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each retry
    pub delay: Duration,
    /// Retries after the initial attempt, `None` retries forever
    pub max_retries: Option<u32>,
}

impl ReconnectPolicy {
    /// Retry forever with the given delay.
    pub const fn forever(delay: Duration) -> Self {
        Self {
            delay,
            max_retries: None,
        }
    }

    /// Retry at most `max_retries` times.
    pub const fn limited(delay: Duration, max_retries: u32) -> Self {
        Self {
            delay,
            max_retries: Some(max_retries),
        }
    }

    /// Check whether retry number `attempt` (1-based) is within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt <= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::forever(DEFAULT_RECONNECT_DELAY)
    }
}

/// 104 transport parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    /// K parameter: max unconfirmed I-frames
    pub k: u16,
    /// W parameter: max unconfirmed receives before sending S-frame
    pub w: u16,
    /// T0: connection establishment
    pub t0: Duration,
    /// T1: send or test APDU confirmation
    pub t1: Duration,
    /// T2: acknowledge when no data is sent
    pub t2: Duration,
    /// T3: test frame after idle
    pub t3: Duration,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            w: DEFAULT_W,
            t0: DEFAULT_T0,
            t1: DEFAULT_T1,
            t2: DEFAULT_T2,
            t3: DEFAULT_T3,
        }
    }
}

impl TransportParams {
    /// Validate window sizes and timers.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k >= SEQ_MODULUS {
            return Err(Iec60870Error::config(format!(
                "k must be in 1..={}, got {}",
                SEQ_MODULUS - 1,
                self.k
            )));
        }
        if self.w == 0 || self.w > self.k {
            return Err(Iec60870Error::config(format!(
                "w must be in 1..=k ({}), got {}",
                self.k, self.w
            )));
        }
        validate_timers(self.t0, self.t1, self.t2)?;
        if self.t3.is_zero() {
            return Err(Iec60870Error::config("t3 must be positive"));
        }
        Ok(())
    }
}

fn validate_timers(t0: Duration, t1: Duration, t2: Duration) -> Result<()> {
    if t0.is_zero() || t1.is_zero() || t2.is_zero() {
        return Err(Iec60870Error::config("t0, t1, t2 must be positive"));
    }
    if t2 >= t1 {
        return Err(Iec60870Error::config(format!(
            "t2 ({:?}) must be shorter than t1 ({:?})",
            t2, t1
        )));
    }
    Ok(())
}

fn validate_reconnect(reconnect: &Option<ReconnectPolicy>) -> Result<()> {
    match reconnect {
        Some(policy) if policy.delay.is_zero() => {
            Err(Iec60870Error::config("reconnect delay must be positive"))
        }
        _ => Ok(()),
    }
}

fn validate_queues(queue_size: usize, event_queue_size: usize) -> Result<()> {
    if queue_size == 0 {
        return Err(Iec60870Error::config("queue size must be positive"));
    }
    if event_queue_size == 0 {
        return Err(Iec60870Error::config("event queue size must be positive"));
    }
    Ok(())
}

/// 104 client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub address: String,
    /// Optional reserve server address (host:port)
    pub reserve_address: Option<String>,
    /// Originator address put into every ASDU
    pub originator: u8,
    /// Default common address for commands without station address
    pub common_address: u16,
    /// Transport parameters
    pub params: TransportParams,
    /// Reconnect policy, `None` never retries
    pub reconnect: Option<ReconnectPolicy>,
    /// Consecutive failures before switching between primary and reserve
    pub failover_after: u32,
    /// Command queue capacity
    pub queue_size: usize,
    /// Time to wait for each command confirmation
    pub command_timeout: Duration,
    /// File transfer stall timeout
    pub file_timeout: Duration,
    /// Event delivery queue capacity
    pub event_queue_size: usize,
    /// Send STARTDT automatically after every (re)connect
    pub auto_start_dt: bool,
}

impl ClientConfig {
    /// Create a new configuration with the given address.
    ///
    /// An address without port gets [`DEFAULT_PORT`].
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: with_default_port(address.into()),
            reserve_address: None,
            originator: 0,
            common_address: 1,
            params: TransportParams::default(),
            reconnect: Some(ReconnectPolicy::default()),
            failover_after: DEFAULT_FAILOVER_AFTER,
            queue_size: DEFAULT_QUEUE_SIZE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            file_timeout: DEFAULT_FILE_TIMEOUT,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            auto_start_dt: true,
        }
    }

    /// Set the reserve address.
    pub fn reserve_address(mut self, address: impl Into<String>) -> Self {
        self.reserve_address = Some(with_default_port(address.into()));
        self
    }

    /// Set the originator address.
    pub fn originator(mut self, originator: u8) -> Self {
        self.originator = originator;
        self
    }

    /// Set the default common address.
    pub fn common_address(mut self, common_address: u16) -> Self {
        self.common_address = common_address;
        self
    }

    /// Set all transport parameters.
    pub fn params(mut self, params: TransportParams) -> Self {
        self.params = params;
        self
    }

    /// Set K and W.
    pub fn window(mut self, k: u16, w: u16) -> Self {
        self.params.k = k;
        self.params.w = w;
        self
    }

    /// Set T0 timeout.
    pub fn t0(mut self, timeout: Duration) -> Self {
        self.params.t0 = timeout;
        self
    }

    /// Set T1 timeout.
    pub fn t1(mut self, timeout: Duration) -> Self {
        self.params.t1 = timeout;
        self
    }

    /// Set T2 timeout.
    pub fn t2(mut self, timeout: Duration) -> Self {
        self.params.t2 = timeout;
        self
    }

    /// Set T3 timeout.
    pub fn t3(mut self, timeout: Duration) -> Self {
        self.params.t3 = timeout;
        self
    }

    /// Set the reconnect policy, `None` to never retry.
    pub fn reconnect(mut self, policy: Option<ReconnectPolicy>) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the number of failures before switching address.
    pub fn failover_after(mut self, attempts: u32) -> Self {
        self.failover_after = attempts;
        self
    }

    /// Set the command queue capacity.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the command confirmation timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the file transfer stall timeout.
    pub fn file_timeout(mut self, timeout: Duration) -> Self {
        self.file_timeout = timeout;
        self
    }

    /// Set the event queue capacity.
    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    /// Enable or disable automatic STARTDT.
    pub fn auto_start_dt(mut self, enabled: bool) -> Self {
        self.auto_start_dt = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Iec60870Error::config("address must not be empty"));
        }
        if matches!(&self.reserve_address, Some(reserve) if reserve.trim().is_empty()) {
            return Err(Iec60870Error::config("reserve address must not be empty"));
        }
        self.params.validate()?;
        validate_reconnect(&self.reconnect)?;
        if self.failover_after == 0 {
            return Err(Iec60870Error::config("failover_after must be positive"));
        }
        validate_queues(self.queue_size, self.event_queue_size)?;
        if self.command_timeout.is_zero() || self.file_timeout.is_zero() {
            return Err(Iec60870Error::config(
                "command and file timeouts must be positive",
            ));
        }
        Ok(())
    }
}

fn with_default_port(address: String) -> String {
    if address.is_empty() || address.contains(':') {
        address
    } else {
        format!("{}:{}", address, DEFAULT_PORT)
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity
    None,
    /// Even parity (IEC 60870-5-101 default)
    #[default]
    Even,
    /// Odd parity
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// 101 link transmission procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// The master polls any number of slaves
    #[default]
    Unbalanced,
    /// Point to point, either station may initiate
    Balanced,
}

/// 101 master configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port name (e.g. "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Parity (8 data bits, 1 stop bit)
    pub parity: Parity,
    /// Unbalanced polling or balanced point to point
    pub mode: LinkMode,
    /// Initial slaves; also the default link address for commands
    pub link_addresses: Vec<u8>,
    /// Originator address put into every ASDU
    pub originator: u8,
    /// Common address for commands without station address
    pub common_address: u16,
    /// T0: link reset timeout
    pub t0: Duration,
    /// T1: reply timeout
    pub t1: Duration,
    /// T2: minimum spacing between polls of one slave, or the idle time
    /// before a test function on a balanced link
    pub t2: Duration,
    /// Retransmissions before a slave goes offline
    pub link_retries: u32,
    /// Reconnect policy for the port itself
    pub reconnect: Option<ReconnectPolicy>,
    /// Command queue capacity
    pub queue_size: usize,
    /// Time to wait for each command confirmation
    pub command_timeout: Duration,
    /// Event delivery queue capacity
    pub event_queue_size: usize,
}

impl SerialConfig {
    /// Create a new configuration with the given port and baud rate.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            parity: Parity::Even,
            mode: LinkMode::Unbalanced,
            link_addresses: vec![DEFAULT_LINK_ADDRESS],
            originator: 0,
            common_address: 1,
            t0: DEFAULT_T0,
            t1: DEFAULT_T1,
            t2: DEFAULT_T2,
            link_retries: DEFAULT_LINK_RETRIES,
            reconnect: Some(ReconnectPolicy::default()),
            queue_size: DEFAULT_QUEUE_SIZE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }

    /// Set parity.
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the link transmission procedure.
    pub fn mode(mut self, mode: LinkMode) -> Self {
        self.mode = mode;
        self
    }

    /// Poll a single slave at this link address.
    pub fn link_address(mut self, address: u8) -> Self {
        self.link_addresses = vec![address];
        self
    }

    /// Poll these slaves; the first one is the default for commands.
    pub fn link_addresses(mut self, addresses: impl IntoIterator<Item = u8>) -> Self {
        self.link_addresses = addresses.into_iter().collect();
        self
    }

    /// Set the originator address.
    pub fn originator(mut self, originator: u8) -> Self {
        self.originator = originator;
        self
    }

    /// Set the common address.
    pub fn common_address(mut self, common_address: u16) -> Self {
        self.common_address = common_address;
        self
    }

    /// Set T0 timeout.
    pub fn t0(mut self, timeout: Duration) -> Self {
        self.t0 = timeout;
        self
    }

    /// Set T1 timeout.
    pub fn t1(mut self, timeout: Duration) -> Self {
        self.t1 = timeout;
        self
    }

    /// Set T2 timeout.
    pub fn t2(mut self, timeout: Duration) -> Self {
        self.t2 = timeout;
        self
    }

    /// Set the number of retransmissions.
    pub fn link_retries(mut self, retries: u32) -> Self {
        self.link_retries = retries;
        self
    }

    /// Set the reconnect policy, `None` to never retry.
    pub fn reconnect(mut self, policy: Option<ReconnectPolicy>) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the command queue capacity.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the command confirmation timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the event queue capacity.
    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    /// Default link address for commands.
    pub fn default_link_address(&self) -> u8 {
        self.link_addresses.first().copied().unwrap_or(DEFAULT_LINK_ADDRESS)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Iec60870Error::config("serial port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(Iec60870Error::config("baud rate must be positive"));
        }
        if self.link_addresses.contains(&0) {
            return Err(Iec60870Error::config("link address must be in 1..=255"));
        }
        if self.mode == LinkMode::Balanced && self.link_addresses.len() != 1 {
            return Err(Iec60870Error::config(
                "balanced link needs exactly one link address",
            ));
        }
        validate_timers(self.t0, self.t1, self.t2)?;
        validate_reconnect(&self.reconnect)?;
        validate_queues(self.queue_size, self.event_queue_size)?;
        if self.command_timeout.is_zero() {
            return Err(Iec60870Error::config("command timeout must be positive"));
        }
        Ok(())
    }
}

/// 104 server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// Listening port (0 picks a free port)
    pub port: u16,
    /// Station identifier, used as common address of outgoing ASDUs
    pub station_id: u16,
    /// Originator address put into outgoing ASDUs
    pub originator: u8,
    /// Transport parameters
    pub params: TransportParams,
    /// Maximum simultaneous clients
    pub max_clients: usize,
    /// Per-peer outbound queue capacity
    pub queue_size: usize,
    /// Event delivery queue capacity
    pub event_queue_size: usize,
}

impl ServerConfig {
    /// Create a new configuration listening on all interfaces.
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port,
            station_id: 1,
            originator: 0,
            params: TransportParams::default(),
            max_clients: DEFAULT_MAX_CLIENTS,
            queue_size: DEFAULT_QUEUE_SIZE,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }

    /// Set the bind address.
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the station identifier.
    pub fn station_id(mut self, station_id: u16) -> Self {
        self.station_id = station_id;
        self
    }

    /// Set the originator address.
    pub fn originator(mut self, originator: u8) -> Self {
        self.originator = originator;
        self
    }

    /// Set all transport parameters.
    pub fn params(mut self, params: TransportParams) -> Self {
        self.params = params;
        self
    }

    /// Set the client limit.
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Set the per-peer queue capacity.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the event queue capacity.
    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    /// `bind_address:port` string.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.trim().is_empty() {
            return Err(Iec60870Error::config("bind address must not be empty"));
        }
        self.params.validate()?;
        if self.max_clients == 0 {
            return Err(Iec60870Error::config("max_clients must be positive"));
        }
        validate_queues(self.queue_size, self.event_queue_size)
    }
}
