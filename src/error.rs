//! Error types for the IEC 60870-5 protocol engine.

use thiserror::Error;

use crate::file_transfer::FileTransferError;

/// Result type alias for IEC 60870-5 operations.
pub type Result<T> = std::result::Result<T, Iec60870Error>;

/// Coarse classification used to decide how far a fault escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection-level fault, triggers the reconnect policy
    Transport,
    /// Peer violated the protocol, connection is reset
    Protocol,
    /// Local to a single command
    Command,
    /// Local to a file transfer session
    FileTransfer,
    /// Rejected before any I/O
    Configuration,
}

/// IEC 60870-5 protocol error types.
#[derive(Debug, Error)]
pub enum Iec60870Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected to remote
    #[error("Not connected")]
    NotConnected,

    /// Connection or link reset timeout (t0)
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// T1 timeout (no acknowledgment or confirmation)
    #[error("T1 timeout: no confirmation received")]
    T1Timeout,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid frame format
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// FT1.2 checksum mismatch
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Received send sequence number differs from V(R)
    #[error("Sequence number mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u16, actual: u16 },

    /// Acknowledgment for an I-frame that was never sent
    #[error("Acknowledgment {ack} outside window (acked {acked}, V(S) {send_seq})")]
    InvalidAck { ack: u16, acked: u16, send_seq: u16 },

    /// Unknown type identifier
    #[error("Unknown type ID: {0}")]
    UnknownTypeId(u8),

    /// Unknown cause of transmission
    #[error("Unknown cause of transmission: {0}")]
    UnknownCot(u8),

    /// Truncated or inconsistent ASDU
    #[error("Malformed ASDU: {0}")]
    Malformed(String),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Too many unacknowledged I-frames
    #[error("Send window full (K={0})")]
    WindowFull(u16),

    /// Command queue capacity exceeded
    #[error("Command queue full (capacity {0})")]
    QueueFull(usize),

    /// Command cannot be encoded
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// File transfer failure
    #[error("File transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl Iec60870Error {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid frame error.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Create a malformed ASDU error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid command error.
    pub fn invalid_command(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection(_)
            | Self::NotConnected
            | Self::ConnectionTimeout
            | Self::Io(_)
            | Self::T1Timeout
            | Self::ChannelClosed => ErrorClass::Transport,
            Self::Protocol(_)
            | Self::InvalidFrame(_)
            | Self::ChecksumMismatch { .. }
            | Self::SequenceMismatch { .. }
            | Self::InvalidAck { .. }
            | Self::UnknownTypeId(_)
            | Self::UnknownCot(_)
            | Self::Malformed(_)
            | Self::Codec(_) => ErrorClass::Protocol,
            Self::WindowFull(_) | Self::QueueFull(_) | Self::InvalidCommand(_) => {
                ErrorClass::Command
            }
            Self::FileTransfer(_) => ErrorClass::FileTransfer,
            Self::Config(_) => ErrorClass::Configuration,
        }
    }

    /// Check if this error indicates a connection problem.
    pub fn is_connection_error(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    /// Check if this error tears the connection down and feeds the reconnect policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport | ErrorClass::Protocol)
            && !self.is_recoverable_decode()
    }

    /// Decode errors that are logged and skipped instead of resetting the connection.
    pub fn is_recoverable_decode(&self) -> bool {
        matches!(self, Self::UnknownTypeId(_) | Self::UnknownCot(_))
    }
}

impl From<tokio_serial::Error> for Iec60870Error {
    fn from(err: tokio_serial::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
