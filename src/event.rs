//! Events delivered to the application.
//!
//! Every client, master and server owns one bounded event queue. Producers
//! never wait on it: when the application falls behind, new events are
//! dropped, counted and logged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::command::{CommandId, CommandOutcome};
use crate::file_transfer::FileEntry;
use crate::link::LinkState;
use crate::types::{Asdu, DataPoint};

/// Events emitted by clients, masters and servers.
#[derive(Debug, Clone)]
pub enum Event {
    /// Transport connected (TCP socket or serial port open)
    Opened {
        /// Remote address or port name
        peer: String,
    },
    /// Data transfer active (STARTDT confirmed, or serial link usable)
    Activated,
    /// Data transfer stopped (STOPDT confirmed)
    Deactivated,
    /// Connection closed
    Closed {
        /// Why the connection ended
        reason: String,
    },
    /// Connection attempt failed; `terminal` once the retry budget is spent.
    ///
    /// On 101, `slave` names a link that went offline.
    Failed {
        slave: Option<u8>,
        reason: String,
        terminal: bool,
    },
    /// A retry is scheduled
    Reconnecting {
        slave: Option<u8>,
        attempt: u32,
        reason: String,
    },
    /// Monitoring data
    DataReceived(Vec<DataPoint>),
    /// ASDU that carries no data points and was not consumed internally
    AsduReceived {
        /// Sending peer, server side only
        peer: Option<SocketAddr>,
        asdu: Asdu,
    },
    /// A submitted command finished
    CommandConfirmed {
        id: CommandId,
        outcome: CommandOutcome,
    },
    /// Directory listing complete
    FileListReceived { files: Vec<FileEntry> },
    /// File download complete
    FileReceived { name: u16, ioa: u32, bytes: Bytes },
    /// File download or listing aborted
    FileTransferFailed { name: u16, reason: String },
    /// 101 slave link state changed
    SlaveStateChanged { slave: u8, state: LinkState },
    /// Server accepted a client
    PeerConnected { peer: SocketAddr },
    /// Server peer sent STARTDT
    PeerActivated { peer: SocketAddr },
    /// Server peer sent STOPDT
    PeerDeactivated { peer: SocketAddr },
    /// Server peer went away
    PeerDisconnected { peer: SocketAddr, reason: String },
}

/// Non-blocking producer side of the event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Create an event queue holding at most `capacity` undelivered events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue an event, dropping it when the queue is full.
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, ?event, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Event receiver gone");
            }
        }
    }

    /// Number of events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
