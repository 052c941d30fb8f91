//! # voltage_iec60870
//!
//! IEC 60870-5-101 and IEC 60870-5-104 telecontrol protocol engine.
//!
//! Both profiles share one application layer (ASDU codec, command
//! dispatcher, file transfer) and differ only in transport:
//!
//! - **104**: APCI framing over TCP with the k/w window and t1/t2/t3 timers
//! - **101**: FT1.2 framing over a serial line, either an unbalanced master
//!   polling one or more slave stations or a balanced point to point link
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voltage_iec60870::{ClientConfig, CommandRequest, Event, Iec104Client};
//!
//! #[tokio::main]
//! async fn main() -> voltage_iec60870::Result<()> {
//!     let config = ClientConfig::new("192.168.1.100:2404").common_address(1);
//!     let mut client = Iec104Client::connect(config)?;
//!     let mut events = client.subscribe().expect("first subscriber");
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::Activated => {
//!                 client.send_commands(vec![CommandRequest::interrogation()]).await?;
//!             }
//!             Event::DataReceived(points) => println!("{:?}", points),
//!             other => println!("Event: {:?}", other),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! ```text
//! Iec104Client / Iec104Server        Iec101Master
//!         |                               |
//!   TransportLayer (APCI)    LinkMaster / LinkBalanced (FT1.2)
//!         |                               |
//!   Iec104Codec over TCP           Ft12Codec over serial
//!         \_______________________________/
//!                        |
//!     CommandDispatcher, FileTransfer, parse_asdu
//! ```
//!
//! The protocol state machines are synchronous and take the current time as
//! an argument; the drivers own the sockets and timers.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod file_transfer;
pub mod link;
pub mod master;
pub mod parser;
pub mod server;
pub mod transport;
pub mod types;

// Re-export main types
pub use client::{ClientStatus, Iec104Client};
pub use codec::{Apdu, Iec104Codec};
pub use command::{CommandId, CommandOutcome, CommandRequest, CommandValue};
pub use config::{
    ClientConfig, LinkMode, Parity, ReconnectPolicy, SerialConfig, ServerConfig, TransportParams,
};
pub use connection::{ConnectionState, Connector, SerialConnector, TcpConnector};
pub use error::{ErrorClass, Iec60870Error, Result};
pub use event::Event;
pub use file_transfer::{FileEntry, FileRequest, FileTransferError};
pub use link::{LinkBalanced, LinkState, PollClass};
pub use master::{Iec101Master, MasterStatus};
pub use parser::parse_asdu;
pub use server::{Iec104Server, PeerStatus, ServerStatus};
pub use transport::{TransportState, WindowStatus};
pub use types::*;
