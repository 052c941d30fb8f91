//! IEC 60870-5-104 server (controlled station).
//!
//! One accept task plus one task per connected client. Peers share nothing
//! but the event queue and the registry used for status and broadcast.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{Apdu, Iec104Codec};
use crate::config::ServerConfig;
use crate::error::{Iec60870Error, Result};
use crate::event::{Event, EventSender};
use crate::transport::{
    write_pending, Role, TransportEvent, TransportLayer, TransportState, WindowStatus,
};
use crate::types::{Asdu, AsduHeader, Cot, TypeId};

/// Shortest and longest pause after a failed accept.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before accepting again after `failures` consecutive errors, so a
/// persistent error such as descriptor exhaustion does not spin the loop.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << failures.min(7))
        .min(ACCEPT_BACKOFF_MAX)
}

/// State of one connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    /// Remote address
    pub peer: SocketAddr,
    /// Window occupancy and data transfer state
    pub window: WindowStatus,
}

impl PeerStatus {
    /// Check whether the peer has started data transfer.
    pub fn is_activated(&self) -> bool {
        self.window.state == TransportState::Started
    }
}

/// Status snapshot of the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    /// Bound address
    pub local_addr: SocketAddr,
    /// Accept task still running
    pub running: bool,
    /// Connected clients, ordered by address
    pub peers: Vec<PeerStatus>,
    /// Events dropped because the event queue was full
    pub dropped_events: u64,
}

struct PeerHandle {
    outbound: mpsc::Sender<Asdu>,
    window: watch::Receiver<WindowStatus>,
}

impl PeerHandle {
    fn is_activated(&self) -> bool {
        self.window.borrow().state == TransportState::Started
    }
}

#[derive(Clone, Default)]
struct PeerRegistry(Arc<RwLock<HashMap<SocketAddr, PeerHandle>>>);

impl PeerRegistry {
    fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn insert(&self, peer: SocketAddr, handle: PeerHandle) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, handle);
    }

    fn remove(&self, peer: &SocketAddr) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    fn with<T>(&self, f: impl FnOnce(&HashMap<SocketAddr, PeerHandle>) -> T) -> T {
        f(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// IEC 60870-5-104 server.
///
/// ```ignore
/// let mut server = Iec104Server::start(ServerConfig::new(2404)).await?;
/// let mut events = server.subscribe().unwrap();
/// while let Some(event) = events.recv().await {
///     if let Event::AsduReceived { peer: Some(peer), asdu } = event {
///         server.send_to(peer, asdu.mirror(Cot::ActivationConfirm, false))?;
///     }
/// }
/// ```
pub struct Iec104Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    peers: PeerRegistry,
    events: EventSender,
    event_rx: Option<mpsc::Receiver<Event>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Iec104Server {
    /// Validate `config`, bind the listener and start accepting clients.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_address()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, station = config.station_id, "IEC 104 server listening");

        let peers = PeerRegistry::default();
        let (events, event_rx) = EventSender::channel(config.event_queue_size);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            config.clone(),
            peers.clone(),
            events.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            config,
            local_addr,
            peers,
            events,
            event_rx: Some(event_rx),
            shutdown,
            task: Some(task),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the event receiver.
    ///
    /// This can only be called once. Returns None if already subscribed.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx.take()
    }

    /// Current status snapshot.
    pub fn status(&self) -> ServerStatus {
        let mut peers = self.peers.with(|peers| {
            peers
                .iter()
                .map(|(peer, handle)| PeerStatus {
                    peer: *peer,
                    window: *handle.window.borrow(),
                })
                .collect::<Vec<_>>()
        });
        peers.sort_by_key(|p| p.peer);

        ServerStatus {
            local_addr: self.local_addr,
            running: self.task.as_ref().is_some_and(|t| !t.is_finished()),
            peers,
            dropped_events: self.events.dropped(),
        }
    }

    /// Header for an ASDU sent from this station.
    pub fn header(&self, type_id: TypeId, cot: Cot) -> AsduHeader {
        AsduHeader::new(type_id, cot, self.config.station_id).with_originator(self.config.originator)
    }

    /// Queue `asdu` to every activated peer. Returns how many peers took it.
    pub fn send(&self, asdu: Asdu) -> Result<usize> {
        asdu.validate()?;
        let delivered = self.peers.with(|peers| {
            peers
                .iter()
                .filter(|(_, handle)| handle.is_activated())
                .filter(|(peer, handle)| match handle.outbound.try_send(asdu.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(%peer, "Dropping broadcast ASDU: {}", e);
                        false
                    }
                })
                .count()
        });
        debug!(type_id = %asdu.type_id(), delivered, "Broadcast ASDU");
        Ok(delivered)
    }

    /// Queue `asdu` to one activated peer.
    pub fn send_to(&self, peer: SocketAddr, asdu: Asdu) -> Result<()> {
        asdu.validate()?;
        let queue_size = self.config.queue_size;
        self.peers.with(|peers| {
            let handle = peers
                .get(&peer)
                .filter(|handle| handle.is_activated())
                .ok_or(Iec60870Error::NotConnected)?;
            handle.outbound.try_send(asdu).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull(queue_size),
                mpsc::error::TrySendError::Closed(_) => Iec60870Error::NotConnected,
            })
        })
    }

    /// Stop accepting, close every peer connection and wait for the tasks.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Iec60870Error::Connection(format!("server task failed: {}", e)))?;
        }
        info!(local_addr = %self.local_addr, "IEC 104 server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    peers: PeerRegistry,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(e) => {
                        let delay = accept_backoff(failures);
                        failures = failures.saturating_add(1);
                        warn!(?delay, "Accept failed: {}", e);
                        tokio::select! {
                            _ = sleep(delay) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                };
                if peers.len() >= config.max_clients {
                    warn!(%peer, max_clients = config.max_clients, "Refusing connection");
                    continue;
                }
                stream.set_nodelay(true).ok();
                info!(%peer, "Client connected");

                let (outbound_tx, outbound) = mpsc::channel(config.queue_size);
                let now = Instant::now();
                let transport = TransportLayer::new(Role::Server, config.params, now);
                let (window_tx, window_rx) = watch::channel(transport.status());
                peers.insert(
                    peer,
                    PeerHandle {
                        outbound: outbound_tx,
                        window: window_rx,
                    },
                );
                events.emit(Event::PeerConnected { peer });

                let session = PeerSession {
                    peer,
                    framed: Framed::new(stream, Iec104Codec::new()),
                    transport,
                    outbound,
                    window: window_tx,
                    events: events.clone(),
                    shutdown: shutdown.clone(),
                };
                tasks.spawn(session.run(peers.clone()));
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(peers = tasks.len(), "Waiting for peer tasks");
    while tasks.join_next().await.is_some() {}
}

struct PeerSession<S> {
    peer: SocketAddr,
    framed: Framed<S, Iec104Codec>,
    transport: TransportLayer,
    outbound: mpsc::Receiver<Asdu>,
    window: watch::Sender<WindowStatus>,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, peers: PeerRegistry) {
        let reason = match self.serve().await {
            Ok(reason) => reason.to_string(),
            Err(e) => e.to_string(),
        };
        info!(peer = %self.peer, %reason, "Client disconnected");
        peers.remove(&self.peer);
        self.events.emit(Event::PeerDisconnected {
            peer: self.peer,
            reason,
        });
    }

    async fn serve(&mut self) -> Result<&'static str> {
        loop {
            self.transport.poll_timers(Instant::now())?;
            write_pending(&mut self.framed, &mut self.transport).await?;
            let status = self.transport.status();
            self.window.send_if_modified(|current| {
                let changed = *current != status;
                *current = status;
                changed
            });

            let deadline = self.transport.next_deadline();
            let ready = self.transport.can_send();

            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(apdu)) => self.on_apdu(apdu)?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok("closed by peer"),
                },
                asdu = self.outbound.recv(), if ready => match asdu {
                    Some(asdu) => self.transport.send_asdu(asdu.encode()?, Instant::now())?,
                    None => return Ok("server stopped"),
                },
                _ = self.shutdown.changed() => return Ok("server stopped"),
                _ = sleep_until(deadline) => {}
            }
        }
    }

    fn on_apdu(&mut self, apdu: Apdu) -> Result<()> {
        match self.transport.on_apdu(apdu, Instant::now())? {
            None => {}
            Some(TransportEvent::Activated) => {
                info!(peer = %self.peer, "Data transfer started");
                self.events.emit(Event::PeerActivated { peer: self.peer });
            }
            Some(TransportEvent::Deactivated) => {
                info!(peer = %self.peer, "Data transfer stopped");
                self.events.emit(Event::PeerDeactivated { peer: self.peer });
            }
            Some(TransportEvent::Asdu(bytes)) => match Asdu::decode(&bytes) {
                Ok(asdu) => self.events.emit(Event::AsduReceived {
                    peer: Some(self.peer),
                    asdu,
                }),
                Err(e) if e.is_recoverable_decode() => {
                    warn!(peer = %self.peer, "Skipping ASDU: {}", e);
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }
}
