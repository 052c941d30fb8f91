//! IEC 60870-5-101 master.
//!
//! [`Iec101Master`] drives one serial line, either polling any number of
//! slaves (unbalanced) or talking to a single station that may send on its
//! own (balanced). The connection task owns the port, the link state machine
//! and the command dispatcher; the handle talks to it over a request channel
//! like the 104 client does.

use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::command::{CommandDispatcher, CommandId, CommandRequest};
use crate::config::{LinkMode, SerialConfig};
use crate::connection::{ConnectionState, Connector, RetryBudget, SerialConnector};
use crate::error::{Iec60870Error, Result};
use crate::event::{Event, EventSender};
use crate::link::{
    Ft12Codec, Ft12Frame, LinkBalanced, LinkEvent, LinkMaster, LinkParams, LinkState,
};
use crate::parser::parse_asdu;
use crate::types::Asdu;

const REQUEST_QUEUE_SIZE: usize = 32;

/// Status snapshot of a serial line.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterStatus {
    /// Port state
    pub state: ConnectionState,
    /// Port description
    pub port: String,
    /// Link state of every slave
    pub slaves: Vec<(u8, LinkState)>,
    /// Commands queued or awaiting confirmation
    pub pending_commands: usize,
    /// Events dropped because the event queue was full
    pub dropped_events: u64,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    AddSlave { address: u8, reply: Reply<()> },
    RemoveSlave { address: u8, reply: Reply<()> },
    PollSlave { address: u8, reply: Reply<()> },
    Commands {
        batch: Vec<CommandRequest>,
        reply: Reply<Vec<CommandId>>,
    },
    Disconnect(oneshot::Sender<()>),
}

/// Link state machine of the line.
enum Line {
    Unbalanced(LinkMaster),
    Balanced(LinkBalanced),
}

impl Line {
    fn new(config: &SerialConfig) -> Result<Self> {
        let params = LinkParams::from(config);
        match config.mode {
            LinkMode::Unbalanced => {
                let mut link = LinkMaster::new(params);
                for address in &config.link_addresses {
                    link.add_slave(*address)?;
                }
                Ok(Self::Unbalanced(link))
            }
            LinkMode::Balanced => Ok(Self::Balanced(LinkBalanced::new(
                params,
                config.default_link_address(),
            ))),
        }
    }

    fn add_slave(&mut self, address: u8) -> Result<()> {
        match self {
            Self::Unbalanced(link) => link.add_slave(address),
            Self::Balanced(link) if link.address() == address => Ok(()),
            Self::Balanced(_) => Err(Iec60870Error::config(
                "balanced link serves a single station",
            )),
        }
    }

    fn remove_slave(&mut self, address: u8) -> Result<()> {
        match self {
            Self::Unbalanced(link) => link.remove_slave(address),
            Self::Balanced(_) => Err(Iec60870Error::config(
                "balanced link serves a single station",
            )),
        }
    }

    fn poll_slave(&mut self, address: u8) -> Result<()> {
        match self {
            Self::Unbalanced(link) => link.poll_slave(address),
            Self::Balanced(link) if link.address() == address => {
                link.restart();
                Ok(())
            }
            Self::Balanced(_) => Err(Iec60870Error::config(format!(
                "unknown link address {}",
                address
            ))),
        }
    }

    fn has_slave(&self, address: u8) -> bool {
        match self {
            Self::Unbalanced(link) => link.has_slave(address),
            Self::Balanced(link) => link.address() == address,
        }
    }

    fn send_user_data(&mut self, address: u8, asdu: Bytes) -> Result<()> {
        match self {
            Self::Unbalanced(link) => link.send_user_data(address, asdu),
            Self::Balanced(link) => link.send_user_data(asdu),
        }
    }

    fn slave_states(&self) -> Vec<(u8, LinkState)> {
        match self {
            Self::Unbalanced(link) => link.slave_states(),
            Self::Balanced(link) => vec![(link.address(), link.state())],
        }
    }

    fn reset_all(&mut self) {
        match self {
            Self::Unbalanced(link) => link.reset_all(),
            Self::Balanced(link) => link.reset(),
        }
    }

    fn poll(&mut self, now: Instant) {
        match self {
            Self::Unbalanced(link) => link.poll(now),
            Self::Balanced(link) => link.poll(now),
        }
    }

    fn poll_timers(&mut self, now: Instant) {
        match self {
            Self::Unbalanced(link) => link.poll_timers(now),
            Self::Balanced(link) => link.poll_timers(now),
        }
    }

    fn on_frame(&mut self, frame: Ft12Frame) {
        match self {
            Self::Unbalanced(link) => link.on_frame(frame),
            Self::Balanced(link) => link.on_frame(frame),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self {
            Self::Unbalanced(link) => link.next_deadline(),
            Self::Balanced(link) => link.next_deadline(),
        }
    }

    fn poll_transmit(&mut self) -> Option<Ft12Frame> {
        match self {
            Self::Unbalanced(link) => link.poll_transmit(),
            Self::Balanced(link) => link.poll_transmit(),
        }
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        match self {
            Self::Unbalanced(link) => link.poll_event(),
            Self::Balanced(link) => link.poll_event(),
        }
    }
}

/// Serve a request while the port is closed. Slave management works on the
/// persistent link state; commands are refused.
fn serve_offline(
    link: &mut Line,
    request: Option<Request>,
) -> ControlFlow<Option<oneshot::Sender<()>>> {
    match request {
        None => return ControlFlow::Break(None),
        Some(Request::Disconnect(reply)) => return ControlFlow::Break(Some(reply)),
        Some(Request::Commands { reply, .. }) => {
            let _ = reply.send(Err(Iec60870Error::NotConnected));
        }
        Some(Request::AddSlave { address, reply }) => {
            let _ = reply.send(link.add_slave(address));
        }
        Some(Request::RemoveSlave { address, reply }) => {
            let _ = reply.send(link.remove_slave(address));
        }
        Some(Request::PollSlave { address, reply }) => {
            let _ = reply.send(link.poll_slave(address));
        }
    }
    ControlFlow::Continue(())
}

/// IEC 60870-5-101 master handle.
pub struct Iec101Master {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<MasterStatus>,
    events: Option<mpsc::Receiver<Event>>,
    task: Option<JoinHandle<()>>,
}

impl Iec101Master {
    /// Validate `config` and start opening the serial port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: SerialConfig) -> Result<Self> {
        config.validate()?;
        let connector = SerialConnector::from_config(&config);
        Self::spawn(config, connector)
    }

    /// Validate `config` and open the line through `connector`.
    pub fn with_connector<C: Connector>(config: SerialConfig, connector: C) -> Result<Self> {
        config.validate()?;
        Self::spawn(config, connector)
    }

    fn spawn<C: Connector>(config: SerialConfig, connector: C) -> Result<Self> {
        let link = Line::new(&config)?;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (events, event_rx) = EventSender::channel(config.event_queue_size);
        let (status_tx, status_rx) = watch::channel(MasterStatus {
            state: ConnectionState::Disconnected,
            port: connector.describe(),
            slaves: link.slave_states(),
            pending_commands: 0,
            dropped_events: 0,
        });

        let task = MasterTask {
            dispatcher: CommandDispatcher::new(
                config.queue_size,
                config.command_timeout,
                config.originator,
                config.common_address,
            ),
            retry: RetryBudget::new(config.reconnect),
            default_link: config.default_link_address(),
            state: ConnectionState::Disconnected,
            port: connector.describe(),
            connector,
            link,
            requests: request_rx,
            events,
            status: status_tx,
        };

        Ok(Self {
            requests: request_tx,
            status: status_rx,
            events: Some(event_rx),
            task: Some(tokio::spawn(task.run())),
        })
    }

    /// Take the event receiver.
    ///
    /// This can only be called once. Returns None if already subscribed.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }

    /// Current status snapshot.
    pub fn status(&self) -> MasterStatus {
        self.status.borrow().clone()
    }

    /// Start polling another slave. A balanced line only accepts its own
    /// station.
    pub async fn add_slave(&self, address: u8) -> Result<()> {
        self.request(|reply| Request::AddSlave { address, reply })
            .await
    }

    /// Stop polling a slave. Not available on a balanced line.
    pub async fn remove_slave(&self, address: u8) -> Result<()> {
        self.request(|reply| Request::RemoveSlave { address, reply })
            .await
    }

    /// Poll a slave right away; brings an offline slave back with a link reset.
    /// On a balanced line this sets up a failed link without waiting for t0.
    pub async fn poll_slave(&self, address: u8) -> Result<()> {
        self.request(|reply| Request::PollSlave { address, reply })
            .await
    }

    /// Queue a batch of commands. The station address of each command picks
    /// the slave; commands without one go to the first configured slave.
    pub async fn send_commands(&self, batch: Vec<CommandRequest>) -> Result<Vec<CommandId>> {
        self.request(|reply| Request::Commands { batch, reply }).await
    }

    /// Close the port and stop reconnecting.
    pub async fn disconnect(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Iec60870Error::Connection(format!("connection task failed: {}", e)))?;
        }
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| Iec60870Error::NotConnected)?;
        rx.await.map_err(|_| Iec60870Error::NotConnected)?
    }
}

enum SessionEnd {
    Disconnect(Option<oneshot::Sender<()>>),
    Failed(Iec60870Error),
}

struct MasterTask<C: Connector> {
    connector: C,
    link: Line,
    dispatcher: CommandDispatcher,
    requests: mpsc::Receiver<Request>,
    events: EventSender,
    status: watch::Sender<MasterStatus>,
    retry: RetryBudget,
    default_link: u8,
    state: ConnectionState,
    port: String,
}

impl<C: Connector> MasterTask<C> {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let error = match self.open().await {
                ControlFlow::Break(reply) => return self.shut_down(reply),
                ControlFlow::Continue(Ok(stream)) => {
                    info!(port = %self.port, "Port open");
                    self.events.emit(Event::Opened {
                        peer: self.port.clone(),
                    });
                    match self.session(stream).await {
                        SessionEnd::Disconnect(reply) => return self.shut_down(reply),
                        SessionEnd::Failed(error) => {
                            warn!(port = %self.port, "Port closed: {}", error);
                            self.events.emit(Event::Closed {
                                reason: error.to_string(),
                            });
                            self.dispatcher.cancel_all();
                            self.drain_completions();
                            error
                        }
                    }
                }
                ControlFlow::Continue(Err(error)) => error,
            };

            let reason = format!("attempt {} to {}: {}", self.retry.attempt(), self.port, error);
            match self.retry.next_retry() {
                Some((attempt, delay)) => {
                    warn!(%reason, ?delay, "Reopening port");
                    self.events.emit(Event::Reconnecting {
                        slave: None,
                        attempt,
                        reason,
                    });
                    self.set_state(ConnectionState::Reconnecting);
                    if let ControlFlow::Break(reply) = self.wait(delay).await {
                        return self.shut_down(reply);
                    }
                }
                None => {
                    error!(%reason, "Giving up");
                    self.events.emit(Event::Failed {
                        slave: None,
                        reason,
                        terminal: true,
                    });
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    async fn open(&mut self) -> ControlFlow<Option<oneshot::Sender<()>>, Result<C::Stream>> {
        let attempt = self.connector.connect();
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return ControlFlow::Continue(result.map_err(Iec60870Error::Io));
                }
                request = self.requests.recv() => {
                    if let ControlFlow::Break(reply) = serve_offline(&mut self.link, request) {
                        return ControlFlow::Break(reply);
                    }
                }
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> ControlFlow<Option<oneshot::Sender<()>>> {
        let delay = sleep(delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return ControlFlow::Continue(()),
                request = self.requests.recv() => {
                    if let ControlFlow::Break(reply) = serve_offline(&mut self.link, request) {
                        return ControlFlow::Break(reply);
                    }
                    self.publish();
                }
            }
        }
    }

    async fn session(&mut self, stream: C::Stream) -> SessionEnd {
        let mut framed = Framed::new(stream, Ft12Codec::new());
        self.link.reset_all();
        self.set_state(ConnectionState::Connected);

        // no handshake with the port itself; links set up per station
        self.retry.reset();
        self.set_state(ConnectionState::Activated);
        self.events.emit(Event::Activated);

        loop {
            if let Err(e) = self.step(Instant::now()) {
                return SessionEnd::Failed(e);
            }
            if let Err(e) = write_frames(&mut framed, &mut self.link).await {
                return SessionEnd::Failed(e);
            }
            self.publish();

            let deadline = [self.link.next_deadline(), self.dispatcher.next_deadline()]
                .into_iter()
                .flatten()
                .min();

            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        trace!(?frame, "Received");
                        self.link.on_frame(frame);
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => {
                        return SessionEnd::Failed(Iec60870Error::Connection(
                            "serial line closed".into(),
                        ))
                    }
                },
                request = self.requests.recv() => match request {
                    None => return SessionEnd::Disconnect(None),
                    Some(Request::Disconnect(reply)) => return SessionEnd::Disconnect(Some(reply)),
                    Some(Request::Commands { batch, reply }) => {
                        let _ = reply.send(self.dispatcher.submit(batch));
                    }
                    Some(request) => {
                        let _ = serve_offline(&mut self.link, Some(request));
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }
    }

    /// Fire timers, hand commands to their slave and schedule the next
    /// request on the line.
    fn step(&mut self, now: Instant) -> Result<()> {
        self.dispatcher.poll_timers(now);
        self.link.poll_timers(now);

        while let Some(asdu) = self.dispatcher.poll_transmit(now) {
            let slave = u8::try_from(asdu.header.common_address)
                .ok()
                .filter(|address| self.link.has_slave(*address))
                .unwrap_or(self.default_link);
            debug!(slave, type_id = %asdu.type_id(), "Sending command");
            let queued = asdu
                .encode()
                .and_then(|bytes| self.link.send_user_data(slave, bytes));
            if let Err(e) = queued {
                // left to the command timeout
                warn!(slave, "Cannot queue command: {}", e);
            }
        }

        self.link.poll(now);

        while let Some(event) = self.link.poll_event() {
            self.on_link_event(event)?;
        }
        self.drain_completions();
        Ok(())
    }

    fn on_link_event(&mut self, event: LinkEvent) -> Result<()> {
        match event {
            LinkEvent::Asdu { slave, asdu } => {
                let asdu = match Asdu::decode(&asdu) {
                    Ok(asdu) => asdu,
                    Err(e) if e.is_recoverable_decode() => {
                        warn!(slave, "Skipping ASDU: {}", e);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                if self.dispatcher.on_asdu(&asdu) {
                    return Ok(());
                }
                let points = parse_asdu(&asdu, u16::from(slave));
                if points.is_empty() {
                    self.events.emit(Event::AsduReceived { peer: None, asdu });
                } else {
                    self.events.emit(Event::DataReceived(points));
                }
            }
            LinkEvent::StateChanged { slave, state } => {
                info!(slave, %state, "Link state changed");
                self.events.emit(Event::SlaveStateChanged { slave, state });
            }
            LinkEvent::Retrying {
                slave,
                attempt,
                reason,
            } => {
                self.events.emit(Event::Reconnecting {
                    slave: Some(slave),
                    attempt,
                    reason,
                });
            }
            LinkEvent::Failed { slave, reason } => {
                self.events.emit(Event::Failed {
                    slave: Some(slave),
                    reason,
                    terminal: false,
                });
            }
        }
        Ok(())
    }

    fn drain_completions(&mut self) {
        while let Some((id, outcome)) = self.dispatcher.poll_completion() {
            debug!(%id, ?outcome, "Command finished");
            self.events.emit(Event::CommandConfirmed { id, outcome });
        }
    }

    fn shut_down(mut self, reply: Option<oneshot::Sender<()>>) {
        info!(port = %self.port, "Closing port");
        self.dispatcher.cancel_all();
        self.drain_completions();
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Activated
        ) {
            self.events.emit(Event::Closed {
                reason: "disconnected by request".to_string(),
            });
        }
        self.set_state(ConnectionState::Disconnected);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Port state changed");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        let status = MasterStatus {
            state: self.state,
            port: self.port.clone(),
            slaves: self.link.slave_states(),
            pending_commands: self.dispatcher.pending(),
            dropped_events: self.events.dropped(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn write_frames<S>(framed: &mut Framed<S, Ft12Codec>, link: &mut Line) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut written = false;
    while let Some(frame) = link.poll_transmit() {
        trace!(?frame, "Sending");
        framed.feed(frame).await?;
        written = true;
    }
    if written {
        framed.flush().await?;
    }
    Ok(())
}
