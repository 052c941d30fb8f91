//! IEC 60870-5-104 client.
//!
//! [`Iec104Client`] is a handle to a connection task. The task owns the
//! socket, the transport state machine, the command dispatcher and the file
//! transfer session; the handle queues requests to it and reads status
//! snapshots from a watch channel.

use std::ops::ControlFlow;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::codec::{Apdu, Iec104Codec};
use crate::command::{CommandDispatcher, CommandId, CommandRequest};
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, Connector, RetryBudget, TcpConnector};
use crate::error::{Iec60870Error, Result};
use crate::event::{Event, EventSender};
use crate::file_transfer::{FileRequest, FileTransfer, FileTransferEvent};
use crate::parser::parse_asdu;
use crate::transport::{
    write_pending, Role, TransportEvent, TransportLayer, TransportState, WindowStatus,
};
use crate::types::Asdu;

/// Capacity of the handle-to-task request channel.
const REQUEST_QUEUE_SIZE: usize = 32;

/// Status snapshot of a client connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    /// Connection state
    pub state: ConnectionState,
    /// Address of the current or last attempt
    pub address: String,
    /// Window occupancy while a socket is open
    pub window: Option<WindowStatus>,
    /// Commands queued or awaiting confirmation
    pub pending_commands: usize,
    /// A file listing or download is running
    pub file_transfer_active: bool,
    /// Events dropped because the event queue was full
    pub dropped_events: u64,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    Commands {
        batch: Vec<CommandRequest>,
        reply: Reply<Vec<CommandId>>,
    },
    StartDt(Reply<()>),
    StopDt(Reply<()>),
    FileList {
        common_address: Option<u16>,
        reply: Reply<()>,
    },
    File {
        request: FileRequest,
        reply: Reply<()>,
    },
    Disconnect(oneshot::Sender<()>),
}

impl Request {
    /// Answer a request that needs a running data transfer.
    fn refuse(self) {
        match self {
            Request::Commands { reply, .. } => {
                let _ = reply.send(Err(Iec60870Error::NotConnected));
            }
            Request::StartDt(reply)
            | Request::StopDt(reply)
            | Request::FileList { reply, .. }
            | Request::File { reply, .. } => {
                let _ = reply.send(Err(Iec60870Error::NotConnected));
            }
            Request::Disconnect(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

/// Handle the request channel while no socket is open. Breaks with the
/// disconnect acknowledgment when the task must stop.
fn refuse(request: Option<Request>) -> ControlFlow<Option<oneshot::Sender<()>>> {
    match request {
        None => ControlFlow::Break(None),
        Some(Request::Disconnect(reply)) => ControlFlow::Break(Some(reply)),
        Some(request) => {
            request.refuse();
            ControlFlow::Continue(())
        }
    }
}

/// IEC 60870-5-104 client handle.
///
/// ```ignore
/// let mut client = Iec104Client::connect(ClientConfig::new("192.168.1.100"))?;
/// let mut events = client.subscribe().unwrap();
/// client.send_commands(vec![CommandRequest::interrogation()]).await?;
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// ```
pub struct Iec104Client {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<ClientStatus>,
    events: Option<mpsc::Receiver<Event>>,
    task: Option<JoinHandle<()>>,
}

impl Iec104Client {
    /// Validate `config` and start connecting over TCP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let connector = TcpConnector::from_config(&config);
        Ok(Self::spawn(config, connector))
    }

    /// Validate `config` and start connecting through `connector`.
    pub fn with_connector<C: Connector>(config: ClientConfig, connector: C) -> Result<Self> {
        config.validate()?;
        Ok(Self::spawn(config, connector))
    }

    fn spawn<C: Connector>(config: ClientConfig, connector: C) -> Self {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (events, event_rx) = EventSender::channel(config.event_queue_size);
        let (status_tx, status_rx) = watch::channel(ClientStatus {
            state: ConnectionState::Disconnected,
            address: connector.describe(),
            window: None,
            pending_commands: 0,
            file_transfer_active: false,
            dropped_events: 0,
        });

        let task = ClientTask {
            dispatcher: CommandDispatcher::new(
                config.queue_size,
                config.command_timeout,
                config.originator,
                config.common_address,
            ),
            files: FileTransfer::new(config.file_timeout, config.originator, config.common_address),
            retry: RetryBudget::new(config.reconnect),
            state: ConnectionState::Disconnected,
            address: connector.describe(),
            config,
            connector,
            requests: request_rx,
            events,
            status: status_tx,
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
        };

        Self {
            requests: request_tx,
            status: status_rx,
            events: Some(event_rx),
            task: Some(tokio::spawn(task.run())),
        }
    }

    /// Take the event receiver.
    ///
    /// This can only be called once. Returns None if already subscribed.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }

    /// Current status snapshot.
    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Queue a batch of commands. Fails as a whole when the connection is not
    /// activated, a command is invalid or the batch does not fit the queue.
    pub async fn send_commands(&self, batch: Vec<CommandRequest>) -> Result<Vec<CommandId>> {
        self.request(|reply| Request::Commands { batch, reply }).await
    }

    /// Send STARTDT and wait for the confirmation.
    pub async fn start_dt(&self) -> Result<()> {
        self.request(Request::StartDt).await
    }

    /// Send STOPDT and wait for the confirmation.
    pub async fn stop_dt(&self) -> Result<()> {
        self.request(Request::StopDt).await
    }

    /// Request the directory of `common_address` (connection default if
    /// `None`). The listing arrives as [`Event::FileListReceived`].
    pub async fn request_file_list(&self, common_address: Option<u16>) -> Result<()> {
        self.request(|reply| Request::FileList {
            common_address,
            reply,
        })
        .await
    }

    /// Start a file download. The file arrives as [`Event::FileReceived`].
    pub async fn request_file(&self, request: FileRequest) -> Result<()> {
        self.request(|reply| Request::File { request, reply }).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Pending commands complete as cancelled and a running file transfer
    /// is aborted.
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

struct ClientTask<C: Connector> {
    config: ClientConfig,
    connector: C,
    requests: mpsc::Receiver<Request>,
    events: EventSender,
    status: watch::Sender<ClientStatus>,
    dispatcher: CommandDispatcher,
    files: FileTransfer,
    retry: RetryBudget,
    state: ConnectionState,
    address: String,
    start_waiters: Vec<Reply<()>>,
    stop_waiters: Vec<Reply<()>>,
}

impl<C: Connector> ClientTask<C> {
    async fn run(mut self) {
        loop {
            self.address = self.connector.describe();
            self.set_state(ConnectionState::Connecting, None);

            let error = match self.open().await {
                ControlFlow::Break(reply) => return self.shut_down(reply),
                ControlFlow::Continue(Ok(stream)) => {
                    info!(address = %self.address, "Connected");
                    self.events.emit(Event::Opened {
                        peer: self.address.clone(),
                    });
                    match self.session(stream).await {
                        SessionEnd::Disconnect(reply) => return self.shut_down(reply),
                        SessionEnd::Failed(error) => {
                            warn!(address = %self.address, "Connection closed: {}", error);
                            self.events.emit(Event::Closed {
                                reason: error.to_string(),
                            });
                            self.abort_work();
                            self.release_waiters();
                            error
                        }
                    }
                }
                ControlFlow::Continue(Err(error)) => error,
            };

            let reason = format!(
                "attempt {} to {}: {}",
                self.retry.attempt(),
                self.address,
                error
            );
            match self.retry.next_retry() {
                Some((attempt, delay)) => {
                    warn!(%reason, ?delay, "Reconnecting");
                    self.events.emit(Event::Reconnecting {
                        slave: None,
                        attempt,
                        reason,
                    });
                    self.set_state(ConnectionState::Reconnecting, None);
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
                    self.set_state(ConnectionState::Disconnected, None);
                    return;
                }
            }
        }
    }

    /// One connection attempt bounded by t0. Requests arriving meanwhile are
    /// refused.
    async fn open(&mut self) -> ControlFlow<Option<oneshot::Sender<()>>, Result<C::Stream>> {
        let result = {
            let attempt = timeout(self.config.params.t0, self.connector.connect());
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    request = self.requests.recv() => {
                        if let ControlFlow::Break(reply) = refuse(request) {
                            return ControlFlow::Break(reply);
                        }
                    }
                }
            }
        };
        ControlFlow::Continue(match result {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Iec60870Error::Io(e)),
            Err(_) => {
                self.connector.attempt_timed_out();
                Err(Iec60870Error::ConnectionTimeout)
            }
        })
    }

    /// Sleep for the reconnect delay, refusing requests meanwhile.
    async fn wait(&mut self, delay: Duration) -> ControlFlow<Option<oneshot::Sender<()>>> {
        let delay = sleep(delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return ControlFlow::Continue(()),
                request = self.requests.recv() => {
                    if let ControlFlow::Break(reply) = refuse(request) {
                        return ControlFlow::Break(reply);
                    }
                }
            }
        }
    }

    async fn session(&mut self, stream: C::Stream) -> SessionEnd {
        let mut framed = Framed::new(stream, Iec104Codec::new());
        let mut transport = TransportLayer::new(Role::Client, self.config.params, Instant::now());
        self.set_state(ConnectionState::Connected, Some(transport.status()));

        if self.config.auto_start_dt {
            if let Err(e) = transport.start_dt(Instant::now()) {
                return SessionEnd::Failed(e);
            }
        }

        loop {
            if let Err(e) = self.pump(&mut transport, Instant::now()) {
                return SessionEnd::Failed(e);
            }
            if let Err(e) = write_pending(&mut framed, &mut transport).await {
                return SessionEnd::Failed(e);
            }
            self.publish(Some(transport.status()));

            let deadline = [self.dispatcher.next_deadline(), self.files.next_deadline()]
                .into_iter()
                .flatten()
                .fold(transport.next_deadline(), Instant::min);

            tokio::select! {
                frame = framed.next() => {
                    let result = match frame {
                        Some(Ok(apdu)) => self.on_apdu(&mut transport, apdu, Instant::now()),
                        Some(Err(e)) => Err(e),
                        None => Err(Iec60870Error::Connection("connection closed by peer".into())),
                    };
                    if let Err(e) = result {
                        return SessionEnd::Failed(e);
                    }
                }
                request = self.requests.recv() => match request {
                    None => return SessionEnd::Disconnect(None),
                    Some(Request::Disconnect(reply)) => return SessionEnd::Disconnect(Some(reply)),
                    Some(request) => self.on_request(&mut transport, request, Instant::now()),
                },
                _ = sleep_until(deadline) => {}
            }
        }
    }

    /// Fire timers and move queued ASDUs into the send window.
    fn pump(&mut self, transport: &mut TransportLayer, now: Instant) -> Result<()> {
        transport.poll_timers(now)?;
        self.dispatcher.poll_timers(now);
        self.files.poll_timers(now);

        while transport.can_send() {
            let asdu = match self.files.poll_transmit() {
                Some(asdu) => asdu,
                None => match self.dispatcher.poll_transmit(now) {
                    Some(asdu) => asdu,
                    None => break,
                },
            };
            debug!(type_id = %asdu.type_id(), cot = %asdu.header.cot, "Sending ASDU");
            transport.send_asdu(asdu.encode()?, now)?;
        }

        self.drain_results();
        Ok(())
    }

    fn on_apdu(
        &mut self,
        transport: &mut TransportLayer,
        apdu: Apdu,
        now: Instant,
    ) -> Result<()> {
        match transport.on_apdu(apdu, now)? {
            None => {}
            Some(TransportEvent::Activated) => {
                info!(address = %self.address, "Data transfer started");
                self.retry.reset();
                self.set_state(ConnectionState::Activated, Some(transport.status()));
                self.events.emit(Event::Activated);
                for waiter in self.start_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Some(TransportEvent::Deactivated) => {
                info!(address = %self.address, "Data transfer stopped");
                self.set_state(ConnectionState::Connected, Some(transport.status()));
                self.events.emit(Event::Deactivated);
                self.abort_work();
                for waiter in self.stop_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Some(TransportEvent::Asdu(bytes)) => self.on_asdu(&bytes, now)?,
        }
        Ok(())
    }

    fn on_asdu(&mut self, bytes: &[u8], now: Instant) -> Result<()> {
        let asdu = match Asdu::decode(bytes) {
            Ok(asdu) => asdu,
            Err(e) if e.is_recoverable_decode() => {
                warn!("Skipping ASDU: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.dispatcher.on_asdu(&asdu) || self.files.on_asdu(&asdu, now) {
            self.drain_results();
            return Ok(());
        }

        let points = parse_asdu(&asdu, asdu.header.common_address);
        if points.is_empty() {
            self.events.emit(Event::AsduReceived { peer: None, asdu });
        } else {
            self.events.emit(Event::DataReceived(points));
        }
        Ok(())
    }

    fn on_request(&mut self, transport: &mut TransportLayer, request: Request, now: Instant) {
        match request {
            Request::Commands { batch, reply } => {
                let result = if transport.is_started() {
                    self.dispatcher.submit(batch)
                } else {
                    Err(Iec60870Error::NotConnected)
                };
                let _ = reply.send(result);
            }
            Request::StartDt(reply) => {
                if transport.is_started() {
                    let _ = reply.send(Ok(()));
                } else if let Err(e) = transport.start_dt(now) {
                    let _ = reply.send(Err(e));
                } else {
                    self.start_waiters.push(reply);
                }
            }
            Request::StopDt(reply) => {
                if transport.state() == TransportState::Stopped {
                    let _ = reply.send(Ok(()));
                } else if let Err(e) = transport.stop_dt(now) {
                    let _ = reply.send(Err(e));
                } else {
                    self.stop_waiters.push(reply);
                }
            }
            Request::FileList {
                common_address,
                reply,
            } => {
                let result = if transport.is_started() {
                    self.files
                        .request_directory(common_address, now)
                        .map_err(Iec60870Error::from)
                } else {
                    Err(Iec60870Error::NotConnected)
                };
                let _ = reply.send(result);
            }
            Request::File { request, reply } => {
                let result = if transport.is_started() {
                    self.files
                        .request_file(request, now)
                        .map_err(Iec60870Error::from)
                } else {
                    Err(Iec60870Error::NotConnected)
                };
                let _ = reply.send(result);
            }
            // handled by the session loop
            Request::Disconnect(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Forward command completions and file transfer results as events.
    fn drain_results(&mut self) {
        while let Some((id, outcome)) = self.dispatcher.poll_completion() {
            debug!(%id, ?outcome, "Command finished");
            self.events.emit(Event::CommandConfirmed { id, outcome });
        }
        while let Some(result) = self.files.poll_event() {
            let event = match result {
                FileTransferEvent::ListReceived(files) => Event::FileListReceived { files },
                FileTransferEvent::FileReceived { name, ioa, bytes } => {
                    Event::FileReceived { name, ioa, bytes }
                }
                FileTransferEvent::Failed { name, error } => Event::FileTransferFailed {
                    name,
                    reason: error.to_string(),
                },
            };
            self.events.emit(event);
        }
    }

    /// Cancel queued commands and the file transfer session.
    fn abort_work(&mut self) {
        self.dispatcher.cancel_all();
        self.files.cancel();
        self.drain_results();
    }

    /// Answer STARTDT and STOPDT callers whose confirmation can no longer
    /// arrive.
    fn release_waiters(&mut self) {
        for waiter in self.start_waiters.drain(..).chain(self.stop_waiters.drain(..)) {
            let _ = waiter.send(Err(Iec60870Error::Connection(
                "connection closed before confirmation".into(),
            )));
        }
    }

    fn shut_down(mut self, reply: Option<oneshot::Sender<()>>) {
        info!(address = %self.address, "Disconnecting");
        self.abort_work();
        self.release_waiters();
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Activated
        ) {
            self.events.emit(Event::Closed {
                reason: "disconnected by request".to_string(),
            });
        }
        self.set_state(ConnectionState::Disconnected, None);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn set_state(&mut self, state: ConnectionState, window: Option<WindowStatus>) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Connection state changed");
            self.state = state;
        }
        self.publish(window);
    }

    fn publish(&self, window: Option<WindowStatus>) {
        let status = ClientStatus {
            state: self.state,
            address: self.address.clone(),
            window,
            pending_commands: self.dispatcher.pending(),
            file_transfer_active: self.files.is_active(),
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
