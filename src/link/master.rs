//! Unbalanced 101 link master.
//!
//! The master is the only initiator on the bus. It keeps one request
//! outstanding at a time, cycles class 2 polls over its slaves and follows up
//! with class 1 requests while a slave keeps answering with user data. Like
//! the 104 transport it performs no I/O.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::frame::{Ft12Frame, PrimaryFunction, SecondaryFunction};
use crate::config::SerialConfig;
use crate::error::{Iec60870Error, Result};

/// Which data class a poll asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollClass {
    /// Events, spontaneous data
    Class1,
    /// Cyclic data
    Class2,
}

/// Per-slave link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Reset of remote link pending
    Resetting,
    /// Waiting for the next poll slot
    Idle,
    /// A poll of this class is due
    Polling(PollClass),
    /// Request sent, waiting for the reply
    AwaitResponse,
    /// Retries exhausted; only `poll_slave` brings it back
    Offline,
}

impl LinkState {
    /// Coarse state reported through events: resetting, online or offline.
    fn reported(self) -> Self {
        match self {
            Self::Resetting | Self::Offline => self,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resetting => write!(f, "resetting"),
            Self::Idle => write!(f, "idle"),
            Self::Polling(PollClass::Class1) => write!(f, "polling class 1"),
            Self::Polling(PollClass::Class2) => write!(f, "polling class 2"),
            Self::AwaitResponse => write!(f, "awaiting response"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Link timers and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    /// Reset of remote link timeout
    pub t0: Duration,
    /// Reply timeout
    pub t1: Duration,
    /// Minimum spacing between class 2 polls of one slave
    pub t2: Duration,
    /// Retransmissions before a slave goes offline
    pub retries: u32,
}

impl From<&SerialConfig> for LinkParams {
    fn from(config: &SerialConfig) -> Self {
        Self {
            t0: config.t0,
            t1: config.t1,
            t2: config.t2,
            retries: config.link_retries,
        }
    }
}

/// Output of the link master.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// User data received from a slave
    Asdu { slave: u8, asdu: Bytes },
    /// Slave went resetting, online (`Idle`) or offline
    StateChanged { slave: u8, state: LinkState },
    /// A request is being retransmitted
    Retrying {
        slave: u8,
        attempt: u32,
        reason: String,
    },
    /// Retries exhausted, the slave is offline
    Failed { slave: u8, reason: String },
}

/// Frame count bit of one slave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) enum FrameCountBit {
    /// Cleared by a link reset; the next frame carries FCB=1
    #[default]
    Reset,
    High,
    Low,
}

impl FrameCountBit {
    /// Advance for a new FCV=1 frame and return the bit to send.
    pub(super) fn cycle(&mut self) -> bool {
        *self = match self {
            Self::Reset | Self::Low => Self::High,
            Self::High => Self::Low,
        };
        *self == Self::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Reset,
    UserData,
    Poll(PollClass),
}

#[derive(Debug)]
struct Slave {
    address: u8,
    state: LinkState,
    reported: LinkState,
    fcb: FrameCountBit,
    next_poll: Option<Instant>,
    user_data: VecDeque<Bytes>,
}

impl Slave {
    fn new(address: u8) -> Self {
        Self {
            address,
            state: LinkState::Resetting,
            reported: LinkState::Resetting,
            fcb: FrameCountBit::Reset,
            next_poll: None,
            user_data: VecDeque::new(),
        }
    }

    /// The request this slave wants sent now, if any.
    fn due(&self, now: Instant) -> Option<RequestKind> {
        match self.state {
            LinkState::Resetting => Some(RequestKind::Reset),
            LinkState::Offline | LinkState::AwaitResponse => None,
            _ if !self.user_data.is_empty() => Some(RequestKind::UserData),
            LinkState::Polling(class) => Some(RequestKind::Poll(class)),
            LinkState::Idle => self
                .next_poll
                .map_or(true, |at| now >= at)
                .then_some(RequestKind::Poll(PollClass::Class2)),
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    slave: u8,
    kind: RequestKind,
    frame: Ft12Frame,
    fcb: Option<bool>,
    deadline: Instant,
    attempt: u32,
}

/// Unbalanced link master for any number of slaves sharing one line.
#[derive(Debug)]
pub struct LinkMaster {
    params: LinkParams,
    slaves: Vec<Slave>,
    cursor: usize,
    outstanding: Option<Outstanding>,
    outbox: VecDeque<Ft12Frame>,
    events: VecDeque<LinkEvent>,
}

impl LinkMaster {
    /// Create a master without slaves.
    pub fn new(params: LinkParams) -> Self {
        Self {
            params,
            slaves: Vec::new(),
            cursor: 0,
            outstanding: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Start polling a slave. Adding a known slave is a no-op.
    pub fn add_slave(&mut self, address: u8) -> Result<()> {
        if address == 0 {
            return Err(Iec60870Error::config("link address must be in 1..=255"));
        }
        if self.index_of(address).is_none() {
            debug!(slave = address, "Adding slave");
            self.slaves.push(Slave::new(address));
            self.events.push_back(LinkEvent::StateChanged {
                slave: address,
                state: LinkState::Resetting,
            });
        }
        Ok(())
    }

    /// Stop polling a slave and drop its queued user data.
    pub fn remove_slave(&mut self, address: u8) -> Result<()> {
        let index = self.require(address)?;
        self.slaves.remove(index);
        if self.outstanding.as_ref().is_some_and(|o| o.slave == address) {
            self.outstanding = None;
        }
        self.outbox.retain(|frame| frame.address() != Some(address));
        if self.cursor >= self.slaves.len() {
            self.cursor = 0;
        }
        debug!(slave = address, "Removed slave");
        Ok(())
    }

    /// Poll a slave as soon as the bus is free. Revives an offline slave.
    pub fn poll_slave(&mut self, address: u8) -> Result<()> {
        let index = self.require(address)?;
        match self.slaves[index].state {
            LinkState::Offline => {
                self.slaves[index].fcb = FrameCountBit::Reset;
                self.set_state(index, LinkState::Resetting);
            }
            LinkState::Idle => self.slaves[index].next_poll = None,
            _ => {}
        }
        Ok(())
    }

    /// Queue an ASDU for "user data, confirm expected".
    pub fn send_user_data(&mut self, address: u8, asdu: Bytes) -> Result<()> {
        let index = self.require(address)?;
        let slave = &mut self.slaves[index];
        if slave.state == LinkState::Offline {
            return Err(Iec60870Error::NotConnected);
        }
        slave.user_data.push_back(asdu);
        Ok(())
    }

    /// Check whether a slave is configured.
    pub fn has_slave(&self, address: u8) -> bool {
        self.index_of(address).is_some()
    }

    /// Addresses and states of all slaves.
    pub fn slave_states(&self) -> Vec<(u8, LinkState)> {
        self.slaves.iter().map(|s| (s.address, s.state)).collect()
    }

    /// Forget all link state after the port was reopened.
    pub fn reset_all(&mut self) {
        self.outstanding = None;
        self.outbox.clear();
        self.cursor = 0;
        for index in 0..self.slaves.len() {
            let slave = &mut self.slaves[index];
            slave.fcb = FrameCountBit::Reset;
            slave.next_poll = None;
            slave.user_data.clear();
            self.set_state(index, LinkState::Resetting);
        }
    }

    /// Send the next request when the bus is free.
    pub fn poll(&mut self, now: Instant) {
        if self.outstanding.is_some() || self.slaves.is_empty() {
            return;
        }
        let count = self.slaves.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            if let Some(kind) = self.slaves[index].due(now) {
                self.cursor = (index + 1) % count;
                self.transmit(index, kind, now);
                return;
            }
        }
    }

    fn transmit(&mut self, index: usize, kind: RequestKind, now: Instant) {
        let params = self.params;
        let slave = &mut self.slaves[index];
        let address = slave.address;

        let (frame, fcb) = match kind {
            RequestKind::Reset => (
                Ft12Frame::request(PrimaryFunction::ResetRemoteLink, address, false),
                None,
            ),
            RequestKind::UserData => {
                let asdu = slave.user_data.front().cloned().unwrap_or_default();
                let fcb = slave.fcb.cycle();
                (Ft12Frame::user_data(address, fcb, asdu), Some(fcb))
            }
            RequestKind::Poll(class) => {
                let function = match class {
                    PollClass::Class1 => PrimaryFunction::RequestClass1,
                    PollClass::Class2 => PrimaryFunction::RequestClass2,
                };
                let fcb = slave.fcb.cycle();
                if class == PollClass::Class2 {
                    slave.next_poll = Some(now + params.t2);
                }
                (Ft12Frame::request(function, address, fcb), Some(fcb))
            }
        };

        let timeout = if kind == RequestKind::Reset {
            params.t0
        } else {
            slave.state = LinkState::AwaitResponse;
            params.t1
        };

        trace!(slave = address, ?kind, ?fcb, "Sending link request");
        self.outbox.push_back(frame.clone());
        self.outstanding = Some(Outstanding {
            slave: address,
            kind,
            frame,
            fcb,
            deadline: now + timeout,
            attempt: 0,
        });
    }

    /// Process a frame read from the line.
    pub fn on_frame(&mut self, frame: Ft12Frame) {
        if frame.is_primary() {
            trace!("Ignoring primary frame on the line");
            return;
        }
        let Some(outstanding) = self.outstanding.take() else {
            debug!(?frame, "Reply without outstanding request");
            return;
        };
        let slave = outstanding.slave;

        if frame.address().is_some_and(|a| a != slave) {
            debug!(expected = slave, ?frame, "Reply from wrong link address");
            self.outstanding = Some(outstanding);
            return;
        }
        if let (Some(sent), Some(echoed)) = (outstanding.fcb, frame.fcb()) {
            if sent != echoed {
                debug!(slave, "Discarding reply with stale FCB");
                self.outstanding = Some(outstanding);
                return;
            }
        }
        let Some(index) = self.index_of(slave) else {
            return;
        };

        match (outstanding.kind, frame.secondary_function()) {
            (RequestKind::Reset, Some(SecondaryFunction::Ack | SecondaryFunction::LinkStatus)) => {
                debug!(slave, "Link reset confirmed");
                self.slaves[index].fcb = FrameCountBit::Reset;
                self.slaves[index].next_poll = None;
                self.set_state(index, LinkState::Idle);
            }
            (RequestKind::UserData, Some(SecondaryFunction::Ack)) => {
                self.slaves[index].user_data.pop_front();
                self.set_state(index, LinkState::Idle);
            }
            (RequestKind::UserData, Some(SecondaryFunction::Nack)) => {
                warn!(slave, "User data not accepted, dropping it");
                self.slaves[index].user_data.pop_front();
                self.set_state(index, LinkState::Idle);
            }
            (RequestKind::Poll(_), Some(SecondaryFunction::UserData)) => {
                if let Ft12Frame::Variable { asdu, .. } = frame {
                    self.events.push_back(LinkEvent::Asdu { slave, asdu });
                }
                self.set_state(index, LinkState::Polling(PollClass::Class1));
            }
            (
                RequestKind::Poll(_),
                Some(SecondaryFunction::NoData | SecondaryFunction::Ack | SecondaryFunction::Nack),
            ) => {
                self.set_state(index, LinkState::Idle);
            }
            (kind, function) => {
                debug!(slave, ?kind, ?function, "Unexpected reply, still waiting");
                self.outstanding = Some(outstanding);
            }
        }
    }

    /// Retransmit or give up on an unanswered request.
    pub fn poll_timers(&mut self, now: Instant) {
        let Some(outstanding) = self.outstanding.as_mut() else {
            return;
        };
        if now < outstanding.deadline {
            return;
        }
        let slave = outstanding.slave;
        let timeout = if outstanding.kind == RequestKind::Reset {
            self.params.t0
        } else {
            self.params.t1
        };

        if outstanding.attempt < self.params.retries {
            outstanding.attempt += 1;
            outstanding.deadline = now + timeout;
            let attempt = outstanding.attempt;
            warn!(slave, attempt, "No reply, retransmitting");
            self.outbox.push_back(outstanding.frame.clone());
            self.events.push_back(LinkEvent::Retrying {
                slave,
                attempt,
                reason: format!("no reply from link {} within {:?}", slave, timeout),
            });
            return;
        }

        self.outstanding = None;
        let reason = format!(
            "link {} did not answer after {} retries",
            slave, self.params.retries
        );
        warn!(slave, "{}", reason);
        if let Some(index) = self.index_of(slave) {
            self.slaves[index].user_data.clear();
            self.set_state(index, LinkState::Offline);
        }
        self.events.push_back(LinkEvent::Failed { slave, reason });
    }

    /// When `poll_timers` or `poll` next has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        if let Some(outstanding) = &self.outstanding {
            return Some(outstanding.deadline);
        }
        self.slaves
            .iter()
            .filter(|s| s.state == LinkState::Idle && s.user_data.is_empty())
            .filter_map(|s| s.next_poll)
            .min()
    }

    /// Next frame to write.
    pub fn poll_transmit(&mut self) -> Option<Ft12Frame> {
        self.outbox.pop_front()
    }

    /// Next event for the application.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn set_state(&mut self, index: usize, state: LinkState) {
        let slave = &mut self.slaves[index];
        slave.state = state;
        let reported = state.reported();
        if reported != slave.reported {
            slave.reported = reported;
            self.events.push_back(LinkEvent::StateChanged {
                slave: slave.address,
                state: reported,
            });
        }
    }

    fn index_of(&self, address: u8) -> Option<usize> {
        self.slaves.iter().position(|s| s.address == address)
    }

    fn require(&self, address: u8) -> Result<usize> {
        self.index_of(address)
            .ok_or_else(|| Iec60870Error::config(format!("unknown link address {}", address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(retries: u32) -> LinkParams {
        LinkParams {
            t0: Duration::from_secs(30),
            t1: Duration::from_secs(1),
            t2: Duration::from_secs(10),
            retries,
        }
    }

    fn events(master: &mut LinkMaster) -> Vec<LinkEvent> {
        std::iter::from_fn(|| master.poll_event()).collect()
    }

    fn reply(control: u8, address: u8) -> Ft12Frame {
        Ft12Frame::Fixed { control, address }
    }

    fn data_reply(fcb: bool, address: u8) -> Ft12Frame {
        Ft12Frame::Variable {
            control: if fcb { 0x28 } else { 0x08 },
            address,
            asdu: Bytes::from_static(&[0x01, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01]),
        }
    }

    /// Master with one slave whose link reset is already confirmed.
    fn online(address: u8, retries: u32, now: Instant) -> LinkMaster {
        let mut master = LinkMaster::new(params(retries));
        master.add_slave(address).unwrap();
        master.poll(now);
        assert_eq!(
            master.poll_transmit(),
            Some(reply(0x40, address))
        );
        master.on_frame(Ft12Frame::SingleAck);
        events(&mut master);
        master
    }

    #[test]
    fn test_reset_then_class2_poll() {
        let now = Instant::now();
        let mut master = LinkMaster::new(params(3));
        master.add_slave(1).unwrap();
        assert_eq!(
            events(&mut master),
            vec![LinkEvent::StateChanged {
                slave: 1,
                state: LinkState::Resetting
            }]
        );

        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x40, 1)));
        assert_eq!(master.next_deadline(), Some(now + Duration::from_secs(30)));

        master.on_frame(reply(0x00, 1));
        assert_eq!(
            events(&mut master),
            vec![LinkEvent::StateChanged {
                slave: 1,
                state: LinkState::Idle
            }]
        );

        master.poll(now);
        assert_eq!(
            master.poll_transmit(),
            Some(Ft12Frame::request(PrimaryFunction::RequestClass2, 1, true))
        );
        assert_eq!(master.slave_states(), vec![(1, LinkState::AwaitResponse)]);
    }

    #[test]
    fn test_class2_spacing_and_fcb_toggle() {
        let now = Instant::now();
        let mut master = online(1, 3, now);

        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x7B, 1)));
        master.on_frame(reply(0x29, 1)); // no data, FCB echoed
        assert_eq!(master.slave_states(), vec![(1, LinkState::Idle)]);

        master.poll(now + Duration::from_secs(5));
        assert_eq!(master.poll_transmit(), None);
        assert_eq!(master.next_deadline(), Some(now + Duration::from_secs(10)));

        master.poll(now + Duration::from_secs(10));
        assert_eq!(master.poll_transmit(), Some(reply(0x5B, 1)));
        assert!(events(&mut master).is_empty());
    }

    #[test]
    fn test_stale_fcb_reply_discarded() {
        let now = Instant::now();
        let mut master = online(1, 3, now);

        master.poll(now);
        master.poll_transmit();
        master.on_frame(reply(0x29, 1));

        let later = now + Duration::from_secs(10);
        master.poll(later);
        assert_eq!(master.poll_transmit(), Some(reply(0x5B, 1)));

        // late duplicate answering the previous poll
        master.on_frame(data_reply(true, 1));
        assert!(events(&mut master).is_empty());
        assert_eq!(master.slave_states(), vec![(1, LinkState::AwaitResponse)]);

        master.on_frame(data_reply(false, 1));
        let received = events(&mut master);
        assert!(matches!(received[..], [LinkEvent::Asdu { slave: 1, .. }]));
        assert_eq!(
            master.slave_states(),
            vec![(1, LinkState::Polling(PollClass::Class1))]
        );

        // more data is fetched with class 1 right away
        master.poll(later);
        assert_eq!(master.poll_transmit(), Some(reply(0x7A, 1)));
    }

    #[test]
    fn test_retries_then_offline_and_revival() {
        let now = Instant::now();
        let mut master = online(1, 2, now);

        master.poll(now);
        let request = master.poll_transmit().unwrap();
        assert_eq!(request, reply(0x7B, 1));

        let mut at = now;
        for attempt in 1..=2 {
            at += Duration::from_secs(1);
            master.poll_timers(at);
            // retransmission keeps the FCB
            assert_eq!(master.poll_transmit(), Some(request.clone()));
            assert!(matches!(
                events(&mut master)[..],
                [LinkEvent::Retrying { slave: 1, attempt: a, .. }] if a == attempt
            ));
        }

        at += Duration::from_secs(1);
        master.poll_timers(at);
        let failed = events(&mut master);
        assert_eq!(failed.len(), 2);
        assert_eq!(
            failed[0],
            LinkEvent::StateChanged {
                slave: 1,
                state: LinkState::Offline
            }
        );
        assert!(matches!(failed[1], LinkEvent::Failed { slave: 1, .. }));

        master.poll(at + Duration::from_secs(60));
        assert_eq!(master.poll_transmit(), None);
        assert!(master.send_user_data(1, Bytes::from_static(&[1])).is_err());

        master.poll_slave(1).unwrap();
        master.poll(at);
        assert_eq!(master.poll_transmit(), Some(reply(0x40, 1)));
    }

    #[test]
    fn test_user_data_confirmed() {
        let now = Instant::now();
        let mut master = online(3, 3, now);
        let asdu = Bytes::from_static(&[0x2D, 0x01, 0x06, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x81]);

        master.send_user_data(3, asdu.clone()).unwrap();
        master.poll(now);
        assert_eq!(
            master.poll_transmit(),
            Some(Ft12Frame::user_data(3, true, asdu))
        );

        master.on_frame(Ft12Frame::SingleAck);
        assert_eq!(master.slave_states(), vec![(3, LinkState::Idle)]);

        // queue drained, next request is the class 2 poll with toggled FCB
        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x5B, 3)));
    }

    #[test]
    fn test_round_robin_over_slaves() {
        let now = Instant::now();
        let mut master = LinkMaster::new(params(3));
        master.add_slave(1).unwrap();
        master.add_slave(2).unwrap();

        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x40, 1)));
        master.poll(now);
        assert_eq!(master.poll_transmit(), None, "one request at a time");

        master.on_frame(Ft12Frame::SingleAck);
        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x40, 2)));
        master.on_frame(reply(0x0B, 2));

        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x7B, 1)));
        master.on_frame(reply(0x29, 1));
        master.poll(now);
        assert_eq!(master.poll_transmit(), Some(reply(0x7B, 2)));
    }

    #[test]
    fn test_reply_from_other_address_ignored() {
        let now = Instant::now();
        let mut master = online(1, 3, now);
        master.poll(now);
        master.poll_transmit();

        master.on_frame(reply(0x29, 9));
        assert_eq!(master.slave_states(), vec![(1, LinkState::AwaitResponse)]);
    }

    #[test]
    fn test_removed_slave_frame_not_sent() {
        let now = Instant::now();
        let mut master = LinkMaster::new(params(3));
        master.add_slave(1).unwrap();
        master.poll(now);

        // reset request queued but not yet written
        master.remove_slave(1).unwrap();
        assert_eq!(master.poll_transmit(), None);
        assert!(master.next_deadline().is_none());
    }

    #[test]
    fn test_slave_management() {
        let mut master = LinkMaster::new(params(3));
        assert!(master.add_slave(0).is_err());
        master.add_slave(5).unwrap();
        master.add_slave(5).unwrap();
        assert_eq!(master.slave_states().len(), 1);
        assert!(master.has_slave(5));

        assert!(master.poll_slave(6).is_err());
        assert!(master.send_user_data(6, Bytes::new()).is_err());
        master.remove_slave(5).unwrap();
        assert!(master.remove_slave(5).is_err());
        assert!(!master.has_slave(5));
    }
}
