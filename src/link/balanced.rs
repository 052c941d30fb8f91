//! Balanced 101 link: one remote station, either side may initiate.
//!
//! The controlling station runs its primary procedure (request link status,
//! reset remote link, then user data and an idle test function) while it
//! answers the remote's primary frames as secondary station. Every frame it
//! sends carries DIR=1; frames on the line with DIR=1 are its own echo.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::frame::{Ft12Frame, PrimaryFunction, SecondaryFunction};
use super::master::{FrameCountBit, LinkEvent, LinkParams, LinkState};
use crate::error::{Iec60870Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primary {
    RequestStatus,
    ResetLink,
    Available,
    Failed { retry_at: Instant },
}

impl Primary {
    fn reported(self) -> LinkState {
        match self {
            Self::RequestStatus | Self::ResetLink => LinkState::Resetting,
            Self::Available => LinkState::Idle,
            Self::Failed { .. } => LinkState::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Status,
    Reset,
    UserData,
    Test,
}

#[derive(Debug)]
struct Outstanding {
    kind: RequestKind,
    frame: Ft12Frame,
    deadline: Instant,
    attempt: u32,
}

/// Balanced link to a single remote station.
///
/// Timers: t0 bounds the link status and reset exchange and is also the pause
/// before a failed link is set up again, t1 bounds every other reply and t2
/// is the idle time after which a test function is sent.
#[derive(Debug)]
pub struct LinkBalanced {
    params: LinkParams,
    address: u8,
    primary: Primary,
    reported: LinkState,
    fcb: FrameCountBit,
    /// FCB of the last accepted remote frame, `None` after a remote reset
    remote_fcb: Option<bool>,
    next_test: Option<Instant>,
    user_data: VecDeque<Bytes>,
    outstanding: Option<Outstanding>,
    outbox: VecDeque<Ft12Frame>,
    events: VecDeque<LinkEvent>,
}

impl LinkBalanced {
    /// Create the link; setup starts with the first `poll`.
    pub fn new(params: LinkParams, address: u8) -> Self {
        let mut events = VecDeque::new();
        events.push_back(LinkEvent::StateChanged {
            slave: address,
            state: LinkState::Resetting,
        });
        Self {
            params,
            address,
            primary: Primary::RequestStatus,
            reported: LinkState::Resetting,
            fcb: FrameCountBit::Reset,
            remote_fcb: None,
            next_test: None,
            user_data: VecDeque::new(),
            outstanding: None,
            outbox: VecDeque::new(),
            events,
        }
    }

    /// Link address of the remote station.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Resetting, online (`Idle`) or offline.
    pub fn state(&self) -> LinkState {
        self.reported
    }

    /// Queue an ASDU for "user data, confirm expected".
    pub fn send_user_data(&mut self, asdu: Bytes) -> Result<()> {
        if matches!(self.primary, Primary::Failed { .. }) {
            return Err(Iec60870Error::NotConnected);
        }
        self.user_data.push_back(asdu);
        Ok(())
    }

    /// Set up a failed link right away instead of waiting for t0.
    pub fn restart(&mut self) {
        if matches!(self.primary, Primary::Failed { .. }) {
            self.fcb = FrameCountBit::Reset;
            self.set_primary(Primary::RequestStatus);
        }
    }

    /// Forget all link state after the port was reopened.
    pub fn reset(&mut self) {
        self.outstanding = None;
        self.outbox.clear();
        self.user_data.clear();
        self.fcb = FrameCountBit::Reset;
        self.remote_fcb = None;
        self.next_test = None;
        self.set_primary(Primary::RequestStatus);
    }

    /// Send the next primary request when none is outstanding.
    pub fn poll(&mut self, now: Instant) {
        if self.outstanding.is_some() {
            return;
        }
        let kind = match self.primary {
            Primary::RequestStatus => RequestKind::Status,
            Primary::ResetLink => RequestKind::Reset,
            Primary::Failed { retry_at } => {
                if now < retry_at {
                    return;
                }
                debug!(link = self.address, "Setting up link again");
                self.fcb = FrameCountBit::Reset;
                self.set_primary(Primary::RequestStatus);
                RequestKind::Status
            }
            Primary::Available if !self.user_data.is_empty() => RequestKind::UserData,
            Primary::Available => match self.next_test {
                Some(at) if now >= at => RequestKind::Test,
                Some(_) => return,
                None => {
                    self.next_test = Some(now + self.params.t2);
                    return;
                }
            },
        };
        self.transmit(kind, now);
    }

    fn transmit(&mut self, kind: RequestKind, now: Instant) {
        let address = self.address;
        let frame = match kind {
            RequestKind::Status => {
                Ft12Frame::request(PrimaryFunction::RequestLinkStatus, address, false)
            }
            RequestKind::Reset => {
                Ft12Frame::request(PrimaryFunction::ResetRemoteLink, address, false)
            }
            RequestKind::UserData => {
                let asdu = self.user_data.front().cloned().unwrap_or_default();
                Ft12Frame::user_data(address, self.fcb.cycle(), asdu)
            }
            RequestKind::Test => {
                Ft12Frame::request(PrimaryFunction::TestLink, address, self.fcb.cycle())
            }
        }
        .with_direction();

        trace!(link = address, ?kind, "Sending link request");
        self.outbox.push_back(frame.clone());
        self.outstanding = Some(Outstanding {
            kind,
            frame,
            deadline: now + self.reply_timeout(kind),
            attempt: 0,
        });
    }

    fn reply_timeout(&self, kind: RequestKind) -> std::time::Duration {
        match kind {
            RequestKind::Status | RequestKind::Reset => self.params.t0,
            RequestKind::UserData | RequestKind::Test => self.params.t1,
        }
    }

    /// Process a frame read from the line.
    pub fn on_frame(&mut self, frame: Ft12Frame) {
        if frame.address().is_some_and(|a| a != self.address) {
            debug!(expected = self.address, ?frame, "Frame for other link address");
            return;
        }
        if frame.direction() == Some(true) {
            trace!("Ignoring frame sent in our direction");
            return;
        }
        if frame.is_primary() {
            self.serve(frame);
        } else {
            self.on_reply(frame);
        }
    }

    /// Answer a primary frame of the remote station.
    fn serve(&mut self, frame: Ft12Frame) {
        let response = match frame.primary_function() {
            Some(PrimaryFunction::ResetRemoteLink) => {
                debug!(link = self.address, "Remote station reset our link");
                self.remote_fcb = None;
                Some(SecondaryFunction::Ack)
            }
            Some(PrimaryFunction::ResetUserProcess) => Some(SecondaryFunction::Ack),
            Some(PrimaryFunction::TestLink) => {
                self.accept_fcb(&frame);
                Some(SecondaryFunction::Ack)
            }
            Some(PrimaryFunction::UserData) => {
                if self.accept_fcb(&frame) {
                    self.deliver(frame);
                } else {
                    debug!(link = self.address, "Repeated user data, acknowledging again");
                }
                Some(SecondaryFunction::Ack)
            }
            Some(PrimaryFunction::UserDataNoReply) => {
                self.deliver(frame);
                None
            }
            Some(PrimaryFunction::RequestLinkStatus) => Some(SecondaryFunction::LinkStatus),
            function => {
                debug!(?function, "Link service not supported on a balanced line");
                Some(SecondaryFunction::NotImplemented)
            }
        };
        if let Some(function) = response {
            self.outbox
                .push_back(Ft12Frame::response(function, self.address).with_direction());
        }
    }

    /// Check the FCB of a remote frame; `false` for a repetition.
    fn accept_fcb(&mut self, frame: &Ft12Frame) -> bool {
        if frame.fcv() != Some(true) {
            return true;
        }
        let fcb = frame.fcb() == Some(true);
        if self.remote_fcb == Some(fcb) {
            return false;
        }
        self.remote_fcb = Some(fcb);
        true
    }

    fn deliver(&mut self, frame: Ft12Frame) {
        if let Ft12Frame::Variable { asdu, .. } = frame {
            self.events.push_back(LinkEvent::Asdu {
                slave: self.address,
                asdu,
            });
        }
    }

    fn on_reply(&mut self, frame: Ft12Frame) {
        let Some(outstanding) = self.outstanding.take() else {
            debug!(?frame, "Reply without outstanding request");
            return;
        };

        match (outstanding.kind, frame.secondary_function()) {
            (RequestKind::Status, Some(SecondaryFunction::LinkStatus)) => {
                debug!(link = self.address, "Remote link available, resetting it");
                self.set_primary(Primary::ResetLink);
            }
            (RequestKind::Reset, Some(SecondaryFunction::Ack)) => {
                debug!(link = self.address, "Link reset confirmed");
                self.fcb = FrameCountBit::Reset;
                self.next_test = None;
                self.set_primary(Primary::Available);
            }
            (RequestKind::UserData, Some(SecondaryFunction::Ack)) => {
                self.user_data.pop_front();
                self.next_test = None;
            }
            (RequestKind::UserData, Some(SecondaryFunction::Nack)) => {
                warn!(link = self.address, "User data not accepted, dropping it");
                self.user_data.pop_front();
                self.next_test = None;
            }
            (RequestKind::Test, Some(SecondaryFunction::Ack | SecondaryFunction::Nack)) => {
                self.next_test = None;
            }
            (kind, function) => {
                debug!(?kind, ?function, "Unexpected reply, still waiting");
                self.outstanding = Some(outstanding);
            }
        }
    }

    /// Retransmit or give up on an unanswered request.
    pub fn poll_timers(&mut self, now: Instant) {
        let Some(outstanding) = self.outstanding.as_ref() else {
            return;
        };
        if now < outstanding.deadline {
            return;
        }
        let timeout = self.reply_timeout(outstanding.kind);
        let address = self.address;

        if let Some(outstanding) = self
            .outstanding
            .as_mut()
            .filter(|o| o.attempt < self.params.retries)
        {
            outstanding.attempt += 1;
            outstanding.deadline = now + timeout;
            let attempt = outstanding.attempt;
            warn!(link = address, attempt, "No reply, retransmitting");
            self.outbox.push_back(outstanding.frame.clone());
            self.events.push_back(LinkEvent::Retrying {
                slave: address,
                attempt,
                reason: format!("no reply from link {} within {:?}", address, timeout),
            });
            return;
        }

        self.outstanding = None;
        let reason = format!(
            "link {} did not answer after {} retries",
            address, self.params.retries
        );
        warn!(link = address, "{}", reason);
        self.user_data.clear();
        self.set_primary(Primary::Failed {
            retry_at: now + self.params.t0,
        });
        self.events.push_back(LinkEvent::Failed {
            slave: address,
            reason,
        });
    }

    /// When `poll_timers` or `poll` next has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        if let Some(outstanding) = &self.outstanding {
            return Some(outstanding.deadline);
        }
        match self.primary {
            Primary::Failed { retry_at } => Some(retry_at),
            Primary::Available if self.user_data.is_empty() => self.next_test,
            _ => None,
        }
    }

    /// Next frame to write.
    pub fn poll_transmit(&mut self) -> Option<Ft12Frame> {
        self.outbox.pop_front()
    }

    /// Next event for the application.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn set_primary(&mut self, primary: Primary) {
        self.primary = primary;
        let reported = primary.reported();
        if reported != self.reported {
            self.reported = reported;
            self.events.push_back(LinkEvent::StateChanged {
                slave: self.address,
                state: reported,
            });
        }
    }
}
