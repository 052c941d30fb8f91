//! IEC 60870-5-104 transport layer.
//!
//! A synchronous state machine owning the sequence numbers, the k/w windows
//! and the t1/t2/t3 timers of one TCP connection. It performs no I/O: the
//! caller feeds received APDUs and the current time, then drains the frames
//! to transmit and sleeps until [`TransportLayer::next_deadline`].

use std::collections::VecDeque;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::codec::{Apdu, Iec104Codec};
use crate::config::TransportParams;
use crate::error::{Iec60870Error, Result};
use crate::types::{seq_add, seq_distance, Apci, UFunction, MAX_ASDU_LENGTH};

/// Which end of the connection this transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Controlling station, sends STARTDT/STOPDT
    Client,
    /// Controlled station, confirms STARTDT/STOPDT
    Server,
}

/// Data transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// I-frames not allowed
    Stopped,
    /// STARTDT act sent, waiting for con
    StartPending,
    /// I-frames flow in both directions
    Started,
    /// STOPDT act sent, waiting for con
    StopPending,
}

/// Something the application has to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Raw ASDU of an in-sequence I-frame
    Asdu(Bytes),
    /// Data transfer started
    Activated,
    /// Data transfer stopped
    Deactivated,
}

/// Window snapshot for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    /// Data transfer state
    pub state: TransportState,
    /// V(S)
    pub send_seq: u16,
    /// V(R)
    pub recv_seq: u16,
    /// I-frames sent but not yet acknowledged by the peer
    pub unacked_sent: u16,
    /// I-frames received but not yet acknowledged to the peer
    pub unacked_received: u16,
    /// k
    pub k: u16,
    /// w
    pub w: u16,
}

/// 104 transport state machine.
#[derive(Debug)]
pub struct TransportLayer {
    role: Role,
    params: TransportParams,
    state: TransportState,
    /// V(S)
    send_seq: u16,
    /// V(R)
    recv_seq: u16,
    /// Oldest sequence number not acknowledged by the peer
    ack_floor: u16,
    /// Send time of every unacknowledged I-frame, oldest first
    outstanding: VecDeque<Instant>,
    unacked_received: u16,
    t2_deadline: Option<Instant>,
    t3_deadline: Instant,
    /// STARTDT/STOPDT act waiting for its con
    pending_u: Option<(UFunction, Instant)>,
    /// TESTFR act waiting for its con
    pending_test: Option<Instant>,
    outbox: VecDeque<Apdu>,
}

impl TransportLayer {
    /// Create a transport for a freshly opened connection.
    pub fn new(role: Role, params: TransportParams, now: Instant) -> Self {
        Self {
            role,
            params,
            state: TransportState::Stopped,
            send_seq: 0,
            recv_seq: 0,
            ack_floor: 0,
            outstanding: VecDeque::new(),
            unacked_received: 0,
            t2_deadline: None,
            t3_deadline: now + params.t3,
            pending_u: None,
            pending_test: None,
            outbox: VecDeque::new(),
        }
    }

    /// Current data transfer state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Check whether I-frames may be exchanged.
    pub fn is_started(&self) -> bool {
        self.state == TransportState::Started
    }

    /// Queue STARTDT act. A no-op when already started, refused while a
    /// STOPDT act awaits its confirmation.
    pub fn start_dt(&mut self, now: Instant) -> Result<()> {
        if self.role != Role::Client {
            return Err(Iec60870Error::protocol("only the client sends STARTDT"));
        }
        match self.state {
            TransportState::Started | TransportState::StartPending => Ok(()),
            TransportState::StopPending => {
                Err(Iec60870Error::protocol("STOPDT confirmation pending"))
            }
            TransportState::Stopped => {
                self.state = TransportState::StartPending;
                self.send_u(UFunction::StartDtAct, now);
                Ok(())
            }
        }
    }

    /// Queue STOPDT act. A no-op when already stopped, refused while a
    /// STARTDT act awaits its confirmation.
    pub fn stop_dt(&mut self, now: Instant) -> Result<()> {
        if self.role != Role::Client {
            return Err(Iec60870Error::protocol("only the client sends STOPDT"));
        }
        match self.state {
            TransportState::Stopped | TransportState::StopPending => Ok(()),
            TransportState::StartPending => {
                Err(Iec60870Error::protocol("STARTDT confirmation pending"))
            }
            TransportState::Started => {
                self.state = TransportState::StopPending;
                self.send_u(UFunction::StopDtAct, now);
                Ok(())
            }
        }
    }

    /// Check whether another I-frame fits into the send window.
    pub fn can_send(&self) -> bool {
        self.is_started() && self.outstanding.len() < self.params.k as usize
    }

    /// Queue an I-frame carrying `asdu`.
    pub fn send_asdu(&mut self, asdu: Bytes, now: Instant) -> Result<()> {
        if !self.is_started() {
            return Err(Iec60870Error::NotConnected);
        }
        if self.outstanding.len() >= self.params.k as usize {
            return Err(Iec60870Error::WindowFull(self.params.k));
        }
        if asdu.is_empty() || asdu.len() > MAX_ASDU_LENGTH {
            return Err(Iec60870Error::malformed(format!(
                "ASDU of {} bytes does not fit an I-frame",
                asdu.len()
            )));
        }

        trace!(send_seq = self.send_seq, recv_seq = self.recv_seq, "Sending I-frame");
        self.outbox
            .push_back(Apdu::i_frame(self.send_seq, self.recv_seq, asdu));
        self.outstanding.push_back(now);
        self.send_seq = seq_add(self.send_seq, 1);

        // the I-frame carries our receive acknowledgment
        self.unacked_received = 0;
        self.t2_deadline = None;
        Ok(())
    }

    /// Process a received APDU.
    pub fn on_apdu(&mut self, apdu: Apdu, now: Instant) -> Result<Option<TransportEvent>> {
        self.t3_deadline = now + self.params.t3;

        match apdu.apci {
            Apci::IFrame { send_seq, recv_seq } => {
                if !matches!(
                    self.state,
                    TransportState::Started | TransportState::StopPending
                ) {
                    return Err(Iec60870Error::protocol(format!(
                        "I-frame received while data transfer is {:?}",
                        self.state
                    )));
                }
                self.acknowledge(recv_seq)?;
                if send_seq != self.recv_seq {
                    return Err(Iec60870Error::SequenceMismatch {
                        expected: self.recv_seq,
                        actual: send_seq,
                    });
                }
                let asdu = apdu
                    .asdu
                    .ok_or_else(|| Iec60870Error::invalid_frame("I-frame without ASDU"))?;

                self.recv_seq = seq_add(self.recv_seq, 1);
                self.unacked_received += 1;
                if self.unacked_received >= self.params.w {
                    self.send_ack();
                } else if self.t2_deadline.is_none() {
                    self.t2_deadline = Some(now + self.params.t2);
                }
                Ok(Some(TransportEvent::Asdu(asdu)))
            }
            Apci::SFrame { recv_seq } => {
                self.acknowledge(recv_seq)?;
                Ok(None)
            }
            Apci::UFrame { function } => Ok(self.on_u_frame(function)),
        }
    }

    fn on_u_frame(&mut self, function: UFunction) -> Option<TransportEvent> {
        match (function, self.role) {
            (UFunction::TestFrAct, _) => {
                self.outbox.push_back(Apdu::u_frame(UFunction::TestFrCon));
                None
            }
            (UFunction::TestFrCon, _) => {
                if self.pending_test.take().is_none() {
                    debug!("Unsolicited TESTFR con");
                }
                None
            }
            (UFunction::StartDtAct, Role::Server) => {
                self.outbox.push_back(Apdu::u_frame(UFunction::StartDtCon));
                let was_started = self.is_started();
                self.state = TransportState::Started;
                (!was_started).then_some(TransportEvent::Activated)
            }
            (UFunction::StopDtAct, Role::Server) => {
                // acknowledge everything received before confirming
                if self.unacked_received > 0 {
                    self.send_ack();
                }
                self.outbox.push_back(Apdu::u_frame(UFunction::StopDtCon));
                let was_started = self.is_started();
                self.state = TransportState::Stopped;
                was_started.then_some(TransportEvent::Deactivated)
            }
            (UFunction::StartDtCon, Role::Client) => match self.pending_u {
                Some((UFunction::StartDtAct, _)) => {
                    self.pending_u = None;
                    self.state = TransportState::Started;
                    Some(TransportEvent::Activated)
                }
                _ => {
                    debug!("Unexpected STARTDT con");
                    None
                }
            },
            (UFunction::StopDtCon, Role::Client) => match self.pending_u {
                Some((UFunction::StopDtAct, _)) => {
                    self.pending_u = None;
                    self.state = TransportState::Stopped;
                    Some(TransportEvent::Deactivated)
                }
                _ => {
                    debug!("Unexpected STOPDT con");
                    None
                }
            },
            (function, role) => {
                debug!(?function, ?role, "Ignoring U-frame not meant for this role");
                None
            }
        }
    }

    /// Fire expired timers. An error means the connection must be closed.
    pub fn poll_timers(&mut self, now: Instant) -> Result<()> {
        if let Some(sent_at) = self.outstanding.front() {
            if now >= *sent_at + self.params.t1 {
                warn!(
                    unacked = self.outstanding.len(),
                    "No acknowledgment for I-frame within t1"
                );
                return Err(Iec60870Error::T1Timeout);
            }
        }
        if let Some((function, deadline)) = self.pending_u {
            if now >= deadline {
                warn!(?function, "No confirmation within t1");
                return Err(Iec60870Error::T1Timeout);
            }
        }
        if let Some(deadline) = self.pending_test {
            if now >= deadline {
                warn!("No TESTFR con within t1");
                return Err(Iec60870Error::T1Timeout);
            }
        }

        if matches!(self.t2_deadline, Some(deadline) if now >= deadline) {
            self.send_ack();
        }

        if now >= self.t3_deadline {
            self.t3_deadline = now + self.params.t3;
            if self.pending_test.is_none() {
                trace!("Idle for t3, sending TESTFR act");
                self.outbox.push_back(Apdu::u_frame(UFunction::TestFrAct));
                self.pending_test = Some(now + self.params.t1);
            }
        }
        Ok(())
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Instant {
        let t1 = self.outstanding.front().map(|sent| *sent + self.params.t1);
        [
            t1,
            self.pending_u.map(|(_, deadline)| deadline),
            self.pending_test,
            self.t2_deadline,
        ]
        .into_iter()
        .flatten()
        .fold(self.t3_deadline, Instant::min)
    }

    /// Next frame to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Apdu> {
        self.outbox.pop_front()
    }

    /// Window snapshot.
    pub fn status(&self) -> WindowStatus {
        WindowStatus {
            state: self.state,
            send_seq: self.send_seq,
            recv_seq: self.recv_seq,
            unacked_sent: self.outstanding.len() as u16,
            unacked_received: self.unacked_received,
            k: self.params.k,
            w: self.params.w,
        }
    }

    fn send_u(&mut self, function: UFunction, now: Instant) {
        self.outbox.push_back(Apdu::u_frame(function));
        self.pending_u = Some((function, now + self.params.t1));
    }

    fn send_ack(&mut self) {
        trace!(recv_seq = self.recv_seq, "Sending S-frame");
        self.outbox.push_back(Apdu::s_frame(self.recv_seq));
        self.unacked_received = 0;
        self.t2_deadline = None;
    }

    /// Release every I-frame below `ack`.
    fn acknowledge(&mut self, ack: u16) -> Result<()> {
        let in_flight = seq_distance(self.ack_floor, self.send_seq);
        let acked = seq_distance(self.ack_floor, ack);
        if acked > in_flight {
            return Err(Iec60870Error::InvalidAck {
                ack,
                acked: self.ack_floor,
                send_seq: self.send_seq,
            });
        }
        for _ in 0..acked {
            self.outstanding.pop_front();
        }
        self.ack_floor = ack;
        Ok(())
    }
}

/// Write every frame queued in `transport` and flush once.
pub(crate) async fn write_pending<S>(
    framed: &mut Framed<S, Iec104Codec>,
    transport: &mut TransportLayer,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut written = false;
    while let Some(apdu) = transport.poll_transmit() {
        trace!(%apdu, "Sending");
        framed.feed(apdu).await?;
        written = true;
    }
    if written {
        framed.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
impl TransportLayer {
    fn with_sequence(mut self, send_seq: u16, recv_seq: u16) -> Self {
        self.send_seq = send_seq;
        self.ack_floor = send_seq;
        self.recv_seq = recv_seq;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn params(k: u16, w: u16) -> TransportParams {
        TransportParams {
            k,
            w,
            t0: Duration::from_secs(30),
            t1: Duration::from_secs(15),
            t2: Duration::from_secs(10),
            t3: Duration::from_secs(20),
        }
    }

    fn drain(transport: &mut TransportLayer) -> Vec<Apdu> {
        std::iter::from_fn(|| transport.poll_transmit()).collect()
    }

    fn started_client(k: u16, w: u16, now: Instant) -> TransportLayer {
        let mut transport = TransportLayer::new(Role::Client, params(k, w), now);
        transport.start_dt(now).unwrap();
        transport
            .on_apdu(Apdu::u_frame(UFunction::StartDtCon), now)
            .unwrap();
        drain(&mut transport);
        transport
    }

    fn asdu() -> Bytes {
        Bytes::from_static(&[0x01, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01])
    }

    #[test]
    fn test_startdt_handshake() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Client, params(12, 8), now);
        assert!(!transport.can_send());

        transport.start_dt(now).unwrap();
        assert_eq!(transport.state(), TransportState::StartPending);
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::u_frame(UFunction::StartDtAct)]
        );

        let event = transport
            .on_apdu(Apdu::u_frame(UFunction::StartDtCon), now)
            .unwrap();
        assert_eq!(event, Some(TransportEvent::Activated));
        assert!(transport.can_send());

        transport.stop_dt(now).unwrap();
        assert!(!transport.can_send());
        let event = transport
            .on_apdu(Apdu::u_frame(UFunction::StopDtCon), now)
            .unwrap();
        assert_eq!(event, Some(TransportEvent::Deactivated));
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[test]
    fn test_opposite_handshake_refused_while_pending() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Client, params(12, 8), now);
        transport.start_dt(now).unwrap();
        assert!(transport.stop_dt(now).is_err());
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::u_frame(UFunction::StartDtAct)]
        );

        // the STARTDT con still matches
        let event = transport
            .on_apdu(Apdu::u_frame(UFunction::StartDtCon), now)
            .unwrap();
        assert_eq!(event, Some(TransportEvent::Activated));

        transport.stop_dt(now).unwrap();
        assert!(transport.start_dt(now).is_err());
        assert_eq!(transport.state(), TransportState::StopPending);
    }

    #[test]
    fn test_startdt_con_timeout() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Client, params(12, 8), now);
        transport.start_dt(now).unwrap();
        assert_eq!(transport.next_deadline(), now + Duration::from_secs(15));

        assert!(transport.poll_timers(now + Duration::from_secs(14)).is_ok());
        assert!(matches!(
            transport.poll_timers(now + Duration::from_secs(15)),
            Err(Iec60870Error::T1Timeout)
        ));
    }

    #[test]
    fn test_send_window_backpressure() {
        let now = Instant::now();
        let mut transport = started_client(2, 1, now);

        transport.send_asdu(asdu(), now).unwrap();
        transport.send_asdu(asdu(), now).unwrap();
        assert!(!transport.can_send());
        assert!(matches!(
            transport.send_asdu(asdu(), now),
            Err(Iec60870Error::WindowFull(2))
        ));
        assert_eq!(drain(&mut transport).len(), 2);

        transport.on_apdu(Apdu::s_frame(1), now).unwrap();
        assert!(transport.can_send());
        assert_eq!(transport.status().unacked_sent, 1);

        transport.send_asdu(asdu(), now).unwrap();
        let frames = drain(&mut transport);
        assert_eq!(frames[0].apci, Apci::i_frame(2, 0));
    }

    #[test]
    fn test_forced_ack_after_w_frames() {
        let now = Instant::now();
        let mut transport = started_client(12, 3, now);

        for seq in 0..3 {
            let event = transport
                .on_apdu(Apdu::i_frame(seq, 0, asdu()), now)
                .unwrap();
            assert!(matches!(event, Some(TransportEvent::Asdu(_))));
        }

        let frames = drain(&mut transport);
        assert_eq!(frames, vec![Apdu::s_frame(3)]);
        assert_eq!(transport.status().unacked_received, 0);
    }

    #[test]
    fn test_t2_ack_when_idle() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now);

        transport
            .on_apdu(Apdu::i_frame(0, 0, asdu()), now)
            .unwrap();
        assert_eq!(transport.next_deadline(), now + Duration::from_secs(10));

        transport
            .poll_timers(now + Duration::from_secs(10))
            .unwrap();
        assert_eq!(drain(&mut transport), vec![Apdu::s_frame(1)]);
    }

    #[test]
    fn test_i_frame_piggybacks_ack() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now);

        transport
            .on_apdu(Apdu::i_frame(0, 0, asdu()), now)
            .unwrap();
        transport.send_asdu(asdu(), now).unwrap();

        assert_eq!(drain(&mut transport)[0].apci, Apci::i_frame(0, 1));
        transport
            .poll_timers(now + Duration::from_secs(11))
            .unwrap();
        assert!(drain(&mut transport).is_empty());
    }

    #[test]
    fn test_sequence_wraparound() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now).with_sequence(32767, 32767);

        transport.send_asdu(asdu(), now).unwrap();
        transport.send_asdu(asdu(), now).unwrap();
        let frames = drain(&mut transport);
        assert_eq!(frames[0].apci, Apci::i_frame(32767, 32767));
        assert_eq!(frames[1].apci, Apci::i_frame(0, 32767));

        // peer acknowledges both across the wrap
        transport
            .on_apdu(Apdu::i_frame(32767, 1, asdu()), now)
            .unwrap();
        let status = transport.status();
        assert_eq!(status.unacked_sent, 0);
        assert_eq!(status.recv_seq, 0);
        assert_eq!(status.send_seq, 1);
    }

    #[test]
    fn test_invalid_ack_rejected() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now);
        transport.send_asdu(asdu(), now).unwrap();

        let err = transport.on_apdu(Apdu::s_frame(2), now).unwrap_err();
        assert!(matches!(
            err,
            Iec60870Error::InvalidAck {
                ack: 2,
                acked: 0,
                send_seq: 1
            }
        ));
    }

    #[test]
    fn test_sequence_mismatch() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now);

        let err = transport
            .on_apdu(Apdu::i_frame(5, 0, asdu()), now)
            .unwrap_err();
        assert!(matches!(
            err,
            Iec60870Error::SequenceMismatch {
                expected: 0,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_t1_timeout_on_unacked_i_frame() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now);
        transport.send_asdu(asdu(), now).unwrap();

        assert_eq!(transport.next_deadline(), now + Duration::from_secs(15));
        assert!(matches!(
            transport.poll_timers(now + Duration::from_secs(15)),
            Err(Iec60870Error::T1Timeout)
        ));
    }

    #[test]
    fn test_t3_test_frame_then_t1() {
        let now = Instant::now();
        let mut transport = started_client(12, 8, now);

        let idle = now + Duration::from_secs(20);
        assert_eq!(transport.next_deadline(), idle);
        transport.poll_timers(idle).unwrap();
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::u_frame(UFunction::TestFrAct)]
        );

        // con arrives in time
        transport
            .on_apdu(Apdu::u_frame(UFunction::TestFrCon), idle + Duration::from_secs(1))
            .unwrap();
        transport
            .poll_timers(idle + Duration::from_secs(16))
            .unwrap();

        // next idle period, no answer
        let idle = idle + Duration::from_secs(21);
        transport.poll_timers(idle).unwrap();
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::u_frame(UFunction::TestFrAct)]
        );
        assert!(matches!(
            transport.poll_timers(idle + Duration::from_secs(15)),
            Err(Iec60870Error::T1Timeout)
        ));
    }

    #[test]
    fn test_answers_test_frame() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Client, params(12, 8), now);
        transport
            .on_apdu(Apdu::u_frame(UFunction::TestFrAct), now)
            .unwrap();
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::u_frame(UFunction::TestFrCon)]
        );
    }

    #[test]
    fn test_server_confirms_startdt_and_stopdt() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Server, params(12, 8), now);

        let err = transport
            .on_apdu(Apdu::i_frame(0, 0, asdu()), now)
            .unwrap_err();
        assert!(matches!(err, Iec60870Error::Protocol(_)));

        let event = transport
            .on_apdu(Apdu::u_frame(UFunction::StartDtAct), now)
            .unwrap();
        assert_eq!(event, Some(TransportEvent::Activated));
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::u_frame(UFunction::StartDtCon)]
        );

        transport
            .on_apdu(Apdu::i_frame(0, 0, asdu()), now)
            .unwrap();
        let event = transport
            .on_apdu(Apdu::u_frame(UFunction::StopDtAct), now)
            .unwrap();
        assert_eq!(event, Some(TransportEvent::Deactivated));
        assert_eq!(
            drain(&mut transport),
            vec![Apdu::s_frame(1), Apdu::u_frame(UFunction::StopDtCon)]
        );
        assert!(transport.start_dt(now).is_err());
    }

    #[test]
    fn test_client_ignores_unexpected_con() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Client, params(12, 8), now);
        let event = transport
            .on_apdu(Apdu::u_frame(UFunction::StartDtCon), now)
            .unwrap();
        assert_eq!(event, None);
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn test_write_pending_flushes_queued_frames() {
        let now = Instant::now();
        let mut transport = TransportLayer::new(Role::Client, params(12, 8), now);
        transport.start_dt(now).unwrap();

        let io = tokio_test::io::Builder::new()
            .write(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00])
            .build();
        let mut framed = Framed::new(io, Iec104Codec::new());
        write_pending(&mut framed, &mut transport).await.unwrap();
        assert!(transport.poll_transmit().is_none());

        // nothing queued, nothing written
        write_pending(&mut framed, &mut transport).await.unwrap();
    }
}
