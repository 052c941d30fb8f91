//! Command queue with select-before-operate.
//!
//! Commands are admitted in batches, queued in submission order and sent one
//! at a time. Each command completes exactly once with a [`CommandOutcome`].
//! The dispatcher is shared by the 104 client and the 101 master and does no
//! I/O itself.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Iec60870Error, Result};
use crate::types::{
    f32_to_normalized, Asdu, AsduHeader, Cot, Cp56Time2a, InformationElement,
    InformationObject, Ioa, TypeId,
};

/// Global common address; every station confirms on its own address.
const GLOBAL_ADDRESS: u16 = 0xFFFF;

/// Default qualifier of interrogation: station interrogation.
pub const DEFAULT_QOI: u8 = 20;
/// Default qualifier of counter interrogation: general request, no freeze.
pub const DEFAULT_QCC: u8 = 5;
/// Default qualifier of reset process: general reset.
pub const DEFAULT_QRP: u8 = 1;
/// Fixed test bit pattern of C_TS_NA_1.
pub const TEST_PATTERN: u16 = 0xAA55;

/// Identifier returned on admission and repeated in the completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Positive activation confirmation received
    Confirmed,
    /// Negative confirmation or unknown type/cause/address/IOA
    Rejected,
    /// No confirmation within the command timeout
    Timeout,
    /// Flushed by disconnect or connection loss
    Cancelled,
}

impl CommandOutcome {
    /// Check for a positive outcome.
    pub fn is_success(&self) -> bool {
        *self == Self::Confirmed
    }
}

/// Command value as supplied by the application.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CommandValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    #[default]
    None,
}

/// One command to send.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Control-direction type identification
    pub type_id: TypeId,
    /// Information object address
    pub ioa: u32,
    /// Value, interpreted per type
    pub value: CommandValue,
    /// Select before operate
    pub select: bool,
    /// QU, QOS or the system command qualifier
    pub qualifier: u8,
    /// Station (common) address, connection default if `None`
    pub station_address: Option<u16>,
    /// Time tag for time-tagged types and clock sync, `now` if `None`
    pub timestamp: Option<Cp56Time2a>,
}

impl CommandRequest {
    /// Create a command for `type_id` at `ioa`.
    pub fn new(type_id: TypeId, ioa: u32, value: CommandValue) -> Self {
        Self {
            type_id,
            ioa,
            value,
            select: false,
            qualifier: 0,
            station_address: None,
            timestamp: None,
        }
    }

    /// Single command.
    pub fn single(ioa: u32, on: bool) -> Self {
        Self::new(TypeId::SingleCommand, ioa, CommandValue::Bool(on))
    }

    /// Double command, `on` maps to DCS 2 and off to DCS 1.
    pub fn double(ioa: u32, on: bool) -> Self {
        Self::new(TypeId::DoubleCommand, ioa, CommandValue::Bool(on))
    }

    /// Short floating point set-point.
    pub fn setpoint_float(ioa: u32, value: f32) -> Self {
        Self::new(TypeId::SetpointFloat, ioa, CommandValue::Float(value as f64))
    }

    /// Station interrogation.
    pub fn interrogation() -> Self {
        Self::new(TypeId::InterrogationCommand, 0, CommandValue::None)
    }

    /// General counter interrogation.
    pub fn counter_interrogation() -> Self {
        Self::new(TypeId::CounterInterrogation, 0, CommandValue::None)
    }

    /// Clock synchronisation with the current time unless a timestamp is set.
    pub fn clock_sync() -> Self {
        Self::new(TypeId::ClockSync, 0, CommandValue::None)
    }

    /// Set the select flag.
    pub fn select(mut self, select: bool) -> Self {
        self.select = select;
        self
    }

    /// Set the qualifier.
    pub fn qualifier(mut self, qualifier: u8) -> Self {
        self.qualifier = qualifier;
        self
    }

    /// Set the station address.
    pub fn station(mut self, address: u16) -> Self {
        self.station_address = Some(address);
        self
    }

    /// Set an explicit time tag.
    pub fn timestamp(mut self, time: Cp56Time2a) -> Self {
        self.timestamp = Some(time);
        self
    }

    /// Check whether this command goes through select-before-operate.
    pub fn uses_select(&self) -> bool {
        self.select && self.type_id.supports_select()
    }

    /// Check type, IOA and value without building anything.
    pub fn validate(&self) -> Result<()> {
        self.element(false).map(|_| ())
    }

    /// Build the information element; `select` sets the S/E bit.
    pub fn element(&self, select: bool) -> Result<InformationElement> {
        use TypeId::*;

        if !self.type_id.is_control() {
            return Err(Iec60870Error::invalid_command(format!(
                "{} is not a command type",
                self.type_id
            )));
        }
        if Ioa::new(self.ioa).is_none() {
            return Err(Iec60870Error::invalid_command(format!(
                "IOA {} exceeds 24 bits",
                self.ioa
            )));
        }

        let select = select && self.type_id.supports_select();
        let qualifier = self.qualifier;
        let element = match self.type_id {
            SingleCommand | SingleCommandTime56 => InformationElement::SingleCommand {
                state: self.bool_value()?,
                select,
                qualifier,
            },
            DoubleCommand | DoubleCommandTime56 => InformationElement::DoubleCommand {
                state: self.state_value()?,
                select,
                qualifier,
            },
            RegulatingStep | RegulatingStepTime56 => InformationElement::RegulatingStep {
                state: self.state_value()?,
                select,
                qualifier,
            },
            SetpointNormalized | SetpointNormalizedTime56 => {
                let value = self.float_value()?;
                if !(-1.0..=1.0).contains(&value) {
                    return Err(self.out_of_range("-1.0..=1.0"));
                }
                InformationElement::SetpointNormalized {
                    value: f32_to_normalized(value as f32),
                    select,
                    qualifier,
                }
            }
            SetpointScaled | SetpointScaledTime56 => InformationElement::SetpointScaled {
                value: self.int_value(i16::MIN as i64, i16::MAX as i64)? as i16,
                select,
                qualifier,
            },
            SetpointFloat | SetpointFloatTime56 => InformationElement::SetpointFloat {
                value: self.float_value()? as f32,
                select,
                qualifier,
            },
            Bitstring32Command | Bitstring32CommandTime56 => {
                InformationElement::Bitstring32Command {
                    value: self.int_value(0, u32::MAX as i64)? as u32,
                }
            }
            InterrogationCommand => InformationElement::Interrogation {
                qualifier: self.system_qualifier(DEFAULT_QOI)?,
            },
            CounterInterrogation => InformationElement::CounterInterrogation {
                qualifier: self.system_qualifier(DEFAULT_QCC)?,
            },
            ReadCommand => InformationElement::Read,
            ClockSync => InformationElement::ClockSync {
                time: self.time(),
            },
            TestCommand => InformationElement::TestCommand {
                pattern: TEST_PATTERN,
            },
            ResetProcess => InformationElement::ResetProcess {
                qualifier: self.system_qualifier(DEFAULT_QRP)?,
            },
            TestCommandTime56 => InformationElement::TestCommandTime {
                counter: match self.value {
                    CommandValue::None => 0,
                    _ => self.int_value(0, u16::MAX as i64)? as u16,
                },
            },
            other => {
                return Err(Iec60870Error::invalid_command(format!(
                    "{} cannot be sent as a command",
                    other
                )))
            }
        };
        Ok(element)
    }

    /// Build the activation ASDU.
    pub fn to_asdu(&self, common_address: u16, originator: u8, select: bool) -> Result<Asdu> {
        let element = self.element(select)?;
        let mut object = InformationObject::new(Ioa(self.ioa), element);
        if self.type_id.has_time_tag() {
            object = object.with_time(self.time());
        }
        let header = AsduHeader::new(self.type_id, Cot::Activation, common_address)
            .with_originator(originator);
        Ok(Asdu::single(header, object))
    }

    fn time(&self) -> Cp56Time2a {
        self.timestamp.unwrap_or_else(Cp56Time2a::now)
    }

    fn bool_value(&self) -> Result<bool> {
        match self.value {
            CommandValue::Bool(b) => Ok(b),
            CommandValue::Int(0) => Ok(false),
            CommandValue::Int(1) => Ok(true),
            _ => Err(self.out_of_range("a boolean")),
        }
    }

    /// DCS/RCS state, a boolean maps to 2 (on/higher) and 1 (off/lower).
    fn state_value(&self) -> Result<u8> {
        match self.value {
            CommandValue::Bool(true) => Ok(2),
            CommandValue::Bool(false) => Ok(1),
            _ => self.int_value(0, 3).map(|v| v as u8),
        }
    }

    fn int_value(&self, min: i64, max: i64) -> Result<i64> {
        let value = match self.value {
            CommandValue::Int(v) => v,
            CommandValue::Float(f) if f.fract() == 0.0 && f.is_finite() => f as i64,
            _ => return Err(self.out_of_range(&format!("an integer in {}..={}", min, max))),
        };
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(self.out_of_range(&format!("{}..={}", min, max)))
        }
    }

    fn float_value(&self) -> Result<f64> {
        match self.value {
            CommandValue::Float(f) if f.is_finite() => Ok(f),
            CommandValue::Int(i) => Ok(i as f64),
            _ => Err(self.out_of_range("a finite number")),
        }
    }

    fn system_qualifier(&self, default: u8) -> Result<u8> {
        match self.value {
            CommandValue::None if self.qualifier == 0 => Ok(default),
            CommandValue::None => Ok(self.qualifier),
            _ => self.int_value(0, u8::MAX as i64).map(|v| v as u8),
        }
    }

    fn out_of_range(&self, expected: &str) -> Iec60870Error {
        Iec60870Error::invalid_command(format!(
            "{} at IOA {}: value {:?} is not {}",
            self.type_id, self.ioa, self.value, expected
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Select,
    Execute,
    Direct,
}

#[derive(Debug)]
struct Queued {
    id: CommandId,
    request: CommandRequest,
    common_address: u16,
}

#[derive(Debug)]
struct InFlight {
    command: Queued,
    phase: Phase,
    /// Execute confirmed select, not yet transmitted
    pending_send: bool,
    deadline: Instant,
}

/// Per-connection command queue.
#[derive(Debug)]
pub struct CommandDispatcher {
    queue: VecDeque<Queued>,
    capacity: usize,
    timeout: Duration,
    originator: u8,
    common_address: u16,
    next_id: u64,
    in_flight: Option<InFlight>,
    completed: VecDeque<(CommandId, CommandOutcome)>,
}

impl CommandDispatcher {
    /// Create a dispatcher.
    pub fn new(capacity: usize, timeout: Duration, originator: u8, common_address: u16) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            timeout,
            originator,
            common_address,
            next_id: 1,
            in_flight: None,
            completed: VecDeque::new(),
        }
    }

    /// Admit a batch: every command is queued or none is.
    pub fn submit(&mut self, batch: Vec<CommandRequest>) -> Result<Vec<CommandId>> {
        for request in &batch {
            request.validate()?;
        }
        if self.pending() + batch.len() > self.capacity {
            return Err(Iec60870Error::QueueFull(self.capacity));
        }

        let ids = batch
            .into_iter()
            .map(|request| {
                let id = CommandId(self.next_id);
                self.next_id += 1;
                let common_address = request.station_address.unwrap_or(self.common_address);
                debug!(%id, type_id = %request.type_id, ioa = request.ioa, "Command queued");
                self.queue.push_back(Queued {
                    id,
                    request,
                    common_address,
                });
                id
            })
            .collect();
        Ok(ids)
    }

    /// Next activation ASDU to transmit, if the queue may advance.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Asdu> {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.pending_send {
                return None;
            }
            in_flight.pending_send = false;
            in_flight.deadline = now + self.timeout;
            let command = &in_flight.command;
            match command
                .request
                .to_asdu(command.common_address, self.originator, false)
            {
                Ok(asdu) => return Some(asdu),
                Err(e) => {
                    warn!(id = %command.id, "Cannot build execute: {}", e);
                    self.finish(CommandOutcome::Rejected);
                }
            }
        }

        while let Some(command) = self.queue.pop_front() {
            let phase = if command.request.uses_select() {
                Phase::Select
            } else {
                Phase::Direct
            };
            let asdu = match command.request.to_asdu(
                command.common_address,
                self.originator,
                phase == Phase::Select,
            ) {
                Ok(asdu) => asdu,
                Err(e) => {
                    warn!(id = %command.id, "Cannot build command: {}", e);
                    self.completed
                        .push_back((command.id, CommandOutcome::Rejected));
                    continue;
                }
            };

            if command.request.type_id == TypeId::ReadCommand {
                // read has no activation confirmation
                self.completed
                    .push_back((command.id, CommandOutcome::Confirmed));
            } else {
                self.in_flight = Some(InFlight {
                    command,
                    phase,
                    pending_send: false,
                    deadline: now + self.timeout,
                });
            }
            return Some(asdu);
        }
        None
    }

    /// Offer a received ASDU. Returns `true` when it confirmed the command
    /// in flight and must not be surfaced again.
    pub fn on_asdu(&mut self, asdu: &Asdu) -> bool {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return false;
        };
        let request = &in_flight.command.request;
        let cot = asdu.header.cot;
        // the S/E bit of the reply tells a select confirmation from an
        // execute confirmation
        let selecting = in_flight.phase == Phase::Select;
        let matches = asdu.type_id() == request.type_id
            && (asdu.header.common_address == in_flight.command.common_address
                || in_flight.command.common_address == GLOBAL_ADDRESS)
            && asdu.objects.first().is_some_and(|o| {
                o.ioa.value() == request.ioa && o.element.is_select() == selecting
            })
            && (cot == Cot::ActivationConfirm || cot.is_negative());
        if !matches || in_flight.pending_send {
            return false;
        }

        let id = in_flight.command.id;
        if asdu.header.negative || cot.is_negative() {
            debug!(%id, %cot, "Command rejected");
            self.finish(CommandOutcome::Rejected);
        } else if in_flight.phase == Phase::Select {
            debug!(%id, "Select confirmed, executing");
            in_flight.phase = Phase::Execute;
            in_flight.pending_send = true;
        } else {
            debug!(%id, "Command confirmed");
            self.finish(CommandOutcome::Confirmed);
        }
        true
    }

    /// Time out the command in flight.
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(in_flight) = &self.in_flight {
            if !in_flight.pending_send && now >= in_flight.deadline {
                warn!(
                    id = %in_flight.command.id,
                    phase = ?in_flight.phase,
                    "No confirmation within command timeout"
                );
                self.finish(CommandOutcome::Timeout);
            }
        }
    }

    /// Deadline of the command in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .as_ref()
            .filter(|f| !f.pending_send)
            .map(|f| f.deadline)
    }

    /// Flush everything as cancelled.
    pub fn cancel_all(&mut self) {
        if self.in_flight.is_some() {
            self.finish(CommandOutcome::Cancelled);
        }
        for command in self.queue.drain(..) {
            self.completed
                .push_back((command.id, CommandOutcome::Cancelled));
        }
    }

    /// Next finished command.
    pub fn poll_completion(&mut self) -> Option<(CommandId, CommandOutcome)> {
        self.completed.pop_front()
    }

    /// Station address the command in flight is sent to.
    pub fn in_flight_address(&self) -> Option<u16> {
        self.in_flight.as_ref().map(|f| f.command.common_address)
    }

    /// Commands queued or in flight.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    fn finish(&mut self, outcome: CommandOutcome) {
        if let Some(in_flight) = self.in_flight.take() {
            self.completed.push_back((in_flight.command.id, outcome));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(3, Duration::from_secs(5), 0, 1)
    }

    fn completions(dispatcher: &mut CommandDispatcher) -> Vec<(CommandId, CommandOutcome)> {
        std::iter::from_fn(|| dispatcher.poll_completion()).collect()
    }

    fn confirm(sent: &Asdu, negative: bool) -> Asdu {
        sent.mirror(Cot::ActivationConfirm, negative)
    }

    #[test]
    fn test_single_command_mapping() {
        let asdu = CommandRequest::single(100, true)
            .qualifier(1)
            .to_asdu(7, 3, true)
            .unwrap();
        assert_eq!(
            asdu.encode().unwrap().as_ref(),
            &[0x2D, 0x01, 0x06, 0x03, 0x07, 0x00, 0x64, 0x00, 0x00, 0x85]
        );
    }

    #[test]
    fn test_value_mapping() {
        let element = CommandRequest::double(1, true).element(false).unwrap();
        assert_eq!(
            element,
            InformationElement::DoubleCommand {
                state: 2,
                select: false,
                qualifier: 0
            }
        );

        let element = CommandRequest::new(TypeId::SetpointNormalized, 1, CommandValue::Float(0.5))
            .element(false)
            .unwrap();
        assert_eq!(
            element,
            InformationElement::SetpointNormalized {
                value: 0x4000,
                select: false,
                qualifier: 0
            }
        );

        let element = CommandRequest::interrogation().element(false).unwrap();
        assert_eq!(element, InformationElement::Interrogation { qualifier: 20 });
        let element = CommandRequest::interrogation()
            .qualifier(21)
            .element(false)
            .unwrap();
        assert_eq!(element, InformationElement::Interrogation { qualifier: 21 });

        let element = CommandRequest::new(TypeId::TestCommand, 0, CommandValue::None)
            .element(false)
            .unwrap();
        assert_eq!(element, InformationElement::TestCommand { pattern: 0xAA55 });

        let element = CommandRequest::counter_interrogation().element(false).unwrap();
        assert_eq!(element, InformationElement::CounterInterrogation { qualifier: 5 });

        let element = CommandRequest::setpoint_float(7, 49.5).element(true).unwrap();
        assert_eq!(
            element,
            InformationElement::SetpointFloat {
                value: 49.5,
                select: true,
                qualifier: 0
            }
        );
    }

    #[test]
    fn test_time_tagged_command_carries_timestamp() {
        let time = Cp56Time2a {
            milliseconds: 1234,
            minutes: 5,
            hours: 6,
            day: 7,
            month: 8,
            year: 25,
            ..Default::default()
        };
        let asdu = CommandRequest::new(TypeId::SetpointFloatTime56, 9, CommandValue::Float(1.5))
            .timestamp(time)
            .to_asdu(1, 0, false)
            .unwrap();
        assert_eq!(asdu.objects[0].time, Some(time));

        let asdu = CommandRequest::clock_sync()
            .timestamp(time)
            .to_asdu(1, 0, false)
            .unwrap();
        assert_eq!(
            asdu.objects[0].element,
            InformationElement::ClockSync { time }
        );
    }

    #[test]
    fn test_select_flag_ignored_without_se_bit() {
        let request = CommandRequest::new(TypeId::Bitstring32Command, 1, CommandValue::Int(7))
            .select(true);
        assert!(!request.uses_select());
        assert!(!CommandRequest::interrogation().select(true).uses_select());
        assert!(CommandRequest::single(1, true).select(true).uses_select());
    }

    #[test]
    fn test_invalid_commands() {
        let bad = [
            CommandRequest::new(TypeId::SinglePoint, 1, CommandValue::Bool(true)),
            CommandRequest::new(TypeId::SingleCommand, 1, CommandValue::Float(0.5)),
            CommandRequest::new(TypeId::DoubleCommand, 1, CommandValue::Int(4)),
            CommandRequest::new(TypeId::SetpointNormalized, 1, CommandValue::Float(1.5)),
            CommandRequest::new(TypeId::SetpointScaled, 1, CommandValue::Int(40_000)),
            CommandRequest::new(TypeId::SetpointFloat, 1, CommandValue::Float(f64::NAN)),
            CommandRequest::new(TypeId::Directory, 1, CommandValue::None),
            CommandRequest::single(0x0100_0000, true),
        ];
        for request in bad {
            assert!(
                matches!(request.validate(), Err(Iec60870Error::InvalidCommand(_))),
                "{:?}",
                request
            );
        }
    }

    #[test]
    fn test_direct_command_confirmed() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![CommandRequest::single(10, true)])
            .unwrap();

        let sent = dispatcher.poll_transmit(now).unwrap();
        assert!(!sent.objects[0].element.is_select());
        assert!(dispatcher.poll_transmit(now).is_none());

        assert!(dispatcher.on_asdu(&confirm(&sent, false)));
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Confirmed)]
        );
        assert!(CommandOutcome::Confirmed.is_success());
        assert!(!CommandOutcome::Timeout.is_success());
    }

    #[test]
    fn test_select_before_operate() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![CommandRequest::single(10, true).select(true)])
            .unwrap();

        let select = dispatcher.poll_transmit(now).unwrap();
        assert!(select.objects[0].element.is_select());
        assert!(dispatcher.on_asdu(&confirm(&select, false)));
        assert!(completions(&mut dispatcher).is_empty());

        let execute = dispatcher.poll_transmit(now).unwrap();
        assert!(!execute.objects[0].element.is_select());
        assert!(dispatcher.on_asdu(&confirm(&execute, false)));
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Confirmed)]
        );
    }

    #[test]
    fn test_rejected_select_never_executes() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![
                CommandRequest::single(10, true).select(true),
                CommandRequest::single(11, false),
            ])
            .unwrap();

        let select = dispatcher.poll_transmit(now).unwrap();
        assert!(dispatcher.on_asdu(&confirm(&select, true)));
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Rejected)]
        );

        // the queue moves on to the next command, not an execute
        let next = dispatcher.poll_transmit(now).unwrap();
        assert_eq!(next.objects[0].ioa, Ioa(11));
    }

    #[test]
    fn test_unknown_ioa_cause_rejects() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![CommandRequest::single(10, true)])
            .unwrap();
        let sent = dispatcher.poll_transmit(now).unwrap();

        assert!(dispatcher.on_asdu(&sent.mirror(Cot::UnknownIoa, false)));
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Rejected)]
        );
    }

    #[test]
    fn test_unrelated_asdu_not_consumed() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        dispatcher
            .submit(vec![CommandRequest::single(10, true)])
            .unwrap();
        let sent = dispatcher.poll_transmit(now).unwrap();

        // other IOA
        let mut other = confirm(&sent, false);
        other.objects[0].ioa = Ioa(99);
        assert!(!dispatcher.on_asdu(&other));
        // termination is not a confirmation
        assert!(!dispatcher.on_asdu(&sent.mirror(Cot::ActivationTermination, false)));
        assert_eq!(dispatcher.pending(), 1);
    }

    #[test]
    fn test_confirmation_from_other_station_not_consumed() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        dispatcher
            .submit(vec![CommandRequest::single(10, true)])
            .unwrap();
        let sent = dispatcher.poll_transmit(now).unwrap();

        let mut other = confirm(&sent, false);
        other.header.common_address = 2;
        assert!(!dispatcher.on_asdu(&other));
        assert_eq!(dispatcher.pending(), 1);
        assert!(dispatcher.on_asdu(&confirm(&sent, false)));

        dispatcher
            .submit(vec![CommandRequest::interrogation().station(0xFFFF)])
            .unwrap();
        let mut reply = confirm(&dispatcher.poll_transmit(now).unwrap(), false);
        reply.header.common_address = 3;
        assert!(dispatcher.on_asdu(&reply));
    }

    #[test]
    fn test_select_confirmation_must_carry_select_bit() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![CommandRequest::single(10, true).select(true)])
            .unwrap();
        let select = dispatcher.poll_transmit(now).unwrap();
        let mut execute_reply = confirm(&select, false);
        execute_reply.objects[0].element = InformationElement::SingleCommand {
            state: true,
            select: false,
            qualifier: 0,
        };

        // an execute confirmation cannot complete the select phase
        assert!(!dispatcher.on_asdu(&execute_reply));
        assert!(dispatcher.poll_transmit(now).is_none());

        assert!(dispatcher.on_asdu(&confirm(&select, false)));
        let execute = dispatcher.poll_transmit(now).unwrap();
        // a repeated select confirmation cannot complete the execute phase
        assert!(!dispatcher.on_asdu(&confirm(&select, false)));
        assert!(dispatcher.on_asdu(&confirm(&execute, false)));
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Confirmed)]
        );
    }

    #[test]
    fn test_timeout_then_next() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![
                CommandRequest::single(1, true).select(true),
                CommandRequest::single(2, true),
            ])
            .unwrap();

        dispatcher.poll_transmit(now).unwrap();
        assert_eq!(dispatcher.next_deadline(), Some(now + Duration::from_secs(5)));
        dispatcher.poll_timers(now + Duration::from_secs(4));
        assert!(completions(&mut dispatcher).is_empty());

        dispatcher.poll_timers(now + Duration::from_secs(5));
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Timeout)]
        );
        let next = dispatcher
            .poll_transmit(now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(next.objects[0].ioa, Ioa(2));
    }

    #[test]
    fn test_batch_admission_all_or_nothing() {
        let mut dispatcher = dispatcher();
        dispatcher
            .submit(vec![CommandRequest::single(1, true), CommandRequest::single(2, true)])
            .unwrap();

        let err = dispatcher
            .submit(vec![CommandRequest::single(3, true), CommandRequest::single(4, true)])
            .unwrap_err();
        assert!(matches!(err, Iec60870Error::QueueFull(3)));

        let err = dispatcher
            .submit(vec![CommandRequest::new(
                TypeId::SinglePoint,
                3,
                CommandValue::Bool(true),
            )])
            .unwrap_err();
        assert!(matches!(err, Iec60870Error::InvalidCommand(_)));
        assert_eq!(dispatcher.pending(), 2);
    }

    #[test]
    fn test_command_in_flight_counts_toward_capacity() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        dispatcher
            .submit(vec![CommandRequest::single(1, true)])
            .unwrap();
        dispatcher.poll_transmit(now).unwrap();

        let err = dispatcher
            .submit(vec![
                CommandRequest::single(2, true),
                CommandRequest::single(3, true),
                CommandRequest::single(4, true),
            ])
            .unwrap_err();
        assert!(matches!(err, Iec60870Error::QueueFull(3)));
        dispatcher
            .submit(vec![CommandRequest::single(2, true), CommandRequest::single(3, true)])
            .unwrap();
        assert_eq!(dispatcher.pending(), 3);
    }

    #[test]
    fn test_cancel_all_reports_each_once() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![
                CommandRequest::single(1, true),
                CommandRequest::single(2, true),
                CommandRequest::single(3, true),
            ])
            .unwrap();
        dispatcher.poll_transmit(now).unwrap();

        dispatcher.cancel_all();
        let done = completions(&mut dispatcher);
        assert_eq!(done.len(), 3);
        assert!(done
            .iter()
            .zip(&ids)
            .all(|((id, outcome), expected)| id == expected
                && *outcome == CommandOutcome::Cancelled));
        assert_eq!(dispatcher.pending(), 0);
        assert!(dispatcher.next_deadline().is_none());
    }

    #[test]
    fn test_read_completes_on_send() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        let ids = dispatcher
            .submit(vec![
                CommandRequest::new(TypeId::ReadCommand, 5, CommandValue::None),
                CommandRequest::single(6, true),
            ])
            .unwrap();

        let read = dispatcher.poll_transmit(now).unwrap();
        assert_eq!(read.type_id(), TypeId::ReadCommand);
        assert_eq!(
            completions(&mut dispatcher),
            vec![(ids[0], CommandOutcome::Confirmed)]
        );
        assert!(dispatcher.poll_transmit(now).is_some());
    }

    #[test]
    fn test_station_address_override() {
        let now = Instant::now();
        let mut dispatcher = dispatcher();
        dispatcher
            .submit(vec![CommandRequest::interrogation().station(42)])
            .unwrap();
        let sent = dispatcher.poll_transmit(now).unwrap();
        assert_eq!(sent.header.common_address, 42);
        assert_eq!(dispatcher.in_flight_address(), Some(42));
    }
}
