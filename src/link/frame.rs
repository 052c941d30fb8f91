//! FT1.2 link frames and their tokio codec.
//!
//! ```text
//! single char:  E5
//! fixed:        10 C A CS 16
//! variable:     68 L L 68 C A <ASDU> CS 16      L = 2 + ASDU length
//! ```
//!
//! The checksum is the arithmetic sum, modulo 256, of control, address and
//! payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::Iec60870Error;
use crate::types::MAX_ASDU_LENGTH;

/// Single character acknowledgment.
pub const SINGLE_ACK: u8 = 0xE5;
/// Start byte of a fixed-length frame.
pub const FIXED_START: u8 = 0x10;
/// Start byte of a variable-length frame.
pub const VARIABLE_START: u8 = 0x68;
/// End byte of fixed and variable frames.
pub const END_BYTE: u8 = 0x16;

const FIXED_LEN: usize = 5;
const DIR_BIT: u8 = 0x80;
const PRM_BIT: u8 = 0x40;
const FCB_BIT: u8 = 0x20;
const FCV_BIT: u8 = 0x10;

/// Primary (master to slave) function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimaryFunction {
    /// Reset of remote link
    ResetRemoteLink = 0,
    /// Reset of user process (balanced)
    ResetUserProcess = 1,
    /// Test function for link (balanced)
    TestLink = 2,
    /// User data, confirm expected
    UserData = 3,
    /// User data, no reply expected (balanced)
    UserDataNoReply = 4,
    /// Request status of link
    RequestLinkStatus = 9,
    /// Request class 1 data
    RequestClass1 = 10,
    /// Request class 2 data
    RequestClass2 = 11,
}

impl PrimaryFunction {
    /// Check whether the frame count bit is valid for this function.
    pub const fn uses_fcb(self) -> bool {
        matches!(
            self,
            Self::TestLink | Self::UserData | Self::RequestClass1 | Self::RequestClass2
        )
    }

    /// Parse the low nibble of a primary control field.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ResetRemoteLink),
            1 => Some(Self::ResetUserProcess),
            2 => Some(Self::TestLink),
            3 => Some(Self::UserData),
            4 => Some(Self::UserDataNoReply),
            9 => Some(Self::RequestLinkStatus),
            10 => Some(Self::RequestClass1),
            11 => Some(Self::RequestClass2),
            _ => None,
        }
    }
}

/// Secondary (slave to master) function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecondaryFunction {
    /// Positive acknowledgment
    Ack = 0,
    /// Message not accepted, link busy
    Nack = 1,
    /// User data
    UserData = 8,
    /// Requested data not available
    NoData = 9,
    /// Status of link
    LinkStatus = 11,
    /// Link service not implemented
    NotImplemented = 15,
}

impl SecondaryFunction {
    /// Parse the low nibble of a secondary control field.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ack),
            1 => Some(Self::Nack),
            8 => Some(Self::UserData),
            9 => Some(Self::NoData),
            11 => Some(Self::LinkStatus),
            15 => Some(Self::NotImplemented),
            _ => None,
        }
    }
}

/// Control field of a primary frame.
#[inline]
pub const fn primary_control(function: PrimaryFunction, fcb: bool) -> u8 {
    let mut control = PRM_BIT | function as u8;
    if function.uses_fcb() {
        control |= FCV_BIT;
        if fcb {
            control |= FCB_BIT;
        }
    }
    control
}

/// One FT1.2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ft12Frame {
    /// Single character 0xE5
    SingleAck,
    /// Fixed-length frame without user data
    Fixed { control: u8, address: u8 },
    /// Variable-length frame carrying one ASDU
    Variable {
        control: u8,
        address: u8,
        asdu: Bytes,
    },
}

impl Ft12Frame {
    /// Fixed primary request.
    pub fn request(function: PrimaryFunction, address: u8, fcb: bool) -> Self {
        Self::Fixed {
            control: primary_control(function, fcb),
            address,
        }
    }

    /// Variable primary frame with user data.
    pub fn user_data(address: u8, fcb: bool, asdu: Bytes) -> Self {
        Self::Variable {
            control: primary_control(PrimaryFunction::UserData, fcb),
            address,
            asdu,
        }
    }

    /// Fixed secondary reply.
    pub fn response(function: SecondaryFunction, address: u8) -> Self {
        Self::Fixed {
            control: function as u8,
            address,
        }
    }

    /// Set the DIR bit, used on balanced lines by the controlling station.
    pub fn with_direction(self) -> Self {
        match self {
            Self::SingleAck => self,
            Self::Fixed { control, address } => Self::Fixed {
                control: control | DIR_BIT,
                address,
            },
            Self::Variable {
                control,
                address,
                asdu,
            } => Self::Variable {
                control: control | DIR_BIT,
                address,
                asdu,
            },
        }
    }

    /// Control field, `None` for the single character ack.
    pub fn control(&self) -> Option<u8> {
        match self {
            Self::SingleAck => None,
            Self::Fixed { control, .. } | Self::Variable { control, .. } => Some(*control),
        }
    }

    /// Link address, `None` for the single character ack.
    pub fn address(&self) -> Option<u8> {
        match self {
            Self::SingleAck => None,
            Self::Fixed { address, .. } | Self::Variable { address, .. } => Some(*address),
        }
    }

    /// Check the PRM bit.
    pub fn is_primary(&self) -> bool {
        self.control().is_some_and(|c| c & PRM_BIT != 0)
    }

    /// DIR bit of the control field.
    pub fn direction(&self) -> Option<bool> {
        self.control().map(|c| c & DIR_BIT != 0)
    }

    /// Bit 4 of the control field: FCV on primary frames.
    pub fn fcv(&self) -> Option<bool> {
        self.control().map(|c| c & FCV_BIT != 0)
    }

    /// Primary function code, `None` for secondary frames.
    pub fn primary_function(&self) -> Option<PrimaryFunction> {
        self.control()
            .filter(|c| c & PRM_BIT != 0)
            .and_then(|c| PrimaryFunction::from_u8(c & 0x0F))
    }

    /// Bit 5 of the control field: FCB on primary frames.
    pub fn fcb(&self) -> Option<bool> {
        self.control().map(|c| c & FCB_BIT != 0)
    }

    /// Secondary function code. The single ack reads as `Ack`.
    pub fn secondary_function(&self) -> Option<SecondaryFunction> {
        match self.control() {
            None => Some(SecondaryFunction::Ack),
            Some(c) if c & PRM_BIT == 0 => SecondaryFunction::from_u8(c & 0x0F),
            Some(_) => None,
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// FT1.2 codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ft12Codec;

impl Ft12Codec {
    /// Create a new FT1.2 codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Ft12Codec {
    type Item = Ft12Frame;
    type Error = Iec60870Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let skip = src
            .iter()
            .position(|b| matches!(*b, SINGLE_ACK | FIXED_START | VARIABLE_START))
            .unwrap_or(src.len());
        if skip > 0 {
            trace!(skipped = skip, "Discarding line noise");
            src.advance(skip);
        }

        let Some(&start) = src.first() else {
            return Ok(None);
        };

        match start {
            SINGLE_ACK => {
                src.advance(1);
                Ok(Some(Ft12Frame::SingleAck))
            }
            FIXED_START => {
                if src.len() < FIXED_LEN {
                    return Ok(None);
                }
                let frame = src.split_to(FIXED_LEN);
                if frame[4] != END_BYTE {
                    return Err(Iec60870Error::invalid_frame(format!(
                        "fixed frame ends with 0x{:02X}",
                        frame[4]
                    )));
                }
                let expected = checksum(&frame[1..3]);
                if frame[3] != expected {
                    return Err(Iec60870Error::ChecksumMismatch {
                        expected,
                        actual: frame[3],
                    });
                }
                Ok(Some(Ft12Frame::Fixed {
                    control: frame[1],
                    address: frame[2],
                }))
            }
            _ => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let length = src[1] as usize;
                if src[2] as usize != length || src[3] != VARIABLE_START || length < 2 {
                    src.advance(1);
                    return Err(Iec60870Error::invalid_frame(format!(
                        "bad variable frame header {:02X?}",
                        &src[..3]
                    )));
                }
                let total = 4 + length + 2;
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }

                let mut frame = src.split_to(total);
                if frame[total - 1] != END_BYTE {
                    return Err(Iec60870Error::invalid_frame(format!(
                        "variable frame ends with 0x{:02X}",
                        frame[total - 1]
                    )));
                }
                let expected = checksum(&frame[4..4 + length]);
                let actual = frame[4 + length];
                if actual != expected {
                    return Err(Iec60870Error::ChecksumMismatch { expected, actual });
                }

                frame.advance(4);
                let control = frame.get_u8();
                let address = frame.get_u8();
                frame.truncate(length - 2);
                Ok(Some(Ft12Frame::Variable {
                    control,
                    address,
                    asdu: frame.freeze(),
                }))
            }
        }
    }
}

impl Encoder<Ft12Frame> for Ft12Codec {
    type Error = Iec60870Error;

    fn encode(&mut self, item: Ft12Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Ft12Frame::SingleAck => dst.put_u8(SINGLE_ACK),
            Ft12Frame::Fixed { control, address } => {
                dst.reserve(FIXED_LEN);
                dst.put_slice(&[
                    FIXED_START,
                    control,
                    address,
                    checksum(&[control, address]),
                    END_BYTE,
                ]);
            }
            Ft12Frame::Variable {
                control,
                address,
                asdu,
            } => {
                if asdu.len() > MAX_ASDU_LENGTH {
                    return Err(Iec60870Error::Codec(format!(
                        "ASDU of {} bytes exceeds {}",
                        asdu.len(),
                        MAX_ASDU_LENGTH
                    )));
                }
                let length = (asdu.len() + 2) as u8;
                let sum = checksum(&asdu)
                    .wrapping_add(control)
                    .wrapping_add(address);
                dst.reserve(asdu.len() + 8);
                dst.put_slice(&[VARIABLE_START, length, length, VARIABLE_START, control, address]);
                dst.put_slice(&asdu);
                dst.put_u8(sum);
                dst.put_u8(END_BYTE);
            }
        }
        Ok(())
    }
}
