//! Information elements: the typed payload of one information object.
//!
//! Time-tagged type identifications share the element layout of their
//! untagged counterpart; the trailing CP56Time2a is handled by the ASDU.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Iec60870Error, Result};

use super::{BinaryCounterReading, Cp56Time2a, DoublePointValue, Quality, TypeId};

const SE_BIT: u8 = 0x80;

/// One decoded information element.
#[derive(Debug, Clone, PartialEq)]
pub enum InformationElement {
    /// SIQ
    SinglePoint { value: bool, quality: Quality },
    /// DIQ
    DoublePoint {
        value: DoublePointValue,
        quality: Quality,
    },
    /// VTI + QDS
    StepPosition {
        value: i8,
        transient: bool,
        quality: Quality,
    },
    /// BSI + QDS
    Bitstring { value: u32, quality: Quality },
    /// NVA + QDS, raw fixed-point value
    Normalized { value: i16, quality: Quality },
    /// SVA + QDS
    Scaled { value: i16, quality: Quality },
    /// IEEE STD 754 + QDS
    ShortFloat { value: f32, quality: Quality },
    /// BCR
    IntegratedTotals(BinaryCounterReading),
    /// COI
    EndOfInit { cause: u8 },

    /// SCO
    SingleCommand {
        state: bool,
        select: bool,
        qualifier: u8,
    },
    /// DCO, state 1 = OFF, 2 = ON
    DoubleCommand {
        state: u8,
        select: bool,
        qualifier: u8,
    },
    /// RCO, state 1 = lower, 2 = higher
    RegulatingStep {
        state: u8,
        select: bool,
        qualifier: u8,
    },
    /// NVA + QOS
    SetpointNormalized {
        value: i16,
        select: bool,
        qualifier: u8,
    },
    /// SVA + QOS
    SetpointScaled {
        value: i16,
        select: bool,
        qualifier: u8,
    },
    /// IEEE STD 754 + QOS
    SetpointFloat {
        value: f32,
        select: bool,
        qualifier: u8,
    },
    /// BSI
    Bitstring32Command { value: u32 },

    /// QOI
    Interrogation { qualifier: u8 },
    /// QCC
    CounterInterrogation { qualifier: u8 },
    /// No element
    Read,
    /// CP56Time2a
    ClockSync { time: Cp56Time2a },
    /// FBP, fixed test pattern
    TestCommand { pattern: u16 },
    /// QRP
    ResetProcess { qualifier: u8 },
    /// TSC, the time tag follows as object time
    TestCommandTime { counter: u16 },

    /// NOF + LOF + FRQ
    FileReady {
        file: u16,
        length: u32,
        qualifier: u8,
    },
    /// NOF + NOS + LOF + SRQ
    SectionReady {
        file: u16,
        section: u8,
        length: u32,
        qualifier: u8,
    },
    /// NOF + NOS + SCQ
    CallFile { file: u16, section: u8, qualifier: u8 },
    /// NOF + NOS + LSQ + CHS
    LastSection {
        file: u16,
        section: u8,
        qualifier: u8,
        checksum: u8,
    },
    /// NOF + NOS + AFQ
    AckFile { file: u16, section: u8, qualifier: u8 },
    /// NOF + NOS + LOS + segment bytes
    Segment { file: u16, section: u8, data: Bytes },
    /// NOF + LOF + SOF + CP56Time2a
    Directory {
        file: u16,
        length: u32,
        status: u8,
        time: Cp56Time2a,
    },
}

/// Fixed element size per type, `None` for the variable-length segment.
fn fixed_len(type_id: TypeId) -> Option<usize> {
    use TypeId::*;
    let len = match type_id {
        SinglePoint | SinglePointTime56 | DoublePoint | DoublePointTime56 => 1,
        StepPosition | StepPositionTime56 => 2,
        Bitstring32 | Bitstring32Time56 => 5,
        MeasuredNormalized | MeasuredNormalizedTime56 | MeasuredScaled | MeasuredScaledTime56 => 3,
        MeasuredFloat | MeasuredFloatTime56 | IntegratedTotals | IntegratedTotalsTime56 => 5,
        EndOfInit => 1,
        SingleCommand | SingleCommandTime56 | DoubleCommand | DoubleCommandTime56 => 1,
        RegulatingStep | RegulatingStepTime56 => 1,
        SetpointNormalized | SetpointNormalizedTime56 | SetpointScaled | SetpointScaledTime56 => 3,
        SetpointFloat | SetpointFloatTime56 => 5,
        Bitstring32Command | Bitstring32CommandTime56 => 4,
        InterrogationCommand | CounterInterrogation | ResetProcess => 1,
        ReadCommand => 0,
        ClockSync => Cp56Time2a::LEN,
        TestCommand | TestCommandTime56 => 2,
        FileReady => 6,
        SectionReady => 7,
        CallFile | AckFile => 4,
        LastSection => 5,
        Directory => 6 + Cp56Time2a::LEN,
        Segment => return None,
    };
    Some(len)
}

/// Command qualifier bits 2..=6 with the select flag in bit 7.
#[inline]
fn command_byte(low: u8, select: bool, qualifier: u8) -> u8 {
    (low & 0x03) | ((qualifier & 0x1F) << 2) | if select { SE_BIT } else { 0 }
}

/// QOS: qualifier in bits 0..=6, select flag in bit 7.
#[inline]
fn qos_byte(select: bool, qualifier: u8) -> u8 {
    (qualifier & 0x7F) | if select { SE_BIT } else { 0 }
}

impl InformationElement {
    /// Decode one element of `type_id` from the front of `data`.
    ///
    /// Returns the element and the number of bytes consumed.
    pub fn decode(type_id: TypeId, data: &[u8]) -> Result<(Self, usize)> {
        let needed = match fixed_len(type_id) {
            Some(len) => len,
            None => {
                if data.len() < 4 {
                    return Err(Iec60870Error::malformed(format!(
                        "{} segment header truncated",
                        type_id
                    )));
                }
                4 + data[3] as usize
            }
        };
        if data.len() < needed {
            return Err(Iec60870Error::malformed(format!(
                "{} element needs {} bytes, {} left",
                type_id,
                needed,
                data.len()
            )));
        }

        let mut buf = &data[..needed];
        use TypeId::*;
        let element = match type_id {
            SinglePoint | SinglePointTime56 => {
                let siq = buf.get_u8();
                Self::SinglePoint {
                    value: siq & 0x01 != 0,
                    quality: Quality::from_siq(siq),
                }
            }
            DoublePoint | DoublePointTime56 => {
                let diq = buf.get_u8();
                Self::DoublePoint {
                    value: DoublePointValue::from_u8(diq),
                    quality: Quality::from_siq(diq),
                }
            }
            StepPosition | StepPositionTime56 => {
                let vti = buf.get_u8();
                Self::StepPosition {
                    // Sign-extend the 7-bit value
                    value: ((vti << 1) as i8) >> 1,
                    transient: vti & 0x80 != 0,
                    quality: Quality::from_qds(buf.get_u8()),
                }
            }
            Bitstring32 | Bitstring32Time56 => Self::Bitstring {
                value: buf.get_u32_le(),
                quality: Quality::from_qds(buf.get_u8()),
            },
            MeasuredNormalized | MeasuredNormalizedTime56 => Self::Normalized {
                value: buf.get_i16_le(),
                quality: Quality::from_qds(buf.get_u8()),
            },
            MeasuredScaled | MeasuredScaledTime56 => Self::Scaled {
                value: buf.get_i16_le(),
                quality: Quality::from_qds(buf.get_u8()),
            },
            MeasuredFloat | MeasuredFloatTime56 => Self::ShortFloat {
                value: buf.get_f32_le(),
                quality: Quality::from_qds(buf.get_u8()),
            },
            IntegratedTotals | IntegratedTotalsTime56 => {
                let value = buf.get_i32_le();
                let flags = buf.get_u8();
                Self::IntegratedTotals(BinaryCounterReading {
                    value,
                    sequence: flags & 0x1F,
                    carry: flags & 0x20 != 0,
                    adjusted: flags & 0x40 != 0,
                    invalid: flags & 0x80 != 0,
                })
            }
            EndOfInit => Self::EndOfInit {
                cause: buf.get_u8(),
            },
            SingleCommand | SingleCommandTime56 => {
                let sco = buf.get_u8();
                Self::SingleCommand {
                    state: sco & 0x01 != 0,
                    select: sco & SE_BIT != 0,
                    qualifier: (sco >> 2) & 0x1F,
                }
            }
            DoubleCommand | DoubleCommandTime56 => {
                let dco = buf.get_u8();
                Self::DoubleCommand {
                    state: dco & 0x03,
                    select: dco & SE_BIT != 0,
                    qualifier: (dco >> 2) & 0x1F,
                }
            }
            RegulatingStep | RegulatingStepTime56 => {
                let rco = buf.get_u8();
                Self::RegulatingStep {
                    state: rco & 0x03,
                    select: rco & SE_BIT != 0,
                    qualifier: (rco >> 2) & 0x1F,
                }
            }
            SetpointNormalized | SetpointNormalizedTime56 => {
                let value = buf.get_i16_le();
                let qos = buf.get_u8();
                Self::SetpointNormalized {
                    value,
                    select: qos & SE_BIT != 0,
                    qualifier: qos & 0x7F,
                }
            }
            SetpointScaled | SetpointScaledTime56 => {
                let value = buf.get_i16_le();
                let qos = buf.get_u8();
                Self::SetpointScaled {
                    value,
                    select: qos & SE_BIT != 0,
                    qualifier: qos & 0x7F,
                }
            }
            SetpointFloat | SetpointFloatTime56 => {
                let value = buf.get_f32_le();
                let qos = buf.get_u8();
                Self::SetpointFloat {
                    value,
                    select: qos & SE_BIT != 0,
                    qualifier: qos & 0x7F,
                }
            }
            Bitstring32Command | Bitstring32CommandTime56 => Self::Bitstring32Command {
                value: buf.get_u32_le(),
            },
            InterrogationCommand => Self::Interrogation {
                qualifier: buf.get_u8(),
            },
            CounterInterrogation => Self::CounterInterrogation {
                qualifier: buf.get_u8(),
            },
            ReadCommand => Self::Read,
            ClockSync => Self::ClockSync {
                time: Cp56Time2a::from_bytes(buf)?,
            },
            TestCommand => Self::TestCommand {
                pattern: buf.get_u16_le(),
            },
            ResetProcess => Self::ResetProcess {
                qualifier: buf.get_u8(),
            },
            TestCommandTime56 => Self::TestCommandTime {
                counter: buf.get_u16_le(),
            },
            FileReady => Self::FileReady {
                file: buf.get_u16_le(),
                length: buf.get_uint_le(3) as u32,
                qualifier: buf.get_u8(),
            },
            SectionReady => Self::SectionReady {
                file: buf.get_u16_le(),
                section: buf.get_u8(),
                length: buf.get_uint_le(3) as u32,
                qualifier: buf.get_u8(),
            },
            CallFile => Self::CallFile {
                file: buf.get_u16_le(),
                section: buf.get_u8(),
                qualifier: buf.get_u8(),
            },
            LastSection => Self::LastSection {
                file: buf.get_u16_le(),
                section: buf.get_u8(),
                qualifier: buf.get_u8(),
                checksum: buf.get_u8(),
            },
            AckFile => Self::AckFile {
                file: buf.get_u16_le(),
                section: buf.get_u8(),
                qualifier: buf.get_u8(),
            },
            Segment => {
                let file = buf.get_u16_le();
                let section = buf.get_u8();
                let len = buf.get_u8() as usize;
                Self::Segment {
                    file,
                    section,
                    data: Bytes::copy_from_slice(&buf[..len]),
                }
            }
            Directory => Self::Directory {
                file: buf.get_u16_le(),
                length: buf.get_uint_le(3) as u32,
                status: buf.get_u8(),
                time: Cp56Time2a::from_bytes(buf)?,
            },
        };

        Ok((element, needed))
    }

    /// Encode the element (without IOA or trailing time tag).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::SinglePoint { value, quality } => {
                buf.put_u8(quality.to_siq() | *value as u8);
            }
            Self::DoublePoint { value, quality } => {
                buf.put_u8(quality.to_siq() | value.as_u8());
            }
            Self::StepPosition {
                value,
                transient,
                quality,
            } => {
                buf.put_u8((*value as u8 & 0x7F) | if *transient { 0x80 } else { 0 });
                buf.put_u8(quality.to_qds());
            }
            Self::Bitstring { value, quality } => {
                buf.put_u32_le(*value);
                buf.put_u8(quality.to_qds());
            }
            Self::Normalized { value, quality } | Self::Scaled { value, quality } => {
                buf.put_i16_le(*value);
                buf.put_u8(quality.to_qds());
            }
            Self::ShortFloat { value, quality } => {
                buf.put_f32_le(*value);
                buf.put_u8(quality.to_qds());
            }
            Self::IntegratedTotals(bcr) => {
                buf.put_i32_le(bcr.value);
                let mut flags = bcr.sequence & 0x1F;
                if bcr.carry {
                    flags |= 0x20;
                }
                if bcr.adjusted {
                    flags |= 0x40;
                }
                if bcr.invalid {
                    flags |= 0x80;
                }
                buf.put_u8(flags);
            }
            Self::EndOfInit { cause } => buf.put_u8(*cause),
            Self::SingleCommand {
                state,
                select,
                qualifier,
            } => buf.put_u8(command_byte(*state as u8, *select, *qualifier)),
            Self::DoubleCommand {
                state,
                select,
                qualifier,
            }
            | Self::RegulatingStep {
                state,
                select,
                qualifier,
            } => buf.put_u8(command_byte(*state, *select, *qualifier)),
            Self::SetpointNormalized {
                value,
                select,
                qualifier,
            }
            | Self::SetpointScaled {
                value,
                select,
                qualifier,
            } => {
                buf.put_i16_le(*value);
                buf.put_u8(qos_byte(*select, *qualifier));
            }
            Self::SetpointFloat {
                value,
                select,
                qualifier,
            } => {
                buf.put_f32_le(*value);
                buf.put_u8(qos_byte(*select, *qualifier));
            }
            Self::Bitstring32Command { value } => buf.put_u32_le(*value),
            Self::Interrogation { qualifier }
            | Self::CounterInterrogation { qualifier }
            | Self::ResetProcess { qualifier } => buf.put_u8(*qualifier),
            Self::Read => {}
            Self::ClockSync { time } => buf.put_slice(&time.to_bytes()),
            Self::TestCommand { pattern } => buf.put_u16_le(*pattern),
            Self::TestCommandTime { counter } => buf.put_u16_le(*counter),
            Self::FileReady {
                file,
                length,
                qualifier,
            } => {
                buf.put_u16_le(*file);
                buf.put_uint_le(*length as u64 & 0xFF_FFFF, 3);
                buf.put_u8(*qualifier);
            }
            Self::SectionReady {
                file,
                section,
                length,
                qualifier,
            } => {
                buf.put_u16_le(*file);
                buf.put_u8(*section);
                buf.put_uint_le(*length as u64 & 0xFF_FFFF, 3);
                buf.put_u8(*qualifier);
            }
            Self::CallFile {
                file,
                section,
                qualifier,
            }
            | Self::AckFile {
                file,
                section,
                qualifier,
            } => {
                buf.put_u16_le(*file);
                buf.put_u8(*section);
                buf.put_u8(*qualifier);
            }
            Self::LastSection {
                file,
                section,
                qualifier,
                checksum,
            } => {
                buf.put_u16_le(*file);
                buf.put_u8(*section);
                buf.put_u8(*qualifier);
                buf.put_u8(*checksum);
            }
            Self::Segment {
                file,
                section,
                data,
            } => {
                buf.put_u16_le(*file);
                buf.put_u8(*section);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            Self::Directory {
                file,
                length,
                status,
                time,
            } => {
                buf.put_u16_le(*file);
                buf.put_uint_le(*length as u64 & 0xFF_FFFF, 3);
                buf.put_u8(*status);
                buf.put_slice(&time.to_bytes());
            }
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::SinglePoint { .. }
            | Self::DoublePoint { .. }
            | Self::EndOfInit { .. }
            | Self::SingleCommand { .. }
            | Self::DoubleCommand { .. }
            | Self::RegulatingStep { .. }
            | Self::Interrogation { .. }
            | Self::CounterInterrogation { .. }
            | Self::ResetProcess { .. } => 1,
            Self::StepPosition { .. } | Self::TestCommand { .. } | Self::TestCommandTime { .. } => {
                2
            }
            Self::Normalized { .. }
            | Self::Scaled { .. }
            | Self::SetpointNormalized { .. }
            | Self::SetpointScaled { .. } => 3,
            Self::Bitstring32Command { .. } | Self::CallFile { .. } | Self::AckFile { .. } => 4,
            Self::Bitstring { .. }
            | Self::ShortFloat { .. }
            | Self::IntegratedTotals(_)
            | Self::SetpointFloat { .. }
            | Self::LastSection { .. } => 5,
            Self::FileReady { .. } => 6,
            Self::SectionReady { .. } | Self::ClockSync { .. } => 7,
            Self::Directory { .. } => 6 + Cp56Time2a::LEN,
            Self::Segment { data, .. } => 4 + data.len(),
            Self::Read => 0,
        }
    }

    /// Check whether this element is the layout `type_id` carries.
    pub fn matches(&self, type_id: TypeId) -> bool {
        use TypeId::*;
        match self {
            Self::SinglePoint { .. } => matches!(type_id, SinglePoint | SinglePointTime56),
            Self::DoublePoint { .. } => matches!(type_id, DoublePoint | DoublePointTime56),
            Self::StepPosition { .. } => matches!(type_id, StepPosition | StepPositionTime56),
            Self::Bitstring { .. } => matches!(type_id, Bitstring32 | Bitstring32Time56),
            Self::Normalized { .. } => {
                matches!(type_id, MeasuredNormalized | MeasuredNormalizedTime56)
            }
            Self::Scaled { .. } => matches!(type_id, MeasuredScaled | MeasuredScaledTime56),
            Self::ShortFloat { .. } => matches!(type_id, MeasuredFloat | MeasuredFloatTime56),
            Self::IntegratedTotals(_) => {
                matches!(type_id, IntegratedTotals | IntegratedTotalsTime56)
            }
            Self::EndOfInit { .. } => type_id == EndOfInit,
            Self::SingleCommand { .. } => matches!(type_id, SingleCommand | SingleCommandTime56),
            Self::DoubleCommand { .. } => matches!(type_id, DoubleCommand | DoubleCommandTime56),
            Self::RegulatingStep { .. } => {
                matches!(type_id, RegulatingStep | RegulatingStepTime56)
            }
            Self::SetpointNormalized { .. } => {
                matches!(type_id, SetpointNormalized | SetpointNormalizedTime56)
            }
            Self::SetpointScaled { .. } => {
                matches!(type_id, SetpointScaled | SetpointScaledTime56)
            }
            Self::SetpointFloat { .. } => matches!(type_id, SetpointFloat | SetpointFloatTime56),
            Self::Bitstring32Command { .. } => {
                matches!(type_id, Bitstring32Command | Bitstring32CommandTime56)
            }
            Self::Interrogation { .. } => type_id == InterrogationCommand,
            Self::CounterInterrogation { .. } => type_id == CounterInterrogation,
            Self::Read => type_id == ReadCommand,
            Self::ClockSync { .. } => type_id == ClockSync,
            Self::TestCommand { .. } => type_id == TestCommand,
            Self::ResetProcess { .. } => type_id == ResetProcess,
            Self::TestCommandTime { .. } => type_id == TestCommandTime56,
            Self::FileReady { .. } => type_id == FileReady,
            Self::SectionReady { .. } => type_id == SectionReady,
            Self::CallFile { .. } => type_id == CallFile,
            Self::LastSection { .. } => type_id == LastSection,
            Self::AckFile { .. } => type_id == AckFile,
            Self::Segment { .. } => type_id == Segment,
            Self::Directory { .. } => type_id == Directory,
        }
    }

    /// Check the select/execute bit of a command element.
    pub fn is_select(&self) -> bool {
        matches!(
            self,
            Self::SingleCommand { select: true, .. }
                | Self::DoubleCommand { select: true, .. }
                | Self::RegulatingStep { select: true, .. }
                | Self::SetpointNormalized { select: true, .. }
                | Self::SetpointScaled { select: true, .. }
                | Self::SetpointFloat { select: true, .. }
        )
    }
}
