//! IEC 60870-5 ASDU (Application Service Data Unit).
//!
//! ASDU contains the actual data (measurements, commands, etc.). The same
//! layout is carried by 104 I-frames and 101 variable-length frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Iec60870Error, Result};
use crate::types::{Cot, Cp56Time2a, InformationElement, TypeId};

/// Largest object count a VSQ can express.
pub const MAX_OBJECTS: usize = 127;

/// Variable Structure Qualifier (VSQ).
///
/// Defines the structure of information objects in an ASDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vsq {
    /// Number of information objects (1-127)
    pub count: u8,
    /// If true, addresses are sequential (SQ=1)
    pub sequence: bool,
}

impl Vsq {
    /// Create a new VSQ.
    #[inline]
    pub const fn new(count: u8, sequence: bool) -> Self {
        Self { count, sequence }
    }

    /// Parse VSQ from byte.
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        Self {
            count: value & 0x7F,
            sequence: (value & 0x80) != 0,
        }
    }

    /// Encode VSQ to byte.
    #[inline]
    pub const fn as_u8(&self) -> u8 {
        (self.count & 0x7F) | if self.sequence { 0x80 } else { 0 }
    }
}

/// Information Object Address (IOA).
///
/// 3-byte address identifying a specific data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ioa(pub u32);

impl Ioa {
    /// Largest address representable in 3 bytes.
    pub const MAX: u32 = 0x00FF_FFFF;

    /// Wire size in bytes.
    pub const LEN: usize = 3;

    /// Create an IOA, `None` if the value does not fit in 3 bytes.
    #[inline]
    pub const fn new(value: u32) -> Option<Self> {
        if value > Self::MAX {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Parse IOA from 3 bytes (little-endian).
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(Iec60870Error::malformed("IOA truncated"));
        }
        let value = bytes[0] as u32 | ((bytes[1] as u32) << 8) | ((bytes[2] as u32) << 16);
        Ok(Self(value))
    }

    /// Encode IOA to 3 bytes (little-endian).
    #[inline]
    pub fn to_bytes(&self) -> [u8; 3] {
        let le = self.0.to_le_bytes();
        [le[0], le[1], le[2]]
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Ioa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ASDU header (fixed part).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsduHeader {
    /// Type identification
    pub type_id: TypeId,
    /// Variable structure qualifier
    pub vsq: Vsq,
    /// Cause of transmission
    pub cot: Cot,
    /// Test flag (if true, this is a test ASDU)
    pub test: bool,
    /// Negative flag (if true, negative confirmation)
    pub negative: bool,
    /// Originator address (0 if not used)
    pub originator: u8,
    /// Common address of ASDU (station address)
    pub common_address: u16,
}

impl AsduHeader {
    /// Encoded header size in bytes.
    pub const LEN: usize = 6;

    /// Create a new ASDU header with no objects counted yet.
    pub fn new(type_id: TypeId, cot: Cot, common_address: u16) -> Self {
        Self {
            type_id,
            vsq: Vsq::default(),
            cot,
            test: false,
            negative: false,
            originator: 0,
            common_address,
        }
    }

    /// Set the originator address.
    pub fn with_originator(mut self, originator: u8) -> Self {
        self.originator = originator;
        self
    }

    /// Parse ASDU header from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Iec60870Error::malformed(format!(
                "ASDU header needs {} bytes, got {}",
                Self::LEN,
                data.len()
            )));
        }

        let type_id = TypeId::from_u8(data[0])?;
        let vsq = Vsq::from_u8(data[1]);

        // COT in the lower 6 bits, P/N in bit 6, T in bit 7
        let cot = Cot::from_u8(data[2])?;
        let test = (data[2] & 0x80) != 0;
        let negative = (data[2] & 0x40) != 0;

        Ok(Self {
            type_id,
            vsq,
            cot,
            test,
            negative,
            originator: data[3],
            common_address: u16::from_le_bytes([data[4], data[5]]),
        })
    }

    /// Encode ASDU header to bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_id.as_u8());
        buf.put_u8(self.vsq.as_u8());

        let mut cot_byte = self.cot.as_u8();
        if self.test {
            cot_byte |= 0x80;
        }
        if self.negative {
            cot_byte |= 0x40;
        }
        buf.put_u8(cot_byte);
        buf.put_u8(self.originator);
        buf.put_u16_le(self.common_address);
    }
}

impl std::fmt::Display for AsduHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} n={}{} cot={}{} ca={}",
            self.type_id,
            self.vsq.count,
            if self.vsq.sequence { " SQ" } else { "" },
            self.cot,
            if self.negative { " NEG" } else { "" },
            self.common_address
        )
    }
}

/// One information object: address, element and optional time tag.
#[derive(Debug, Clone, PartialEq)]
pub struct InformationObject {
    /// Information object address
    pub ioa: Ioa,
    /// Decoded element
    pub element: InformationElement,
    /// Trailing CP56Time2a, present iff the type carries one
    pub time: Option<Cp56Time2a>,
}

impl InformationObject {
    /// Create a new information object without time tag.
    pub fn new(ioa: Ioa, element: InformationElement) -> Self {
        Self {
            ioa,
            element,
            time: None,
        }
    }

    /// Attach a time tag.
    pub fn with_time(mut self, time: Cp56Time2a) -> Self {
        self.time = Some(time);
        self
    }
}

/// Complete ASDU.
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    /// ASDU header
    pub header: AsduHeader,
    /// Information objects
    pub objects: Vec<InformationObject>,
}

impl Asdu {
    /// Create an empty ASDU.
    pub fn new(header: AsduHeader) -> Self {
        Self {
            header,
            objects: Vec::new(),
        }
    }

    /// Create an ASDU carrying a single object.
    pub fn single(header: AsduHeader, object: InformationObject) -> Self {
        let mut asdu = Self::new(header);
        asdu.push(object);
        asdu
    }

    /// Append an object, keeping the VSQ count in sync.
    pub fn push(&mut self, object: InformationObject) {
        self.objects.push(object);
        self.header.vsq.count = self.objects.len().min(MAX_OBJECTS) as u8;
    }

    /// Type identification shortcut.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.header.type_id
    }

    /// Build the mirror reply a controlled station sends for this request.
    pub fn mirror(&self, cot: Cot, negative: bool) -> Self {
        let mut reply = self.clone();
        reply.header.cot = cot;
        reply.header.negative = negative;
        reply
    }

    /// Decode an ASDU from bytes. The input must hold exactly one ASDU.
    ///
    /// Unknown type identification or cause of transmission are reported as
    /// `UnknownTypeId` / `UnknownCot`; every other inconsistency is `Malformed`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = AsduHeader::parse(data)?;
        let type_id = header.type_id;
        let count = header.vsq.count as usize;
        if count == 0 {
            return Err(Iec60870Error::malformed("ASDU without information objects"));
        }

        let mut rest = &data[AsduHeader::LEN..];
        let mut objects: Vec<InformationObject> = Vec::with_capacity(count);

        for index in 0..count {
            let ioa = match objects.last() {
                Some(prev) if header.vsq.sequence => {
                    let next = prev.ioa.0 + 1;
                    if next > Ioa::MAX {
                        return Err(Iec60870Error::malformed(
                            "sequential IOA exceeds 24 bits",
                        ));
                    }
                    Ioa(next)
                }
                _ => {
                    let ioa = Ioa::from_bytes(rest)?;
                    rest = &rest[Ioa::LEN..];
                    ioa
                }
            };

            let (element, used) = InformationElement::decode(type_id, rest)?;
            rest = &rest[used..];

            let time = if type_id.has_time_tag() {
                if rest.len() < Cp56Time2a::LEN {
                    return Err(Iec60870Error::malformed(format!(
                        "object {} missing time tag",
                        index
                    )));
                }
                let time = Cp56Time2a::from_bytes(rest)?;
                rest = &rest[Cp56Time2a::LEN..];
                Some(time)
            } else {
                None
            };

            objects.push(InformationObject { ioa, element, time });
        }

        if !rest.is_empty() {
            return Err(Iec60870Error::malformed(format!(
                "{} trailing bytes after {} objects",
                rest.len(),
                count
            )));
        }

        Ok(Self { header, objects })
    }

    /// Check the structural rules an encoded ASDU must satisfy.
    pub fn validate(&self) -> Result<()> {
        let type_id = self.header.type_id;
        let count = self.objects.len();
        if count == 0 || count > MAX_OBJECTS {
            return Err(Iec60870Error::malformed(format!(
                "object count {} outside 1..={}",
                count, MAX_OBJECTS
            )));
        }
        if self.header.vsq.count as usize != count {
            return Err(Iec60870Error::malformed(format!(
                "VSQ count {} does not match {} objects",
                self.header.vsq.count, count
            )));
        }

        for (index, object) in self.objects.iter().enumerate() {
            if object.ioa.0 > Ioa::MAX {
                return Err(Iec60870Error::malformed(format!(
                    "IOA {} exceeds 24 bits",
                    object.ioa
                )));
            }
            if !object.element.matches(type_id) {
                return Err(Iec60870Error::malformed(format!(
                    "object {} element does not fit {}",
                    index, type_id
                )));
            }
            if object.time.is_some() != type_id.has_time_tag() {
                return Err(Iec60870Error::malformed(format!(
                    "object {} time tag presence does not fit {}",
                    index, type_id
                )));
            }
            if self.header.vsq.sequence && index > 0 {
                let prev = self.objects[index - 1].ioa.0;
                if object.ioa.0 != prev + 1 {
                    return Err(Iec60870Error::malformed(format!(
                        "sequential IOA {} does not follow {}",
                        object.ioa, prev
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode ASDU to bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode ASDU directly into the provided buffer.
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<()> {
        self.validate()?;
        self.header.encode(buf);

        for (index, object) in self.objects.iter().enumerate() {
            if index == 0 || !self.header.vsq.sequence {
                buf.put_slice(&object.ioa.to_bytes());
            }
            object.element.encode(buf);
            if let Some(time) = &object.time {
                buf.put_slice(&time.to_bytes());
            }
        }
        Ok(())
    }

    /// Calculate the encoded length of this ASDU.
    pub fn encoded_len(&self) -> usize {
        let mut len = AsduHeader::LEN;
        for (index, object) in self.objects.iter().enumerate() {
            if index == 0 || !self.header.vsq.sequence {
                len += Ioa::LEN;
            }
            len += object.element.encoded_len();
            if object.time.is_some() {
                len += Cp56Time2a::LEN;
            }
        }
        len
    }
}

impl std::fmt::Display for Asdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinaryCounterReading, DoublePointValue, Quality};

    fn sample_element(type_id: TypeId) -> InformationElement {
        use TypeId::*;
        let time = Cp56Time2a {
            milliseconds: 1234,
            minutes: 5,
            hours: 6,
            day: 7,
            day_of_week: 1,
            month: 8,
            year: 24,
            invalid: false,
            summer_time: false,
        };
        match type_id {
            SinglePoint | SinglePointTime56 => InformationElement::SinglePoint {
                value: true,
                quality: Quality::Good.set_blocked(true),
            },
            DoublePoint | DoublePointTime56 => InformationElement::DoublePoint {
                value: DoublePointValue::On,
                quality: Quality::Good,
            },
            StepPosition | StepPositionTime56 => InformationElement::StepPosition {
                value: -12,
                transient: true,
                quality: Quality::Good,
            },
            Bitstring32 | Bitstring32Time56 => InformationElement::Bitstring {
                value: 0xDEAD_BEEF,
                quality: Quality::Good,
            },
            MeasuredNormalized | MeasuredNormalizedTime56 => InformationElement::Normalized {
                value: -16384,
                quality: Quality::Good,
            },
            MeasuredScaled | MeasuredScaledTime56 => InformationElement::Scaled {
                value: 1200,
                quality: Quality::Good.set_overflow(true),
            },
            MeasuredFloat | MeasuredFloatTime56 => InformationElement::ShortFloat {
                value: 50.25,
                quality: Quality::Good,
            },
            IntegratedTotals | IntegratedTotalsTime56 => {
                InformationElement::IntegratedTotals(BinaryCounterReading {
                    value: -7,
                    sequence: 3,
                    ..Default::default()
                })
            }
            EndOfInit => InformationElement::EndOfInit { cause: 0 },
            SingleCommand | SingleCommandTime56 => InformationElement::SingleCommand {
                state: true,
                select: false,
                qualifier: 0,
            },
            DoubleCommand | DoubleCommandTime56 => InformationElement::DoubleCommand {
                state: 1,
                select: true,
                qualifier: 2,
            },
            RegulatingStep | RegulatingStepTime56 => InformationElement::RegulatingStep {
                state: 2,
                select: false,
                qualifier: 0,
            },
            SetpointNormalized | SetpointNormalizedTime56 => {
                InformationElement::SetpointNormalized {
                    value: 100,
                    select: false,
                    qualifier: 0,
                }
            }
            SetpointScaled | SetpointScaledTime56 => InformationElement::SetpointScaled {
                value: -100,
                select: true,
                qualifier: 0,
            },
            SetpointFloat | SetpointFloatTime56 => InformationElement::SetpointFloat {
                value: 3.5,
                select: false,
                qualifier: 0,
            },
            Bitstring32Command | Bitstring32CommandTime56 => {
                InformationElement::Bitstring32Command { value: 0x0F0F }
            }
            InterrogationCommand => InformationElement::Interrogation { qualifier: 20 },
            CounterInterrogation => InformationElement::CounterInterrogation { qualifier: 5 },
            ReadCommand => InformationElement::Read,
            ClockSync => InformationElement::ClockSync { time },
            TestCommand => InformationElement::TestCommand { pattern: 0xAA55 },
            ResetProcess => InformationElement::ResetProcess { qualifier: 1 },
            TestCommandTime56 => InformationElement::TestCommandTime { counter: 9 },
            FileReady => InformationElement::FileReady {
                file: 1,
                length: 300,
                qualifier: 0,
            },
            TypeId::SectionReady => InformationElement::SectionReady {
                file: 1,
                section: 1,
                length: 100,
                qualifier: 0,
            },
            CallFile => InformationElement::CallFile {
                file: 1,
                section: 0,
                qualifier: 1,
            },
            LastSection => InformationElement::LastSection {
                file: 1,
                section: 1,
                qualifier: 3,
                checksum: 0x42,
            },
            AckFile => InformationElement::AckFile {
                file: 1,
                section: 1,
                qualifier: 3,
            },
            Segment => InformationElement::Segment {
                file: 1,
                section: 1,
                data: Bytes::from_static(b"abc"),
            },
            Directory => InformationElement::Directory {
                file: 2,
                length: 1000,
                status: 0x20,
                time,
            },
        }
    }

    #[test]
    fn test_vsq() {
        let vsq = Vsq::new(10, true);
        assert_eq!(vsq.as_u8(), 0x8A);

        let vsq = Vsq::from_u8(0x8A);
        assert_eq!(vsq.count, 10);
        assert!(vsq.sequence);
    }

    #[test]
    fn test_ioa() {
        let ioa = Ioa(0x123456);
        assert_eq!(ioa.to_bytes(), [0x56, 0x34, 0x12]);
        assert_eq!(Ioa::from_bytes(&[0x56, 0x34, 0x12]).unwrap().value(), 0x123456);
        assert!(Ioa::new(0x0100_0000).is_none());
        assert!(Ioa::from_bytes(&[0x01]).is_err());
    }

    #[test]
    fn test_every_type_survives_encoding() {
        for type_id in TypeId::ALL {
            let mut object = InformationObject::new(Ioa(4001), sample_element(type_id));
            if type_id.has_time_tag() {
                object = object.with_time(Cp56Time2a::default());
            }
            let asdu = Asdu::single(
                AsduHeader::new(type_id, Cot::Spontaneous, 7).with_originator(3),
                object,
            );
            let bytes = asdu.encode().unwrap();
            assert_eq!(bytes.len(), asdu.encoded_len(), "{}", type_id);
            assert_eq!(Asdu::decode(&bytes).unwrap(), asdu, "{}", type_id);
        }
    }

    #[test]
    fn test_decode_float_spontaneous() {
        let bytes = [
            0x0D, 0x01, 0x03, 0x00, 0x01, 0x00, // header
            0xE9, 0x03, 0x00, // IOA 1001
            0x00, 0x00, 0xBC, 0x41, 0x00, // 23.5, good
        ];
        let asdu = Asdu::decode(&bytes).unwrap();
        assert_eq!(asdu.type_id(), TypeId::MeasuredFloat);
        assert_eq!(asdu.header.cot, Cot::Spontaneous);
        assert_eq!(asdu.header.common_address, 1);
        assert_eq!(asdu.objects.len(), 1);
        assert_eq!(asdu.objects[0].ioa, Ioa(1001));
        assert_eq!(
            asdu.objects[0].element,
            InformationElement::ShortFloat {
                value: 23.5,
                quality: Quality::Good,
            }
        );
    }

    #[test]
    fn test_decode_sequential_addresses() {
        let bytes = [
            0x01, 0x83, 0x14, 0x00, 0x01, 0x00, // 3 objects, SQ, interrogated
            0x64, 0x00, 0x00, // IOA 100
            0x01, 0x00, 0x81,
        ];
        let asdu = Asdu::decode(&bytes).unwrap();
        let ioas: Vec<u32> = asdu.objects.iter().map(|o| o.ioa.0).collect();
        assert_eq!(ioas, vec![100, 101, 102]);
        assert_eq!(asdu.encode().unwrap().as_ref(), &bytes);
    }

    #[test]
    fn test_decode_length_must_match() {
        let mut bytes = vec![0x0B, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x10, 0x00, 0x00];
        assert!(Asdu::decode(&bytes).is_ok());

        bytes.push(0xFF);
        assert!(matches!(
            Asdu::decode(&bytes),
            Err(Iec60870Error::Malformed(_))
        ));

        bytes.truncate(10);
        assert!(matches!(
            Asdu::decode(&bytes),
            Err(Iec60870Error::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_unknown_codes() {
        // CP24 time tag types are not supported
        let bytes = [0x02, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0, 0, 0];
        assert!(matches!(
            Asdu::decode(&bytes),
            Err(Iec60870Error::UnknownTypeId(2))
        ));

        let bytes = [0x01, 0x01, 0x0E, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01];
        assert!(matches!(
            Asdu::decode(&bytes),
            Err(Iec60870Error::UnknownCot(14))
        ));
    }

    #[test]
    fn test_decode_zero_objects() {
        let bytes = [0x01, 0x00, 0x03, 0x00, 0x01, 0x00];
        assert!(matches!(
            Asdu::decode(&bytes),
            Err(Iec60870Error::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_validation() {
        let header = AsduHeader::new(TypeId::SinglePoint, Cot::Spontaneous, 1);

        // No objects
        assert!(Asdu::new(header).encode().is_err());

        // Wrong element for the type
        let asdu = Asdu::single(
            header,
            InformationObject::new(Ioa(1), InformationElement::Interrogation { qualifier: 20 }),
        );
        assert!(asdu.encode().is_err());

        // Time tag on an untagged type
        let asdu = Asdu::single(
            header,
            InformationObject::new(Ioa(1), sample_element(TypeId::SinglePoint))
                .with_time(Cp56Time2a::default()),
        );
        assert!(asdu.encode().is_err());

        // IOA out of range
        let asdu = Asdu::single(
            header,
            InformationObject::new(Ioa(0x0100_0000), sample_element(TypeId::SinglePoint)),
        );
        assert!(asdu.encode().is_err());

        // Sequential addresses must be consecutive
        let mut header_sq = header;
        header_sq.vsq.sequence = true;
        let mut asdu = Asdu::new(header_sq);
        asdu.push(InformationObject::new(Ioa(10), sample_element(TypeId::SinglePoint)));
        asdu.push(InformationObject::new(Ioa(12), sample_element(TypeId::SinglePoint)));
        assert!(asdu.encode().is_err());

        // Count out of sync with objects
        let mut asdu = Asdu::single(
            header,
            InformationObject::new(Ioa(1), sample_element(TypeId::SinglePoint)),
        );
        asdu.header.vsq.count = 2;
        assert!(asdu.encode().is_err());
    }

    #[test]
    fn test_header_flags() {
        let mut header = AsduHeader::new(TypeId::SingleCommand, Cot::ActivationConfirm, 0x0102);
        header.negative = true;
        header.test = true;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.as_ref(), &[45, 0x00, 0xC7, 0x00, 0x02, 0x01]);

        let parsed = AsduHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_mirror() {
        let request = Asdu::single(
            AsduHeader::new(TypeId::InterrogationCommand, Cot::Activation, 1),
            InformationObject::new(Ioa(0), InformationElement::Interrogation { qualifier: 20 }),
        );
        let reply = request.mirror(Cot::ActivationConfirm, true);
        assert_eq!(reply.header.cot, Cot::ActivationConfirm);
        assert!(reply.header.negative);
        assert_eq!(reply.objects, request.objects);
    }
}
