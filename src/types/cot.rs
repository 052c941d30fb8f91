//! IEC 60870-5 Cause of Transmission (COT).
//!
//! The cause of transmission defines the reason for sending an ASDU. On the
//! wire it shares one byte with the test (bit 7) and negative (bit 6) flags.

use crate::error::{Iec60870Error, Result};

/// Cause of Transmission (COT).
///
/// Defines the reason for transmission of an ASDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cot {
    /// Periodic, cyclic (1)
    Periodic = 1,

    /// Background scan (2)
    Background = 2,

    /// Spontaneous (3)
    Spontaneous = 3,

    /// Initialized (4)
    Initialized = 4,

    /// Request or requested (5)
    Request = 5,

    /// Activation (6)
    Activation = 6,

    /// Activation confirmation (7)
    ActivationConfirm = 7,

    /// Deactivation (8)
    Deactivation = 8,

    /// Deactivation confirmation (9)
    DeactivationConfirm = 9,

    /// Activation termination (10)
    ActivationTermination = 10,

    /// Return information caused by a remote command (11)
    ReturnRemoteCommand = 11,

    /// Return information caused by a local command (12)
    ReturnLocalCommand = 12,

    /// File transfer (13)
    FileTransfer = 13,

    /// Interrogated by station interrogation (20)
    InterrogatedByStation = 20,

    /// Interrogated by group 1 interrogation (21)
    InterrogatedByGroup1 = 21,

    /// Interrogated by group 2 interrogation (22)
    InterrogatedByGroup2 = 22,

    /// Interrogated by group 3 interrogation (23)
    InterrogatedByGroup3 = 23,

    /// Interrogated by group 4 interrogation (24)
    InterrogatedByGroup4 = 24,

    /// Interrogated by group 5 interrogation (25)
    InterrogatedByGroup5 = 25,

    /// Interrogated by group 6 interrogation (26)
    InterrogatedByGroup6 = 26,

    /// Interrogated by group 7 interrogation (27)
    InterrogatedByGroup7 = 27,

    /// Interrogated by group 8 interrogation (28)
    InterrogatedByGroup8 = 28,

    /// Interrogated by group 9 interrogation (29)
    InterrogatedByGroup9 = 29,

    /// Interrogated by group 10 interrogation (30)
    InterrogatedByGroup10 = 30,

    /// Interrogated by group 11 interrogation (31)
    InterrogatedByGroup11 = 31,

    /// Interrogated by group 12 interrogation (32)
    InterrogatedByGroup12 = 32,

    /// Interrogated by group 13 interrogation (33)
    InterrogatedByGroup13 = 33,

    /// Interrogated by group 14 interrogation (34)
    InterrogatedByGroup14 = 34,

    /// Interrogated by group 15 interrogation (35)
    InterrogatedByGroup15 = 35,

    /// Interrogated by group 16 interrogation (36)
    InterrogatedByGroup16 = 36,

    /// Requested by general counter request (37)
    RequestedByGeneralCounter = 37,

    /// Requested by group 1 counter request (38)
    RequestedByGroup1Counter = 38,

    /// Requested by group 2 counter request (39)
    RequestedByGroup2Counter = 39,

    /// Requested by group 3 counter request (40)
    RequestedByGroup3Counter = 40,

    /// Requested by group 4 counter request (41)
    RequestedByGroup4Counter = 41,

    /// Unknown type identification (44)
    UnknownTypeId = 44,

    /// Unknown cause of transmission (45)
    UnknownCot = 45,

    /// Unknown common address of ASDU (46)
    UnknownCommonAddress = 46,

    /// Unknown information object address (47)
    UnknownIoa = 47,
}

impl Cot {
    /// Create COT from raw byte value (lower 6 bits).
    #[inline]
    pub fn from_u8(value: u8) -> Result<Self> {
        // COT is in the lower 6 bits
        let cot_value = value & 0x3F;

        match cot_value {
            1 => Ok(Self::Periodic),
            2 => Ok(Self::Background),
            3 => Ok(Self::Spontaneous),
            4 => Ok(Self::Initialized),
            5 => Ok(Self::Request),
            6 => Ok(Self::Activation),
            7 => Ok(Self::ActivationConfirm),
            8 => Ok(Self::Deactivation),
            9 => Ok(Self::DeactivationConfirm),
            10 => Ok(Self::ActivationTermination),
            11 => Ok(Self::ReturnRemoteCommand),
            12 => Ok(Self::ReturnLocalCommand),
            13 => Ok(Self::FileTransfer),
            20 => Ok(Self::InterrogatedByStation),
            21 => Ok(Self::InterrogatedByGroup1),
            22 => Ok(Self::InterrogatedByGroup2),
            23 => Ok(Self::InterrogatedByGroup3),
            24 => Ok(Self::InterrogatedByGroup4),
            25 => Ok(Self::InterrogatedByGroup5),
            26 => Ok(Self::InterrogatedByGroup6),
            27 => Ok(Self::InterrogatedByGroup7),
            28 => Ok(Self::InterrogatedByGroup8),
            29 => Ok(Self::InterrogatedByGroup9),
            30 => Ok(Self::InterrogatedByGroup10),
            31 => Ok(Self::InterrogatedByGroup11),
            32 => Ok(Self::InterrogatedByGroup12),
            33 => Ok(Self::InterrogatedByGroup13),
            34 => Ok(Self::InterrogatedByGroup14),
            35 => Ok(Self::InterrogatedByGroup15),
            36 => Ok(Self::InterrogatedByGroup16),
            37 => Ok(Self::RequestedByGeneralCounter),
            38 => Ok(Self::RequestedByGroup1Counter),
            39 => Ok(Self::RequestedByGroup2Counter),
            40 => Ok(Self::RequestedByGroup3Counter),
            41 => Ok(Self::RequestedByGroup4Counter),
            44 => Ok(Self::UnknownTypeId),
            45 => Ok(Self::UnknownCot),
            46 => Ok(Self::UnknownCommonAddress),
            47 => Ok(Self::UnknownIoa),
            _ => Err(Iec60870Error::UnknownCot(cot_value)),
        }
    }

    /// Convert to raw byte value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the peer refused the request as unknown (COT 44-47).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        matches!(self.as_u8(), 44..=47)
    }

    /// Check if this COT answers an activation or deactivation request.
    ///
    /// Positive or negative is decided by the P/N flag of the header.
    #[inline]
    pub const fn is_confirmation(&self) -> bool {
        matches!(self, Self::ActivationConfirm | Self::DeactivationConfirm)
    }

    /// Check if this COT indicates an interrogation response.
    #[inline]
    pub const fn is_interrogation_response(&self) -> bool {
        matches!(self.as_u8(), 20..=36)
    }

    /// Check if this COT indicates a counter request response.
    #[inline]
    pub const fn is_counter_response(&self) -> bool {
        matches!(self.as_u8(), 37..=41)
    }
}

impl std::fmt::Display for Cot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}
