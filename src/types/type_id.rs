//! IEC 60870-5 Type Identification.
//!
//! Type identification defines the structure and meaning of information objects.

use crate::error::{Iec60870Error, Result};

/// IEC 60870-5 Type Identification.
///
/// Defines the type of information contained in an ASDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // ============================================
    // Process information in monitoring direction
    // ============================================
    /// Single-point information (M_SP_NA_1)
    SinglePoint = 1,

    /// Double-point information (M_DP_NA_1)
    DoublePoint = 3,

    /// Step position information (M_ST_NA_1)
    StepPosition = 5,

    /// Bitstring of 32 bit (M_BO_NA_1)
    Bitstring32 = 7,

    /// Measured value, normalized (M_ME_NA_1)
    MeasuredNormalized = 9,

    /// Measured value, scaled (M_ME_NB_1)
    MeasuredScaled = 11,

    /// Measured value, short floating point (M_ME_NC_1)
    MeasuredFloat = 13,

    /// Integrated totals (M_IT_NA_1)
    IntegratedTotals = 15,

    /// Single-point information with time tag CP56Time2a (M_SP_TB_1)
    SinglePointTime56 = 30,

    /// Double-point information with time tag CP56Time2a (M_DP_TB_1)
    DoublePointTime56 = 31,

    /// Step position information with time tag CP56Time2a (M_ST_TB_1)
    StepPositionTime56 = 32,

    /// Bitstring of 32 bit with time tag CP56Time2a (M_BO_TB_1)
    Bitstring32Time56 = 33,

    /// Measured value, normalized with time tag CP56Time2a (M_ME_TD_1)
    MeasuredNormalizedTime56 = 34,

    /// Measured value, scaled with time tag CP56Time2a (M_ME_TE_1)
    MeasuredScaledTime56 = 35,

    /// Measured value, short floating point with time tag CP56Time2a (M_ME_TF_1)
    MeasuredFloatTime56 = 36,

    /// Integrated totals with time tag CP56Time2a (M_IT_TB_1)
    IntegratedTotalsTime56 = 37,

    // ============================================
    // Process information in control direction
    // ============================================
    /// Single command (C_SC_NA_1)
    SingleCommand = 45,

    /// Double command (C_DC_NA_1)
    DoubleCommand = 46,

    /// Regulating step command (C_RC_NA_1)
    RegulatingStep = 47,

    /// Set-point command, normalized (C_SE_NA_1)
    SetpointNormalized = 48,

    /// Set-point command, scaled (C_SE_NB_1)
    SetpointScaled = 49,

    /// Set-point command, short floating point (C_SE_NC_1)
    SetpointFloat = 50,

    /// Bitstring of 32 bit command (C_BO_NA_1)
    Bitstring32Command = 51,

    /// Single command with time tag CP56Time2a (C_SC_TA_1)
    SingleCommandTime56 = 58,

    /// Double command with time tag CP56Time2a (C_DC_TA_1)
    DoubleCommandTime56 = 59,

    /// Regulating step command with time tag CP56Time2a (C_RC_TA_1)
    RegulatingStepTime56 = 60,

    /// Set-point command, normalized with time tag CP56Time2a (C_SE_TA_1)
    SetpointNormalizedTime56 = 61,

    /// Set-point command, scaled with time tag CP56Time2a (C_SE_TB_1)
    SetpointScaledTime56 = 62,

    /// Set-point command, short floating point with time tag CP56Time2a (C_SE_TC_1)
    SetpointFloatTime56 = 63,

    /// Bitstring of 32 bit command with time tag CP56Time2a (C_BO_TA_1)
    Bitstring32CommandTime56 = 64,

    // ============================================
    // System information in monitoring direction
    // ============================================
    /// End of initialization (M_EI_NA_1)
    EndOfInit = 70,

    // ============================================
    // System information in control direction
    // ============================================
    /// Interrogation command (C_IC_NA_1)
    InterrogationCommand = 100,

    /// Counter interrogation command (C_CI_NA_1)
    CounterInterrogation = 101,

    /// Read command (C_RD_NA_1)
    ReadCommand = 102,

    /// Clock synchronization command (C_CS_NA_1)
    ClockSync = 103,

    /// Test command (C_TS_NA_1)
    TestCommand = 104,

    /// Reset process command (C_RP_NA_1)
    ResetProcess = 105,

    /// Test command with time tag CP56Time2a (C_TS_TA_1)
    TestCommandTime56 = 107,

    // ============================================
    // File transfer
    // ============================================
    /// File ready (F_FR_NA_1)
    FileReady = 120,

    /// Section ready (F_SR_NA_1)
    SectionReady = 121,

    /// Call directory, select file, call file, call section (F_SC_NA_1)
    CallFile = 122,

    /// Last section, last segment (F_LS_NA_1)
    LastSection = 123,

    /// Ack file, ack section (F_AF_NA_1)
    AckFile = 124,

    /// Segment (F_SG_NA_1)
    Segment = 125,

    /// Directory (F_DR_TA_1)
    Directory = 126,
}

impl TypeId {
    /// Create TypeId from raw byte value.
    #[inline]
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::SinglePoint),
            3 => Ok(Self::DoublePoint),
            5 => Ok(Self::StepPosition),
            7 => Ok(Self::Bitstring32),
            9 => Ok(Self::MeasuredNormalized),
            11 => Ok(Self::MeasuredScaled),
            13 => Ok(Self::MeasuredFloat),
            15 => Ok(Self::IntegratedTotals),
            30 => Ok(Self::SinglePointTime56),
            31 => Ok(Self::DoublePointTime56),
            32 => Ok(Self::StepPositionTime56),
            33 => Ok(Self::Bitstring32Time56),
            34 => Ok(Self::MeasuredNormalizedTime56),
            35 => Ok(Self::MeasuredScaledTime56),
            36 => Ok(Self::MeasuredFloatTime56),
            37 => Ok(Self::IntegratedTotalsTime56),
            45 => Ok(Self::SingleCommand),
            46 => Ok(Self::DoubleCommand),
            47 => Ok(Self::RegulatingStep),
            48 => Ok(Self::SetpointNormalized),
            49 => Ok(Self::SetpointScaled),
            50 => Ok(Self::SetpointFloat),
            51 => Ok(Self::Bitstring32Command),
            58 => Ok(Self::SingleCommandTime56),
            59 => Ok(Self::DoubleCommandTime56),
            60 => Ok(Self::RegulatingStepTime56),
            61 => Ok(Self::SetpointNormalizedTime56),
            62 => Ok(Self::SetpointScaledTime56),
            63 => Ok(Self::SetpointFloatTime56),
            64 => Ok(Self::Bitstring32CommandTime56),
            70 => Ok(Self::EndOfInit),
            100 => Ok(Self::InterrogationCommand),
            101 => Ok(Self::CounterInterrogation),
            102 => Ok(Self::ReadCommand),
            103 => Ok(Self::ClockSync),
            104 => Ok(Self::TestCommand),
            105 => Ok(Self::ResetProcess),
            107 => Ok(Self::TestCommandTime56),
            120 => Ok(Self::FileReady),
            121 => Ok(Self::SectionReady),
            122 => Ok(Self::CallFile),
            123 => Ok(Self::LastSection),
            124 => Ok(Self::AckFile),
            125 => Ok(Self::Segment),
            126 => Ok(Self::Directory),
            _ => Err(Iec60870Error::UnknownTypeId(value)),
        }
    }

    /// Convert to raw byte value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this type is in the monitoring direction (from RTU to master).
    #[inline]
    pub const fn is_monitoring(&self) -> bool {
        matches!(self.as_u8(), 1..=44 | 70)
    }

    /// Check if this type is in the control direction (from master to RTU).
    #[inline]
    pub const fn is_control(&self) -> bool {
        matches!(self.as_u8(), 45..=64 | 100..=107)
    }

    /// Check if this type belongs to the file transfer group.
    #[inline]
    pub const fn is_file_transfer(&self) -> bool {
        matches!(self.as_u8(), 120..=126)
    }

    /// Check if each information object carries a trailing CP56Time2a tag.
    ///
    /// The directory type embeds its time inside the element instead.
    #[inline]
    pub const fn has_time_tag(&self) -> bool {
        matches!(self.as_u8(), 30..=37 | 58..=64 | 107)
    }

    /// Check if the command element carries a select/execute bit.
    #[inline]
    pub const fn supports_select(&self) -> bool {
        matches!(self.as_u8(), 45..=50 | 58..=63)
    }

    /// Get the IEC standard name (e.g., "M_SP_NA_1").
    #[inline]
    pub const fn standard_name(&self) -> &'static str {
        match self {
            Self::SinglePoint => "M_SP_NA_1",
            Self::DoublePoint => "M_DP_NA_1",
            Self::StepPosition => "M_ST_NA_1",
            Self::Bitstring32 => "M_BO_NA_1",
            Self::MeasuredNormalized => "M_ME_NA_1",
            Self::MeasuredScaled => "M_ME_NB_1",
            Self::MeasuredFloat => "M_ME_NC_1",
            Self::IntegratedTotals => "M_IT_NA_1",
            Self::SinglePointTime56 => "M_SP_TB_1",
            Self::DoublePointTime56 => "M_DP_TB_1",
            Self::StepPositionTime56 => "M_ST_TB_1",
            Self::Bitstring32Time56 => "M_BO_TB_1",
            Self::MeasuredNormalizedTime56 => "M_ME_TD_1",
            Self::MeasuredScaledTime56 => "M_ME_TE_1",
            Self::MeasuredFloatTime56 => "M_ME_TF_1",
            Self::IntegratedTotalsTime56 => "M_IT_TB_1",
            Self::SingleCommand => "C_SC_NA_1",
            Self::DoubleCommand => "C_DC_NA_1",
            Self::RegulatingStep => "C_RC_NA_1",
            Self::SetpointNormalized => "C_SE_NA_1",
            Self::SetpointScaled => "C_SE_NB_1",
            Self::SetpointFloat => "C_SE_NC_1",
            Self::Bitstring32Command => "C_BO_NA_1",
            Self::SingleCommandTime56 => "C_SC_TA_1",
            Self::DoubleCommandTime56 => "C_DC_TA_1",
            Self::RegulatingStepTime56 => "C_RC_TA_1",
            Self::SetpointNormalizedTime56 => "C_SE_TA_1",
            Self::SetpointScaledTime56 => "C_SE_TB_1",
            Self::SetpointFloatTime56 => "C_SE_TC_1",
            Self::Bitstring32CommandTime56 => "C_BO_TA_1",
            Self::EndOfInit => "M_EI_NA_1",
            Self::InterrogationCommand => "C_IC_NA_1",
            Self::CounterInterrogation => "C_CI_NA_1",
            Self::ReadCommand => "C_RD_NA_1",
            Self::ClockSync => "C_CS_NA_1",
            Self::TestCommand => "C_TS_NA_1",
            Self::ResetProcess => "C_RP_NA_1",
            Self::TestCommandTime56 => "C_TS_TA_1",
            Self::FileReady => "F_FR_NA_1",
            Self::SectionReady => "F_SR_NA_1",
            Self::CallFile => "F_SC_NA_1",
            Self::LastSection => "F_LS_NA_1",
            Self::AckFile => "F_AF_NA_1",
            Self::Segment => "F_SG_NA_1",
            Self::Directory => "F_DR_TA_1",
        }
    }

    /// All supported type identifications, in numeric order.
    pub const ALL: [TypeId; 45] = [
        Self::SinglePoint,
        Self::DoublePoint,
        Self::StepPosition,
        Self::Bitstring32,
        Self::MeasuredNormalized,
        Self::MeasuredScaled,
        Self::MeasuredFloat,
        Self::IntegratedTotals,
        Self::SinglePointTime56,
        Self::DoublePointTime56,
        Self::StepPositionTime56,
        Self::Bitstring32Time56,
        Self::MeasuredNormalizedTime56,
        Self::MeasuredScaledTime56,
        Self::MeasuredFloatTime56,
        Self::IntegratedTotalsTime56,
        Self::SingleCommand,
        Self::DoubleCommand,
        Self::RegulatingStep,
        Self::SetpointNormalized,
        Self::SetpointScaled,
        Self::SetpointFloat,
        Self::Bitstring32Command,
        Self::SingleCommandTime56,
        Self::DoubleCommandTime56,
        Self::RegulatingStepTime56,
        Self::SetpointNormalizedTime56,
        Self::SetpointScaledTime56,
        Self::SetpointFloatTime56,
        Self::Bitstring32CommandTime56,
        Self::EndOfInit,
        Self::InterrogationCommand,
        Self::CounterInterrogation,
        Self::ReadCommand,
        Self::ClockSync,
        Self::TestCommand,
        Self::ResetProcess,
        Self::TestCommandTime56,
        Self::FileReady,
        Self::SectionReady,
        Self::CallFile,
        Self::LastSection,
        Self::AckFile,
        Self::Segment,
        Self::Directory,
    ];
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.standard_name())
    }
}
