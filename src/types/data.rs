//! Data point types for IEC 60870-5.
//!
//! This module defines the unified data structures handed to the application
//! for information objects received in the monitoring direction.

use super::Cp56Time2a;

/// Unified data point representing a received information object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Where the point came from: the ASDU common address on 104, the slave
    /// link address on 101.
    pub source_address: u16,
    /// Information object address (IOA)
    pub ioa: u32,
    /// Data value
    pub value: DataValue,
    /// Quality flags
    pub quality: Quality,
    /// Timestamp (if present)
    pub timestamp: Option<Cp56Time2a>,
}

impl DataPoint {
    /// Create a new data point with good quality and no timestamp.
    #[inline]
    pub const fn new(source_address: u16, ioa: u32, value: DataValue) -> Self {
        Self {
            source_address,
            ioa,
            value,
            quality: Quality::Good,
            timestamp: None,
        }
    }

    /// Set quality.
    #[inline]
    pub const fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Set timestamp.
    #[inline]
    pub const fn with_timestamp(mut self, timestamp: Option<Cp56Time2a>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check if the data point has good quality.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.quality.is_good()
    }

    /// Get the value as f64 if numeric.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Get the value as bool if boolean.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }
}

/// Double-point information value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoublePointValue {
    /// Indeterminate or intermediate (00)
    Intermediate = 0,
    /// Determined OFF (01)
    Off = 1,
    /// Determined ON (10)
    On = 2,
    /// Indeterminate (11)
    Indeterminate = 3,
}

impl DoublePointValue {
    /// Parse from byte (lower 2 bits).
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Intermediate,
            1 => Self::Off,
            2 => Self::On,
            _ => Self::Indeterminate,
        }
    }

    /// Raw 2-bit value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Counter reading flags and value (BCR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryCounterReading {
    /// Counter value
    pub value: i32,
    /// Sequence number (0-31)
    pub sequence: u8,
    /// Counter overflowed since last reading (CY)
    pub carry: bool,
    /// Counter was adjusted since last reading (CA)
    pub adjusted: bool,
    /// Reading is invalid (IV)
    pub invalid: bool,
}

/// Data value types.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// Single-point information (M_SP_NA_1, M_SP_TB_1)
    Single(bool),

    /// Double-point information (M_DP_NA_1, M_DP_TB_1)
    Double(DoublePointValue),

    /// Step position (-64 to +63) (M_ST_NA_1, M_ST_TB_1)
    StepPosition {
        value: i8,
        transient: bool,
    },

    /// Bitstring of 32 bits (M_BO_NA_1, M_BO_TB_1)
    Bitstring(u32),

    /// Normalized value -1.0 to +1.0 (M_ME_NA_1, M_ME_TD_1)
    Normalized(f32),

    /// Scaled value (M_ME_NB_1, M_ME_TE_1)
    Scaled(i16),

    /// Short floating point (M_ME_NC_1, M_ME_TF_1)
    Float(f32),

    /// Integrated totals (M_IT_NA_1, M_IT_TB_1)
    Counter(BinaryCounterReading),
}

impl DataValue {
    /// Convert to f64 if numeric.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Single(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Double(v) => match v {
                DoublePointValue::Off => Some(0.0),
                DoublePointValue::On => Some(1.0),
                _ => None,
            },
            Self::StepPosition { value, .. } => Some(*value as f64),
            Self::Bitstring(v) => Some(*v as f64),
            Self::Normalized(v) => Some(*v as f64),
            Self::Scaled(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Counter(c) => Some(c.value as f64),
        }
    }

    /// Convert to bool if boolean type.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Single(v) => Some(*v),
            Self::Double(DoublePointValue::Off) => Some(false),
            Self::Double(DoublePointValue::On) => Some(true),
            _ => None,
        }
    }
}

/// Convert a raw normalized value (NVA) to -1.0..1.0.
#[inline]
pub fn normalized_to_f32(raw: i16) -> f32 {
    raw as f32 / 32768.0
}

/// Convert -1.0..1.0 to a raw normalized value, saturating at the ends.
#[inline]
pub fn f32_to_normalized(value: f32) -> i16 {
    (value * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Quality flags for data points.
///
/// Uses the QDS bit layout directly so that SIQ/DIQ/QDS bytes convert with a mask:
/// - Bit 0: overflow (OV, QDS only)
/// - Bit 4: blocked (BL)
/// - Bit 5: substituted (SB)
/// - Bit 6: not topical (NT)
/// - Bit 7: invalid (IV)
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Quality(u8);

impl Quality {
    const OV_MASK: u8 = 0x01;
    const BL_MASK: u8 = 0x10;
    const SB_MASK: u8 = 0x20;
    const NT_MASK: u8 = 0x40;
    const IV_MASK: u8 = 0x80;

    const SIQ_MASK: u8 = Self::BL_MASK | Self::SB_MASK | Self::NT_MASK | Self::IV_MASK;
    const QDS_MASK: u8 = Self::SIQ_MASK | Self::OV_MASK;

    /// Good quality (all flags false).
    #[allow(non_upper_case_globals)]
    pub const Good: Self = Self(0);

    /// Invalid quality.
    #[allow(non_upper_case_globals)]
    pub const Invalid: Self = Self(Self::IV_MASK);

    #[inline(always)]
    const fn with_flag(self, mask: u8, value: bool) -> Self {
        if value {
            Self(self.0 | mask)
        } else {
            Self(self.0 & !mask)
        }
    }

    /// Overflow (OV) - value exceeds predefined range
    #[inline(always)]
    pub const fn overflow(&self) -> bool {
        (self.0 & Self::OV_MASK) != 0
    }

    /// Set overflow flag
    #[inline(always)]
    pub const fn set_overflow(self, value: bool) -> Self {
        self.with_flag(Self::OV_MASK, value)
    }

    /// Blocked (BL) - value is blocked for transmission
    #[inline(always)]
    pub const fn blocked(&self) -> bool {
        (self.0 & Self::BL_MASK) != 0
    }

    /// Set blocked flag
    #[inline(always)]
    pub const fn set_blocked(self, value: bool) -> Self {
        self.with_flag(Self::BL_MASK, value)
    }

    /// Substituted (SB)
    #[inline(always)]
    pub const fn substituted(&self) -> bool {
        (self.0 & Self::SB_MASK) != 0
    }

    /// Set substituted flag
    #[inline(always)]
    pub const fn set_substituted(self, value: bool) -> Self {
        self.with_flag(Self::SB_MASK, value)
    }

    /// Not topical (NT) - value is outdated
    #[inline(always)]
    pub const fn not_topical(&self) -> bool {
        (self.0 & Self::NT_MASK) != 0
    }

    /// Set not_topical flag
    #[inline(always)]
    pub const fn set_not_topical(self, value: bool) -> Self {
        self.with_flag(Self::NT_MASK, value)
    }

    /// Invalid (IV)
    #[inline(always)]
    pub const fn invalid(&self) -> bool {
        (self.0 & Self::IV_MASK) != 0
    }

    /// Set invalid flag
    #[inline(always)]
    pub const fn set_invalid(self, value: bool) -> Self {
        self.with_flag(Self::IV_MASK, value)
    }

    /// Parse from QDS byte (quality descriptor of measured values).
    #[inline(always)]
    pub const fn from_qds(byte: u8) -> Self {
        Self(byte & Self::QDS_MASK)
    }

    /// Encode as QDS byte.
    #[inline(always)]
    pub const fn to_qds(self) -> u8 {
        self.0 & Self::QDS_MASK
    }

    /// Parse the quality bits of a SIQ or DIQ byte.
    #[inline(always)]
    pub const fn from_siq(byte: u8) -> Self {
        Self(byte & Self::SIQ_MASK)
    }

    /// Quality bits for a SIQ or DIQ byte; OV has no place there and is dropped.
    #[inline(always)]
    pub const fn to_siq(self) -> u8 {
        self.0 & Self::SIQ_MASK
    }

    /// Check if quality is good (no flags set).
    #[inline(always)]
    pub const fn is_good(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Quality({})", self)
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_good() {
            return f.write_str("Good");
        }

        let flags = [
            (self.overflow(), "OV"),
            (self.blocked(), "BL"),
            (self.substituted(), "SB"),
            (self.not_topical(), "NT"),
            (self.invalid(), "IV"),
        ];
        let mut first = true;
        for (set, name) in flags {
            if set {
                if !first {
                    f.write_str("|")?;
                }
                first = false;
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}
