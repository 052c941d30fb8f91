//! IEC 60870-5 type definitions.
//!
//! This module contains the core types shared by the 101 and 104 profiles:
//!
//! - `TypeId` - Type identification (M_SP_NA_1, etc.)
//! - `Cot` - Cause of transmission
//! - `Apci` - Application Protocol Control Information (104 only)
//! - `Asdu` - Application Service Data Unit
//! - `InformationElement` - Typed payload of one information object
//! - `Cp56Time2a` - Seven byte time tag
//! - `DataPoint` - Unified data point structure
//! - `DataValue` - Data value variants

mod apci;
mod asdu;
mod cot;
mod data;
mod element;
mod time;
mod type_id;

pub use apci::*;
pub use asdu::*;
pub use cot::*;
pub use data::*;
pub use element::*;
pub use time::*;
pub use type_id::*;
