//! ASDU information object parser.
//!
//! This module turns decoded monitoring-direction ASDUs into structured
//! `DataPoint` values for the application.

use crate::types::{normalized_to_f32, Asdu, DataPoint, DataValue, InformationElement, Quality};

/// Extract the data points carried by an ASDU.
///
/// Only monitoring-direction process information yields points; commands,
/// system and file transfer ASDUs return an empty list.
///
/// # Example
///
/// ```rust,ignore
/// let asdu = Asdu::decode(&bytes)?;
/// for point in parse_asdu(&asdu, asdu.header.common_address) {
///     println!("IOA {}: {:?} ({})", point.ioa, point.value, point.quality);
/// }
/// ```
pub fn parse_asdu(asdu: &Asdu, source_address: u16) -> Vec<DataPoint> {
    if !asdu.header.type_id.is_monitoring() {
        return Vec::new();
    }

    asdu.objects
        .iter()
        .filter_map(|object| {
            let (value, quality) = element_value(&object.element)?;
            Some(
                DataPoint::new(source_address, object.ioa.value(), value)
                    .with_quality(quality)
                    .with_timestamp(object.time),
            )
        })
        .collect()
}

/// Map one element to a value and quality, `None` for non-data elements.
fn element_value(element: &InformationElement) -> Option<(DataValue, Quality)> {
    let mapped = match element {
        InformationElement::SinglePoint { value, quality } => (DataValue::Single(*value), *quality),
        InformationElement::DoublePoint { value, quality } => (DataValue::Double(*value), *quality),
        InformationElement::StepPosition {
            value,
            transient,
            quality,
        } => (
            DataValue::StepPosition {
                value: *value,
                transient: *transient,
            },
            *quality,
        ),
        InformationElement::Bitstring { value, quality } => (DataValue::Bitstring(*value), *quality),
        InformationElement::Normalized { value, quality } => {
            (DataValue::Normalized(normalized_to_f32(*value)), *quality)
        }
        InformationElement::Scaled { value, quality } => (DataValue::Scaled(*value), *quality),
        InformationElement::ShortFloat { value, quality } => (DataValue::Float(*value), *quality),
        InformationElement::IntegratedTotals(bcr) => (
            DataValue::Counter(*bcr),
            Quality::Good.set_invalid(bcr.invalid),
        ),
        _ => return None,
    };
    Some(mapped)
}
