//! IEC 60870-5-101 link layer: FT1.2 framing, the unbalanced master and the
//! balanced link.

mod balanced;
mod frame;
mod master;

pub use balanced::LinkBalanced;
pub use frame::{
    primary_control, Ft12Codec, Ft12Frame, PrimaryFunction, SecondaryFunction, END_BYTE,
    FIXED_START, SINGLE_ACK, VARIABLE_START,
};
pub use master::{LinkEvent, LinkMaster, LinkParams, LinkState, PollClass};
