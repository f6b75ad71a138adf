//! BusPro opcode constants.
//!
//! spec.md is explicit that byte-level constants already fixed by the bus
//! are out of scope here — only semantics are specified. These values name
//! the opcodes the rest of the crate matches on; swap them for the real
//! vendor constants when wiring against an actual gateway.

pub const CURTAIN_SWITCH_CONTROL: u16 = 0x00E7;
pub const CURTAIN_SWITCH_STATUS_RESPONSE: u16 = 0x00E8;
pub const CURTAIN_SWITCH_READ_STATUS: u16 = 0x00E6;

pub const SINGLE_CHANNEL_CONTROL: u16 = 0x0031;
pub const SINGLE_CHANNEL_CONTROL_RESPONSE: u16 = 0x0032;

pub const BROADCAST_TEMPERATURE_RESPONSE: u16 = 0x1904;
pub const READ_SENSORS_IN_ONE_STATUS_RESPONSE: u16 = 0x1605;
pub const READ_SENSORS_FALLBACK: u16 = 0x1630;
pub const READ_SENSORS_ILLUMINANCE_16BIT: u16 = 0x1646;
pub const CONTROL_PANEL_AC_RESPONSE: u16 = 0xE3D9;

/// Bus-reported curtain motion signal (payload[3] in `CURTAIN_SWITCH_STATUS_RESPONSE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurtainStatusSignal {
    /// "no info" on observed gateways.
    NoInfo,
    Opening,
    Closing,
}

pub fn decode_curtain_status_signal(byte: u8) -> CurtainStatusSignal {
    match byte {
        1 => CurtainStatusSignal::Opening,
        2 => CurtainStatusSignal::Closing,
        _ => CurtainStatusSignal::NoInfo,
    }
}
