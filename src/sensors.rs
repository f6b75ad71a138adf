//! Sensor & dry-contact decoders (C6).
//!
//! Opcode-keyed decoders producing a tagged `SensorReading`; unknown
//! opcodes are kept in a bounded ring buffer for the sniffer API. Grounded
//! on `uwb_hub.rs::process_packet`'s decode/validate/dispatch shape —
//! never panics on a short or unexpected payload.

use std::collections::VecDeque;

use serde::Serialize;

use crate::codec::Telegram;
use crate::model::Address;
use crate::opcodes;

const SNIFFER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorReading {
    Temperature { address: Address, sensor_id: u8, value: f64 },
    Humidity { address: Address, sensor_id: u8, value: f64 },
    Illuminance { address: Address, sensor_id: u8, value: f64 },
    DryContact { address: Address, on: bool, x: u8 },
    Raw { address: Address, opcode: u16, bytes: Vec<u8> },
}

/// Decodes one telegram's payload into a typed reading, given the
/// previously-peeked opcode. Unknown opcodes yield `SensorReading::Raw`.
pub fn decode_reading(op_code: u16, telegram: &Telegram) -> SensorReading {
    let address = telegram.source_address;
    let payload = &telegram.payload;

    match op_code {
        opcodes::BROADCAST_TEMPERATURE_RESPONSE => decode_temperature(address, payload),
        opcodes::READ_SENSORS_IN_ONE_STATUS_RESPONSE => decode_sensors_in_one(address, payload),
        opcodes::READ_SENSORS_FALLBACK => decode_temperature_short(address, payload),
        opcodes::READ_SENSORS_ILLUMINANCE_16BIT => decode_illuminance_16bit(address, payload),
        opcodes::CONTROL_PANEL_AC_RESPONSE => decode_dry_contact(address, payload),
        other => SensorReading::Raw { address, opcode: other, bytes: payload.clone() },
    }
}

fn decode_temperature(address: Address, payload: &[u8]) -> SensorReading {
    // float32 little-endian at payload[2:6]; fall back to the 2-byte short
    // form ([sensor_id, value]) used by 12-in-1 modules when too short.
    if payload.len() >= 6 {
        let sensor_id = payload[0];
        let bytes: [u8; 4] = payload[2..6].try_into().unwrap();
        let value = f32::from_le_bytes(bytes) as f64;
        SensorReading::Temperature { address, sensor_id, value }
    } else {
        decode_temperature_short(address, payload)
    }
}

fn decode_temperature_short(address: Address, payload: &[u8]) -> SensorReading {
    if payload.len() >= 2 {
        SensorReading::Temperature { address, sensor_id: payload[0], value: payload[1] as f64 }
    } else {
        SensorReading::Raw { address, opcode: opcodes::READ_SENSORS_FALLBACK, bytes: payload.to_vec() }
    }
}

fn decode_sensors_in_one(address: Address, payload: &[u8]) -> SensorReading {
    // Secondary layout: illuminance 16-bit at payload[2:4] with
    // payload[5:8] == 0xFFFFFF marking "no humidity reading present".
    if payload.len() >= 8 && payload[5..8] == [0xFF, 0xFF, 0xFF] {
        let sensor_id = payload[0];
        let bytes: [u8; 2] = payload[2..4].try_into().unwrap();
        let value = u16::from_le_bytes(bytes) as f64;
        return SensorReading::Illuminance { address, sensor_id, value };
    }
    if payload.len() >= 3 {
        let sensor_id = payload[0];
        let value = payload[2] as f64;
        return SensorReading::Humidity { address, sensor_id, value };
    }
    SensorReading::Raw { address, opcode: opcodes::READ_SENSORS_IN_ONE_STATUS_RESPONSE, bytes: payload.to_vec() }
}

fn decode_illuminance_16bit(address: Address, payload: &[u8]) -> SensorReading {
    if payload.len() >= 4 {
        let sensor_id = payload[0];
        let bytes: [u8; 2] = payload[2..4].try_into().unwrap();
        let value = u16::from_le_bytes(bytes) as f64;
        SensorReading::Illuminance { address, sensor_id, value }
    } else {
        SensorReading::Raw { address, opcode: opcodes::READ_SENSORS_ILLUMINANCE_16BIT, bytes: payload.to_vec() }
    }
}

fn decode_dry_contact(address: Address, payload: &[u8]) -> SensorReading {
    // The first payload byte varies by firmware and must not gate
    // acceptance — it's carried through only as a diagnostic attribute.
    let x = payload.first().copied().unwrap_or(0);
    let on = payload.get(1).map(|b| *b != 0).unwrap_or(x != 0);
    SensorReading::DryContact { address, on, x }
}

/// Bounded ring buffer of unrecognized telegrams for the sniffer API.
#[derive(Debug, Default)]
pub struct Sniffer {
    recent: VecDeque<(u16, Vec<u8>)>,
}

impl Sniffer {
    pub fn new() -> Self {
        Self { recent: VecDeque::with_capacity(SNIFFER_CAPACITY) }
    }

    pub fn record(&mut self, opcode: u16, bytes: Vec<u8>) {
        if self.recent.len() == SNIFFER_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back((opcode, bytes));
    }

    pub fn recent(&self) -> impl Iterator<Item = &(u16, Vec<u8>)> {
        self.recent.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Address;

    fn telegram(payload: Vec<u8>) -> Telegram {
        Telegram {
            source_address: Address { subnet: 1, device: 20, channel: 1 },
            destination_address: Address { subnet: 1, device: 1, channel: 0 },
            op_code: 0,
            payload,
        }
    }

    #[test]
    fn decodes_float32_temperature() {
        let mut payload = vec![3u8, 0u8];
        payload.extend_from_slice(&21.5f32.to_le_bytes());
        let reading = decode_reading(opcodes::BROADCAST_TEMPERATURE_RESPONSE, &telegram(payload));
        match reading {
            SensorReading::Temperature { sensor_id, value, .. } => {
                assert_eq!(sensor_id, 3);
                assert!((value - 21.5).abs() < 0.01);
            }
            _ => panic!("expected Temperature"),
        }
    }

    #[test]
    fn decodes_illuminance_secondary_layout() {
        let payload = vec![1u8, 0u8, 200, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        let reading = decode_reading(opcodes::READ_SENSORS_IN_ONE_STATUS_RESPONSE, &telegram(payload));
        assert!(matches!(reading, SensorReading::Illuminance { value, .. } if value == 200.0));
    }

    #[test]
    fn unknown_opcode_is_raw() {
        let reading = decode_reading(0xBEEF, &telegram(vec![1, 2, 3]));
        assert!(matches!(reading, SensorReading::Raw { opcode: 0xBEEF, .. }));
    }

    #[test]
    fn dry_contact_ignores_varying_first_byte() {
        let a = decode_reading(opcodes::CONTROL_PANEL_AC_RESPONSE, &telegram(vec![7, 1]));
        let b = decode_reading(opcodes::CONTROL_PANEL_AC_RESPONSE, &telegram(vec![200, 1]));
        match (a, b) {
            (SensorReading::DryContact { on: on_a, .. }, SensorReading::DryContact { on: on_b, .. }) => {
                assert_eq!(on_a, on_b);
            }
            _ => panic!("expected DryContact"),
        }
    }

    #[test]
    fn sniffer_ring_buffer_is_bounded() {
        let mut sniffer = Sniffer::new();
        for i in 0..(SNIFFER_CAPACITY + 10) {
            sniffer.record(i as u16, vec![]);
        }
        assert_eq!(sniffer.recent().count(), SNIFFER_CAPACITY);
    }
}
