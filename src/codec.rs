//! Frame codec (C1). Encode/decode BusPro telegrams.
//!
//! Wire layout (not fixed by spec.md, chosen to match the observed-frame
//! language it uses — "offset 21" for the opcode): a minimal framing with
//! source/destination address, a 16-bit opcode at a fixed offset, and a
//! variable-length payload tail. Grounded on the teacher's
//! `uwb_hub.rs::process_packet` decode/validate shape (length check, then
//! field extraction, never panicking on short input).

use crate::error::{BridgeError, BridgeResult};
use crate::model::Address;

/// Offset of the 2-byte big-endian opcode within a raw frame, as observed
/// on the gateways this bridge talks to.
pub const OPCODE_OFFSET: usize = 21;
const MIN_FRAME_LEN: usize = OPCODE_OFFSET + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub source_address: Address,
    pub destination_address: Address,
    pub op_code: u16,
    pub payload: Vec<u8>,
}

/// Decodes a raw UDP datagram into a `Telegram`.
///
/// Only byte-level malformation (frame too short) is a decode error —
/// an unrecognized opcode still decodes fine; "unknown meaning" is handled
/// one layer up by the sensor/dispatch registry.
pub fn decode(bytes: &[u8]) -> BridgeResult<Telegram> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(BridgeError::DecodeError);
    }
    let source_address = Address {
        subnet: bytes[0],
        device: bytes[1],
        channel: bytes.get(2).copied().unwrap_or(0),
    };
    let destination_address = Address {
        subnet: bytes[3],
        device: bytes[4],
        channel: bytes.get(5).copied().unwrap_or(0),
    };
    let op_code = raw_opcode_at(bytes).ok_or(BridgeError::DecodeError)?;
    let payload = bytes[MIN_FRAME_LEN..].to_vec();

    Ok(Telegram {
        source_address,
        destination_address,
        op_code,
        payload,
    })
}

/// Peeks the raw 2-byte opcode at the fixed offset without fully decoding,
/// so unrecognized/malformed frames can still be traced as `raw:0x....`.
pub fn raw_opcode_at(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < MIN_FRAME_LEN {
        return None;
    }
    Some(u16::from_be_bytes([bytes[OPCODE_OFFSET], bytes[OPCODE_OFFSET + 1]]))
}

/// Encodes a `Telegram` back into wire bytes.
pub fn encode(telegram: &Telegram) -> Vec<u8> {
    let mut out = vec![0u8; MIN_FRAME_LEN];
    out[0] = telegram.source_address.subnet;
    out[1] = telegram.source_address.device;
    out[2] = telegram.source_address.channel;
    out[3] = telegram.destination_address.subnet;
    out[4] = telegram.destination_address.device;
    out[5] = telegram.destination_address.channel;
    out[OPCODE_OFFSET..OPCODE_OFFSET + 2].copy_from_slice(&telegram.op_code.to_be_bytes());
    out.extend_from_slice(&telegram.payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(op_code: u16, payload: &[u8]) -> Vec<u8> {
        let t = Telegram {
            source_address: Address { subnet: 1, device: 100, channel: 2 },
            destination_address: Address { subnet: 1, device: 1, channel: 0 },
            op_code,
            payload: payload.to_vec(),
        };
        encode(&t)
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let bytes = sample_bytes(0x1605, &[1, 2, 3]);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.op_code, 0x1605);
        assert_eq!(decoded.source_address, Address { subnet: 1, device: 100, channel: 2 });
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn short_frame_is_decode_error() {
        let bytes = vec![0u8; 4];
        assert!(matches!(decode(&bytes), Err(BridgeError::DecodeError)));
    }

    #[test]
    fn raw_opcode_peek_works_even_when_payload_empty() {
        let bytes = sample_bytes(0xE3D9, &[]);
        assert_eq!(raw_opcode_at(&bytes), Some(0xE3D9));
    }
}
