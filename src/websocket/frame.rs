//! RFC 6455 frame layout.
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking key, if MASK set      |         Payload ...       |
//! +-----------------------------------+---------------------------+
//! ```

use crate::error::{Error, ProtocolError};

pub const TEXT: u8 = 0x1;
pub const BINARY: u8 = 0x2;
pub const CLOSE: u8 = 0x8;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Builds a final frame. Frames from clients carry a masking key.
pub fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(FIN | opcode);
    let mask_bit = if mask.is_some() { MASK } else { 0 };
    match payload.len() {
        len if len < 126 => frame.push(mask_bit | len as u8),
        len if len < 1 << 16 => {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(mask_bit | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    let start = frame.len();
    frame.extend_from_slice(payload);
    if let Some(key) = mask {
        frame.splice(start..start, key);
        apply_mask(&mut frame[start + 4..], key);
    }
    frame
}

/// Decodes the frame at the start of `buf`. Returns the frame and the
/// number of bytes it occupied, or `None` if `buf` holds only part of it.
///
/// Frames from clients (`expect_mask`) have to be masked and frames from
/// servers must not be.
pub fn decode_frame(buf: &[u8], expect_mask: bool) -> Result<Option<(Frame, usize)>, Error> {
    decode_frame_within(buf, expect_mask, usize::MAX)
}

/// Like [`decode_frame`], but fails as soon as the header declares a payload
/// longer than `max_size`.
pub fn decode_frame_within(
    buf: &[u8],
    expect_mask: bool,
    max_size: usize,
) -> Result<Option<(Frame, usize)>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & MASK != 0;
    match (expect_mask, masked) {
        (true, false) => return Err(ProtocolError::MaskNotSet.into()),
        (false, true) => return Err(ProtocolError::UnexpectedMask.into()),
        _ => {}
    }

    let (length, mut offset) = match buf[1] & 0x7f {
        126 => match buf.get(2..4) {
            Some(bytes) => (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 4),
            None => return Ok(None),
        },
        127 => match buf.get(2..10) {
            Some(bytes) => {
                let mut length = [0; 8];
                length.copy_from_slice(bytes);
                (u64::from_be_bytes(length), 10)
            }
            None => return Ok(None),
        },
        length => (length as u64, 2),
    };
    if length > max_size as u64 {
        return Err(ProtocolError::FrameTooLarge {
            allowed: max_size,
            actual: length,
        }
        .into());
    }

    let key = if masked {
        let Some(bytes) = buf.get(offset..offset + 4) else {
            return Ok(None);
        };
        offset += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    let Ok(length) = usize::try_from(length) else {
        return Err(ProtocolError::UnsupportedFrame(buf[1]).into());
    };
    let Some(payload) = buf.get(offset..offset.saturating_add(length)) else {
        return Ok(None);
    };
    let mut payload = payload.to_vec();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }
    Ok(Some((Frame { opcode, payload }, offset + length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(encode_frame(TEXT, &[0; 125], None).len(), 2 + 125);
        assert_eq!(encode_frame(TEXT, &[0; 126], None).len(), 4 + 126);
        assert_eq!(encode_frame(BINARY, &[0; 65536], None).len(), 10 + 65536);
        assert_eq!(
            encode_frame(BINARY, &[0; 65535], Some([1, 2, 3, 4])).len(),
            4 + 4 + 65535
        );
    }

    #[test]
    fn payload_lengths_survive() {
        for length in [0, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();
            for mask in [None, Some([0x37, 0xfa, 0x21, 0x3d])] {
                let encoded = encode_frame(BINARY, &payload, mask);
                let (frame, used) = decode_frame(&encoded, mask.is_some()).unwrap().unwrap();
                assert_eq!(used, encoded.len());
                assert_eq!(frame.opcode, BINARY);
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn rfc_masked_hello() {
        // Example from section 5.7.
        let frame = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (decoded, used) = decode_frame(&frame, true).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(decoded.payload, b"Hello");
        assert_eq!(encode_frame(TEXT, b"Hello", Some([0x37, 0xfa, 0x21, 0x3d])), frame);
    }

    #[test]
    fn partial_frames() {
        let encoded = encode_frame(TEXT, &[7; 300], Some([9, 8, 7, 6]));
        for end in [0, 1, 3, 5, 7, encoded.len() - 1] {
            assert_eq!(decode_frame(&encoded[..end], true), Ok(None));
        }
    }

    #[test]
    fn servers_require_masks() {
        let encoded = encode_frame(TEXT, b"hi", None);
        assert_eq!(
            decode_frame(&encoded, true),
            Err(ProtocolError::MaskNotSet.into())
        );
    }

    #[test]
    fn clients_reject_masks() {
        let encoded = encode_frame(TEXT, b"hi", Some([1, 2, 3, 4]));
        assert_eq!(
            decode_frame(&encoded, false),
            Err(ProtocolError::UnexpectedMask.into())
        );
    }

    #[test]
    fn oversized_lengths_fail_before_the_payload_arrives() {
        // Only the header of a frame declaring 2^62 bytes.
        let mut header = vec![0x82, 127];
        header.extend_from_slice(&(1u64 << 62).to_be_bytes());
        assert_eq!(
            decode_frame_within(&header, false, 1 << 20),
            Err(ProtocolError::FrameTooLarge {
                allowed: 1 << 20,
                actual: 1 << 62
            }
            .into())
        );
        let encoded = encode_frame(BINARY, &[0; 100], None);
        assert!(decode_frame_within(&encoded, false, 99).is_err());
        assert!(decode_frame_within(&encoded, false, 100).unwrap().is_some());
    }
}
