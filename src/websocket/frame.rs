//! Frame codec for single-frame text messages.
//!
//! Client frames arrive masked and are unmasked by [`decode`]. Server
//! frames go out unmasked through [`encode`], limited to the single-byte
//! length form.

use crate::error::FrameError;

/// FIN bit set, text opcode.
pub const FIN_TEXT: u8 = 0x81;

/// Largest payload expressible in the 7-bit length field.
pub const MAX_SHORT_PAYLOAD: usize = 125;

const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// XOR `data` in place with the 4-byte mask. Applying it twice is a no-op.
pub fn apply_mask(data: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Offset of the mask key and the declared payload length for a frame.
fn header_layout(raw: &[u8]) -> Result<(usize, u64), FrameError> {
    if raw.len() < 2 {
        return Err(FrameError::Truncated {
            needed: 2,
            available: raw.len(),
        });
    }

    let marker = raw[1] & 0x7F;
    let mask_offset = match marker {
        LEN_16 => 4,
        LEN_64 => 10,
        _ => 2,
    };
    let needed = mask_offset + 4;
    if raw.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: raw.len(),
        });
    }

    let declared = match marker {
        LEN_16 => u16::from_be_bytes([raw[2], raw[3]]) as u64,
        LEN_64 => {
            let mut len = [0u8; 8];
            len.copy_from_slice(&raw[2..10]);
            u64::from_be_bytes(len)
        }
        short => short as u64,
    };

    Ok((mask_offset, declared))
}

/// Unmask the payload of the first client frame in `raw` and return it with
/// the number of bytes the frame occupied.
///
/// FIN, opcode and reserved bits are not inspected. Bytes past the declared
/// length belong to the next frame and are left alone; if `raw` ends before
/// the declared length, whatever follows the mask key is unmasked and the
/// whole buffer counts as consumed.
pub fn decode_one(raw: &[u8]) -> Result<(Vec<u8>, usize), FrameError> {
    let (mask_offset, declared) = header_layout(raw)?;

    let mut mask_key = [0u8; 4];
    mask_key.copy_from_slice(&raw[mask_offset..mask_offset + 4]);

    let start = mask_offset + 4;
    let available = (raw.len() - start) as u64;
    let end = start + declared.min(available) as usize;

    let mut payload = raw[start..end].to_vec();
    apply_mask(&mut payload, &mask_key);
    Ok((payload, end))
}

/// Unmask the payload of a client frame. See [`decode_one`].
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, FrameError> {
    decode_one(raw).map(|(payload, _)| payload)
}

/// Build an unmasked text frame: `[0x81, len, payload..]`.
pub fn encode(text: &str) -> Result<Vec<u8>, FrameError> {
    let payload = text.as_bytes();
    if payload.len() > MAX_SHORT_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(FIN_TEXT);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Build a masked client text frame. Used to drive the server from tests
/// and tooling; supports every length encoding.
pub fn encode_masked(payload: &[u8], mask_key: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(FIN_TEXT);

    let len = payload.len();
    if len <= MAX_SHORT_PAYLOAD {
        frame.push(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(0x80 | LEN_16);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | LEN_64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(&mask_key);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], &mask_key);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

    #[test]
    fn test_encode_hi() {
        assert_eq!(encode("hi").unwrap(), vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_encode_empty_and_boundary() {
        assert_eq!(encode("").unwrap(), vec![0x81, 0x00]);

        let max = "a".repeat(MAX_SHORT_PAYLOAD);
        let frame = encode(&max).unwrap();
        assert_eq!(frame[1], 125);
        assert_eq!(frame.len(), 127);
    }

    #[test]
    fn test_encode_rejects_long_payload() {
        let long = "a".repeat(126);
        assert_eq!(encode(&long), Err(FrameError::PayloadTooLarge(126)));
    }

    #[test]
    fn test_decode_rfc_hello() {
        // RFC 6455 section 5.7: masked "Hello"
        let raw = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        assert_eq!(decode(&raw).unwrap(), b"Hello");
    }

    #[test]
    fn test_decode_masked_roundtrip() {
        for len in [0usize, 1, 2, 3, 4, 5, 64, 125] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            let raw = encode_masked(&payload, MASK);
            assert_eq!(decode(&raw).unwrap(), payload, "length {}", len);
        }
    }

    #[test]
    fn test_decode_16bit_length() {
        let payload = vec![b'x'; 300];
        let raw = encode_masked(&payload, MASK);
        assert_eq!(raw[1] & 0x7F, 126);
        assert_eq!(&raw[4..8], &MASK);
        assert_eq!(decode(&raw).unwrap(), payload);
    }

    #[test]
    fn test_decode_64bit_length() {
        let payload = vec![b'y'; 70_000];
        let raw = encode_masked(&payload, MASK);
        assert_eq!(raw[1] & 0x7F, 127);
        assert_eq!(&raw[10..14], &MASK);
        assert_eq!(decode(&raw).unwrap(), payload);
    }

    #[test]
    fn test_decode_partial_payload() {
        let payload = vec![b'z'; 300];
        let raw = encode_masked(&payload, MASK);
        let partial = &raw[..100];
        assert_eq!(decode(partial).unwrap(), vec![b'z'; 92]);
    }

    #[test]
    fn test_decode_one_stops_at_frame_boundary() {
        let first = encode_masked(b"one", MASK);
        let mut raw = first.clone();
        raw.extend(encode_masked(b"two", [1, 2, 3, 4]));

        let (payload, used) = decode_one(&raw).unwrap();
        assert_eq!(payload, b"one");
        assert_eq!(used, first.len());

        let (payload, rest) = decode_one(&raw[used..]).unwrap();
        assert_eq!(payload, b"two");
        assert_eq!(used + rest, raw.len());
    }

    #[test]
    fn test_decode_one_partial_consumes_everything() {
        let raw = encode_masked(&[b'z'; 300], MASK);
        let (payload, used) = decode_one(&raw[..100]).unwrap();
        assert_eq!(payload.len(), 92);
        assert_eq!(used, 100);
    }

    #[test]
    fn test_decode_truncated_header() {
        assert_eq!(
            decode(&[]),
            Err(FrameError::Truncated { needed: 2, available: 0 })
        );
        assert_eq!(
            decode(&[0x81, 0x82, 0x01]),
            Err(FrameError::Truncated { needed: 6, available: 3 })
        );
        assert_eq!(
            decode(&[0x81, 0xFE, 0x01, 0x00, 0xAA]),
            Err(FrameError::Truncated { needed: 8, available: 5 })
        );
        assert_eq!(
            decode(&[0x81, 0xFF, 0, 0, 0, 0, 0, 0, 1, 0, 1, 2]),
            Err(FrameError::Truncated { needed: 14, available: 12 })
        );
    }

    #[test]
    fn test_apply_mask_is_self_inverse() {
        let mut data = b"websocket".to_vec();
        apply_mask(&mut data, &MASK);
        assert_ne!(data, b"websocket");
        apply_mask(&mut data, &MASK);
        assert_eq!(data, b"websocket");
    }
}
