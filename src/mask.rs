//! WebSocket frame masking
//!
//! Client frames arrive XOR-masked with a 4-byte key (RFC 6455 §5.3).
//! The server never masks outbound frames, so this is decode-only in
//! practice; the operation is its own inverse either way.

/// Apply (or remove) a 4-byte XOR mask in place.
///
/// Processes whole 4-byte blocks against a widened key word, then the tail
/// byte by byte.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_roundtrip() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let original = b"Hello, WebSocket masking!".to_vec();
        let mut buf = original.clone();

        apply_mask(&mut buf, mask);
        assert_ne!(buf, original);

        apply_mask(&mut buf, mask);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_mask_matches_reference() {
        // Byte-by-byte reference implementation
        let mask = [0xa1, 0x02, 0xfe, 0x40];
        for len in 0..17 {
            let data: Vec<u8> = (0..len as u8).collect();
            let mut fast = data.clone();
            apply_mask(&mut fast, mask);

            let slow: Vec<u8> = data
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i & 3])
                .collect();
            assert_eq!(fast, slow, "length {}", len);
        }
    }
}
