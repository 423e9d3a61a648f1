//! WebSocket frame parsing and serialization
//!
//! Implements the RFC 6455 §5.2 wire format, server side: inbound frames
//! must be masked, outbound frames never are. [`FrameReader`] is an
//! incremental parser that survives arbitrary byte-granular splits across
//! reads; [`encode_frame`] is the shared encoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::MAX_CONTROL_PAYLOAD;

/// Largest payload expressible in the 7-bit length field
const LEN7_MAX: u64 = 125;
/// Largest payload expressible in the 16-bit extended length
const LEN16_MAX: u64 = 65535;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of byte 0.
    ///
    /// Reserved values (0x3..=0x7, 0xB..=0xF) return `None`.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete, validated WebSocket frame.
///
/// Payloads are stored unmasked. `rsv` holds RSV1..RSV3 as bits 2..0
/// (i.e. `(byte0 >> 4) & 0x07`); it is zero unless an extension widened
/// the negotiated RSV mask.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1..RSV3 bits
    pub rsv: u8,
    /// Frame opcode
    pub opcode: OpCode,
    /// Frame payload (unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            payload,
        }
    }

    /// Create a final text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a final binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame with a code and reason
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// The close code carried by a CLOSE payload.
    ///
    /// An empty payload means 1000 (normal closure).
    pub fn close_code(&self) -> u16 {
        if self.payload.len() >= 2 {
            u16::from_be_bytes([self.payload[0], self.payload[1]])
        } else {
            CloseReason::NORMAL
        }
    }

    /// The reason bytes following the close code, possibly empty
    pub fn close_reason(&self) -> &[u8] {
        if self.payload.len() > 2 {
            &self.payload[2..]
        } else {
            &[]
        }
    }
}

/// Header fields held while waiting for the payload bytes
#[derive(Debug)]
struct PendingFrame {
    fin: bool,
    rsv: u8,
    opcode: OpCode,
    payload_len: usize,
    mask: [u8; 4],
}

/// Incremental frame parser for masked client frames.
///
/// Bytes go in through [`feed`](Self::feed); complete frames come out of
/// [`next_frame`](Self::next_frame), zero or more per call. Header parsing
/// is deferred until the whole header is buffered; once accepted, the
/// header bytes are consumed and the reader waits for the full payload.
/// Partial frames persist across calls.
pub struct FrameReader {
    /// Raw bytes awaiting parsing
    buf: BytesMut,
    /// Accepted header of the frame in flight
    pending: Option<PendingFrame>,
    /// Per-frame inbound payload limit
    max_frame_payload: usize,
    /// RSV bits permitted by negotiated extensions
    rsv_mask: u8,
}

impl FrameReader {
    /// Create a reader with the given payload limit and RSV mask
    pub fn new(max_frame_payload: usize, rsv_mask: u8) -> Self {
        Self {
            buf: BytesMut::new(),
            pending: None,
            max_frame_payload,
            rsv_mask,
        }
    }

    /// Widen the set of RSV bits an extension may set
    pub fn set_rsv_mask(&mut self, rsv_mask: u8) {
        self.rsv_mask = rsv_mask;
    }

    /// Append raw bytes from the transport
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet emitted as frames
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True while a header has been accepted but its payload is incomplete
    pub fn mid_frame(&self) -> bool {
        self.pending.is_some()
    }

    /// Parse the next complete frame out of the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was parsed
    /// - `Ok(None)` if more bytes are needed
    /// - `Err(e)` on a protocol violation, bound to a close code
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.pending.is_none() {
            self.pending = self.parse_header()?;
        }

        match self.pending.take() {
            Some(pending) if self.buf.len() >= pending.payload_len => {
                let mut payload = self.buf.split_to(pending.payload_len);
                apply_mask(&mut payload, pending.mask);
                Ok(Some(Frame {
                    fin: pending.fin,
                    rsv: pending.rsv,
                    opcode: pending.opcode,
                    payload: payload.freeze(),
                }))
            }
            keep => {
                self.pending = keep;
                Ok(None)
            }
        }
    }

    /// Validate and consume one frame header, if fully buffered.
    ///
    /// Violations provable from the bytes in hand are raised immediately;
    /// anything else waits for more data.
    fn parse_header(&mut self) -> Result<Option<PendingFrame>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv = (b0 >> 4) & 0x07;

        if rsv & !self.rsv_mask != 0 {
            return Err(Error::ws(
                CloseReason::PROTOCOL_ERROR,
                "RSV bit set without a negotiated extension",
            ));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F)
            .ok_or(Error::ws(CloseReason::PROTOCOL_ERROR, "reserved opcode"))?;

        if opcode.is_control() && !fin {
            return Err(Error::ws(
                CloseReason::PROTOCOL_ERROR,
                "fragmented control frame",
            ));
        }

        if b1 & 0x80 == 0 {
            return Err(Error::ws(
                CloseReason::PROTOCOL_ERROR,
                "client frame without mask",
            ));
        }

        let len7 = b1 & 0x7F;

        // Catches the 126/127 length markers as well as any literal > 125.
        if opcode.is_control() && u64::from(len7) > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::ws(
                CloseReason::PROTOCOL_ERROR,
                "control frame too large",
            ));
        }

        let (ext_len, payload_len) = match len7 {
            0..=125 => (0, u64::from(len7)),
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let len = u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
                if len <= LEN7_MAX {
                    return Err(Error::ws(
                        CloseReason::PROTOCOL_ERROR,
                        "payload length not minimally encoded",
                    ));
                }
                (2, len)
            }
            _ => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    self.buf[2],
                    self.buf[3],
                    self.buf[4],
                    self.buf[5],
                    self.buf[6],
                    self.buf[7],
                    self.buf[8],
                    self.buf[9],
                ]);
                if len >> 63 != 0 {
                    return Err(Error::ws(
                        CloseReason::PROTOCOL_ERROR,
                        "payload length high bit set",
                    ));
                }
                if len <= LEN16_MAX {
                    return Err(Error::ws(
                        CloseReason::PROTOCOL_ERROR,
                        "payload length not minimally encoded",
                    ));
                }
                (8, len)
            }
        };

        if payload_len > self.max_frame_payload as u64 {
            return Err(Error::ws(CloseReason::TOO_LARGE, "frame payload too large"));
        }

        let header_len = 2 + ext_len + 4;
        if self.buf.len() < header_len {
            return Ok(None);
        }

        let mask = [
            self.buf[header_len - 4],
            self.buf[header_len - 3],
            self.buf[header_len - 2],
            self.buf[header_len - 1],
        ];
        self.buf.advance(header_len);

        Ok(Some(PendingFrame {
            fin,
            rsv,
            opcode,
            payload_len: payload_len as usize,
            mask,
        }))
    }
}

/// Encode one frame into `buf`.
///
/// Length encoding follows RFC 6455 §5.2: 7-bit up to 125, 16-bit up to
/// 65535, 64-bit beyond. A mask key is only supplied by tests exercising
/// the client side of the wire; the server always passes `None`.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len() as u64;

    let header_len = 2
        + if payload_len > LEN16_MAX {
            8
        } else if payload_len > LEN7_MAX {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_len + payload.len());

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= LEN7_MAX {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= LEN16_MAX {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len);
    }

    if let Some(key) = mask {
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key);
    } else {
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> FrameReader {
        FrameReader::new(128 * 1024, 0)
    }

    fn masked(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut buf = BytesMut::new();
        let op = OpCode::from_u8(opcode).unwrap();
        encode_frame(&mut buf, op, payload, fin, Some(mask));
        buf.to_vec()
    }

    #[test]
    fn test_opcode_classes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
        assert_eq!(OpCode::from_u8(0xB), None);
        assert_eq!(OpCode::from_u8(0xF), None);
    }

    #[test]
    fn test_parse_masked_text() {
        let mut r = reader();
        r.feed(&masked(0x1, true, b"Hello"));

        let frame = r.next_frame().unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_parse_sixteen_bit_length() {
        let payload = vec![0x42u8; 200];
        let mut r = reader();
        r.feed(&masked(0x2, true, &payload));

        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), 200);
    }

    #[test]
    fn test_reject_unmasked() {
        let mut r = reader();
        r.feed(&[0x81, 0x02, b'h', b'i']);
        let err = r.next_frame().unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_reject_rsv_without_negotiation() {
        let mut r = reader();
        r.feed(&[0xC1, 0x80, 0, 0, 0, 0]); // RSV1 set
        let err = r.next_frame().unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_rsv_allowed_when_negotiated() {
        let mut r = FrameReader::new(1024, 0x04); // RSV1 negotiated
        let mut bytes = masked(0x1, true, b"x");
        bytes[0] |= 0x40;
        r.feed(&bytes);
        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(frame.rsv, 0x04);
    }

    #[test]
    fn test_reject_reserved_opcode() {
        for op in [0x83u8, 0x8B, 0x8F] {
            let mut r = reader();
            r.feed(&[op, 0x80, 0, 0, 0, 0]);
            let err = r.next_frame().unwrap_err();
            assert_eq!(err.close_code(), Some(1002), "opcode byte {:#x}", op);
        }
    }

    #[test]
    fn test_reject_fragmented_control() {
        let mut r = reader();
        r.feed(&[0x09, 0x80, 0, 0, 0, 0]); // Ping with FIN=0
        let err = r.next_frame().unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_control_payload_boundary() {
        // 125 bytes is fine
        let mut r = reader();
        r.feed(&masked(0x9, true, &[0u8; 125]));
        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), 125);

        // 126 requires the 16-bit marker, which is rejected for control frames
        let mut r = reader();
        r.feed(&masked(0x9, true, &[0u8; 126]));
        let err = r.next_frame().unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_reject_length_high_bit() {
        let mut r = reader();
        let mut bytes = vec![0x82, 0xFF];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        r.feed(&bytes);
        let err = r.next_frame().unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_reject_non_minimal_length() {
        // 16-bit encoding of 5
        let mut r = reader();
        r.feed(&[0x82, 0xFE, 0x00, 0x05]);
        assert_eq!(r.next_frame().unwrap_err().close_code(), Some(1002));

        // 64-bit encoding of 5
        let mut r = reader();
        let mut bytes = vec![0x82, 0xFF];
        bytes.extend_from_slice(&5u64.to_be_bytes());
        r.feed(&bytes);
        assert_eq!(r.next_frame().unwrap_err().close_code(), Some(1002));
    }

    #[test]
    fn test_oversize_rejected_before_payload() {
        // Header declares 200000 bytes; no payload is fed at all.
        let mut r = reader();
        let mut bytes = vec![0x82, 0xFF];
        bytes.extend_from_slice(&200_000u64.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        r.feed(&bytes);
        let err = r.next_frame().unwrap_err();
        assert_eq!(err.close_code(), Some(1009));
    }

    #[test]
    fn test_payload_limit_boundary() {
        let limit = 128 * 1024;
        let mut r = FrameReader::new(limit, 0);
        r.feed(&masked(0x2, true, &vec![7u8; limit]));
        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), limit);

        let mut r = FrameReader::new(limit, 0);
        r.feed(&masked(0x2, true, &vec![7u8; limit + 1]));
        assert_eq!(r.next_frame().unwrap_err().close_code(), Some(1009));
    }

    #[test]
    fn test_byte_granular_restart() {
        let payload = b"fragmented delivery".repeat(20);
        let bytes = masked(0x1, true, &payload);

        let mut r = reader();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(1) {
            r.feed(chunk);
            while let Some(frame) = r.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), &payload[..]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_one_feed() {
        let mut bytes = masked(0x1, true, b"one");
        bytes.extend_from_slice(&masked(0x1, true, b"two"));
        bytes.extend_from_slice(&masked(0x9, true, b"ping"));

        let mut r = reader();
        r.feed(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = r.next_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].opcode, OpCode::Ping);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_encode_length_forms() {
        // 125 → 7-bit form
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &vec![0u8; 125], true, None);
        assert_eq!(buf[1], 125);

        // 126 → 16-bit form
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &vec![0u8; 126], true, None);
        assert_eq!(buf[1], 126);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 126);

        // 65536 → 64-bit form
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &vec![0u8; 65536], true, None);
        assert_eq!(buf[1], 127);
        let len = u64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        assert_eq!(len, 65536);
    }

    #[test]
    fn test_server_frames_never_masked() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hi", true, None);
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1] & 0x80, 0);
        assert_eq!(&buf[2..], b"hi");
    }

    #[test]
    fn test_close_accessors() {
        let frame = Frame::close(1002, "protocol error");
        assert_eq!(frame.close_code(), 1002);
        assert_eq!(frame.close_reason(), b"protocol error");

        let empty = Frame::new(OpCode::Close, Bytes::new(), true);
        assert_eq!(empty.close_code(), 1000);
        assert!(empty.close_reason().is_empty());
    }
}
