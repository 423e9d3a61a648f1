//! WebSocket protocol state machine
//!
//! [`FrameHandler`] turns the validated frame stream of one connection
//! into messages: fragments are reassembled, control frames are routed,
//! text payloads are UTF-8 checked. User code plugs in through the
//! [`Handler`] trait, whose default methods implement the standard server
//! behavior (unsupported data closes 1003, pings are echoed as pongs,
//! a peer close is echoed and torn down).

use bytes::BytesMut;

use crate::client::Connection;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, OpCode};

/// User extension points for one connection.
///
/// Every method receives the [`Connection`], so implementations can write
/// frames, read the upgrade request, or close. All methods are optional;
/// the defaults implement the behavior described on each method.
pub trait Handler {
    /// The upgrade completed and frame I/O is about to begin.
    ///
    /// This is the one place where an extension may widen the RSV mask via
    /// [`Connection::set_rsv_mask`]. Default: nothing.
    fn on_open(&mut self, _conn: &mut Connection) -> Result<()> {
        Ok(())
    }

    /// A complete text message arrived. Default: close 1003, this endpoint
    /// does not handle text.
    fn on_text(&mut self, conn: &mut Connection, _text: &str) -> Result<()> {
        conn.close(CloseReason::UNHANDLED_DATA, "text frames not supported");
        Ok(())
    }

    /// A complete binary message arrived. Default: close 1003.
    fn on_binary(&mut self, conn: &mut Connection, _data: &[u8]) -> Result<()> {
        conn.close(CloseReason::UNHANDLED_DATA, "binary frames not supported");
        Ok(())
    }

    /// A ping arrived. Default: echo the payload back as a pong.
    fn on_ping(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<()> {
        conn.write_pong(payload)
    }

    /// A pong arrived. Default: nothing.
    fn on_pong(&mut self, _conn: &mut Connection, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// The peer sent a close frame. Default: close with the same code,
    /// which echoes a close reply while the connection is still open and
    /// then tears it down.
    fn on_close(&mut self, conn: &mut Connection, code: u16, reason: &str) -> Result<()> {
        conn.close(code, reason);
        Ok(())
    }
}

/// Per-connection inbound state machine.
///
/// Tracks the opcode of the fragmented message in progress and its
/// assembly buffer. Control frames are delivered whole and never touch
/// the buffer.
pub struct FrameHandler {
    /// Data opcode of the in-progress fragmented message
    continue_opcode: Option<OpCode>,
    /// Payload of the in-progress fragmented message
    assembly: BytesMut,
    /// Assembled message limit
    max_message_bytes: usize,
}

impl FrameHandler {
    /// Create a state machine with the given assembled-message limit
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            continue_opcode: None,
            assembly: BytesMut::new(),
            max_message_bytes,
        }
    }

    /// Dispatch one validated frame.
    ///
    /// Errors are protocol violations bound to close codes; the caller
    /// owns the close-and-reraise policy.
    pub fn on_frame<H: Handler>(
        &mut self,
        handler: &mut H,
        conn: &mut Connection,
        frame: Frame,
    ) -> Result<()> {
        match frame.opcode {
            OpCode::Close => self.handle_close(handler, conn, &frame),
            OpCode::Ping => handler.on_ping(conn, &frame.payload),
            OpCode::Pong => handler.on_pong(conn, &frame.payload),
            OpCode::Continuation => {
                let opcode = self.continue_opcode.ok_or(Error::ws(
                    CloseReason::PROTOCOL_ERROR,
                    "continuation without a fragmented message",
                ))?;
                self.accumulate(handler, conn, opcode, &frame)
            }
            OpCode::Text | OpCode::Binary => {
                if self.continue_opcode.is_some() {
                    return Err(Error::ws(
                        CloseReason::PROTOCOL_ERROR,
                        "data frame interleaved with a fragmented message",
                    ));
                }
                if frame.fin {
                    // Single-frame message: no assembly copy.
                    self.check_room(frame.payload.len())?;
                    return deliver(handler, conn, frame.opcode, &frame.payload);
                }
                self.accumulate(handler, conn, frame.opcode, &frame)
            }
        }
    }

    /// Append a fragment, delivering the message on FIN
    fn accumulate<H: Handler>(
        &mut self,
        handler: &mut H,
        conn: &mut Connection,
        opcode: OpCode,
        frame: &Frame,
    ) -> Result<()> {
        self.check_room(frame.payload.len())?;
        self.assembly.extend_from_slice(&frame.payload);

        if frame.fin {
            self.continue_opcode = None;
            let data = self.assembly.split().freeze();
            deliver(handler, conn, opcode, &data)
        } else {
            self.continue_opcode = Some(opcode);
            Ok(())
        }
    }

    /// Reject before buffering anything past the message limit
    fn check_room(&self, incoming: usize) -> Result<()> {
        if self.assembly.len() + incoming > self.max_message_bytes {
            return Err(Error::ws(CloseReason::TOO_LARGE, "message too large"));
        }
        Ok(())
    }

    fn handle_close<H: Handler>(
        &mut self,
        handler: &mut H,
        conn: &mut Connection,
        frame: &Frame,
    ) -> Result<()> {
        if frame.payload.len() == 1 {
            return Err(Error::ws(
                CloseReason::PROTOCOL_ERROR,
                "close payload of one byte",
            ));
        }
        let code = frame.close_code();
        if frame.payload.len() >= 2 && !CloseReason::is_valid_code(code) {
            return Err(Error::ws(CloseReason::PROTOCOL_ERROR, "invalid close code"));
        }
        let reason = std::str::from_utf8(frame.close_reason()).map_err(|_| {
            Error::ws(CloseReason::BAD_DATA, "close reason is not valid UTF-8")
        })?;
        handler.on_close(conn, code, reason)
    }
}

/// Hand a complete data message to the user callback
fn deliver<H: Handler>(
    handler: &mut H,
    conn: &mut Connection,
    opcode: OpCode,
    data: &[u8],
) -> Result<()> {
    if opcode == OpCode::Text {
        let text = std::str::from_utf8(data).map_err(|_| {
            Error::ws(CloseReason::BAD_DATA, "text message is not valid UTF-8")
        })?;
        handler.on_text(conn, text)
    } else {
        handler.on_binary(conn, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::State;
    use crate::transport::Listener;
    use crate::Config;
    use bytes::Bytes;
    use std::io::Read as _;
    use std::net::TcpStream;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        texts: Vec<String>,
        binaries: Vec<Vec<u8>>,
        pings: Vec<Vec<u8>>,
        pongs: Vec<Vec<u8>>,
        closes: Vec<(u16, String)>,
    }

    impl Handler for Recorder {
        fn on_text(&mut self, _conn: &mut Connection, text: &str) -> Result<()> {
            self.texts.push(text.to_string());
            Ok(())
        }

        fn on_binary(&mut self, _conn: &mut Connection, data: &[u8]) -> Result<()> {
            self.binaries.push(data.to_vec());
            Ok(())
        }

        fn on_ping(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<()> {
            self.pings.push(payload.to_vec());
            conn.write_pong(payload)
        }

        fn on_pong(&mut self, _conn: &mut Connection, payload: &[u8]) -> Result<()> {
            self.pongs.push(payload.to_vec());
            Ok(())
        }

        fn on_close(&mut self, conn: &mut Connection, code: u16, reason: &str) -> Result<()> {
            self.closes.push((code, reason.to_string()));
            conn.close(code, reason);
            Ok(())
        }
    }

    fn open_connection() -> (Connection, TcpStream) {
        let mut listener = Listener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr()).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let transport = loop {
            if let Some(t) = listener.accept().unwrap() {
                break t;
            }
        };
        let mut conn = Connection::new(transport, Config::default());
        conn.promote_open(None);
        (conn, peer)
    }

    fn data_frame(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        Frame::new(opcode, Bytes::copy_from_slice(payload), fin)
    }

    fn machine() -> (FrameHandler, Recorder) {
        (FrameHandler::new(Config::default().max_message_bytes), Recorder::default())
    }

    #[test]
    fn test_single_frame_text() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Text, true, b"hello"))
            .unwrap();
        assert_eq!(rec.texts, vec!["hello"]);
    }

    #[test]
    fn test_fragmented_message_assembled() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Binary, false, b"ab"))
            .unwrap();
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Continuation, false, b"cd"))
            .unwrap();
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Continuation, true, b"ef"))
            .unwrap();
        assert_eq!(rec.binaries, vec![b"abcdef".to_vec()]);

        // The machine is ready for the next message.
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Text, true, b"next"))
            .unwrap();
        assert_eq!(rec.texts, vec!["next"]);
    }

    #[test]
    fn test_continuation_without_start() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Continuation, true, b"x"))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_interleaved_data_rejected() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Text, false, b"ab"))
            .unwrap();
        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Binary, false, b"x"))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_control_passes_through_fragments() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Text, false, b"par"))
            .unwrap();
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Ping, true, b"beat"))
            .unwrap();
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Continuation, true, b"tial"))
            .unwrap();

        assert_eq!(rec.pings, vec![b"beat".to_vec()]);
        assert_eq!(rec.texts, vec!["partial"]);
    }

    #[test]
    fn test_invalid_utf8_single_frame() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Text, true, &[0xC3, 0x28]))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1007));
    }

    #[test]
    fn test_utf8_checked_only_at_final() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        // A multi-byte scalar split across fragments is fine.
        let euro = "€".as_bytes(); // E2 82 AC
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Text, false, &euro[..1]))
            .unwrap();
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Continuation, true, &euro[1..]))
            .unwrap();
        assert_eq!(rec.texts, vec!["€"]);
    }

    #[test]
    fn test_message_limit() {
        let mut fh = FrameHandler::new(8);
        let mut rec = Recorder::default();
        let (mut conn, _peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Binary, false, b"12345"))
            .unwrap();
        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Continuation, true, b"6789"))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1009));

        // Single oversize frame hits the same limit.
        let mut fh = FrameHandler::new(8);
        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Binary, true, b"123456789"))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1009));
    }

    #[test]
    fn test_ping_default_echoes_pong() {
        let (mut fh, mut rec) = machine();
        let (mut conn, mut peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Ping, true, b"hb"))
            .unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x8A, 0x02, b'h', b'b']);
    }

    #[test]
    fn test_close_empty_payload_is_1000() {
        let (mut fh, mut rec) = machine();
        let (mut conn, _peer) = open_connection();

        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Close, true, b""))
            .unwrap();
        assert_eq!(rec.closes, vec![(1000, String::new())]);
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_close_code_and_reason() {
        let (mut fh, mut rec) = machine();
        let (mut conn, mut peer) = open_connection();

        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        fh.on_frame(&mut rec, &mut conn, data_frame(OpCode::Close, true, &payload))
            .unwrap();
        assert_eq!(rec.closes, vec![(1001, "bye".to_string())]);

        // The default close handler echoed a close frame before teardown.
        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x88, 0x05, 0x03, 0xE9]);
        assert_eq!(&buf[4..], b"bye");
    }

    #[test]
    fn test_close_payload_violations() {
        let (mut conn, _peer) = open_connection();

        let (mut fh, mut rec) = machine();
        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Close, true, &[1]))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1002));

        let (mut fh, mut rec) = machine();
        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Close, true, &1005u16.to_be_bytes()))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1002));

        let (mut fh, mut rec) = machine();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xC3, 0x28]);
        let err = fh
            .on_frame(&mut rec, &mut conn, data_frame(OpCode::Close, true, &payload))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(1007));
    }

    #[test]
    fn test_default_handlers_close_1003() {
        struct Defaults;
        impl Handler for Defaults {}

        let mut fh = FrameHandler::new(1024);
        let mut handler = Defaults;
        let (mut conn, mut peer) = open_connection();

        fh.on_frame(&mut handler, &mut conn, data_frame(OpCode::Text, true, b"hi"))
            .unwrap();
        assert_eq!(conn.state(), State::Closed);

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 0x88);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 1003);
    }
}
