//! Per-connection lifecycle
//!
//! A [`WebSocketClient`] ties one transport to its handshake parser, frame
//! reader, inbound state machine, and user handler. The [`Connection`]
//! half is what handlers see: outbound framing, the upgrade request, and
//! teardown. Lifecycle runs HANDSHAKE → OPEN → CLOSED; CLOSED is terminal.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::BytesMut;

use crate::error::{CloseReason, Error, Result};
use crate::frame::{encode_frame, FrameReader, OpCode};
use crate::handshake::{build_error_response, Handshake, HandshakeRequest};
use crate::protocol::{FrameHandler, Handler};
use crate::transport::TcpTransport;
use crate::{Config, MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER, RECV_BUFFER_SIZE};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Awaiting the HTTP upgrade
    Handshake,
    /// Upgrade complete; frame I/O in progress
    Open,
    /// Torn down; terminal
    Closed,
}

/// The connection as seen by user handlers: outbound framing, the upgrade
/// request, and teardown.
pub struct Connection {
    transport: TcpTransport,
    config: Config,
    state: State,
    rsv_mask: u8,
    request: Option<HandshakeRequest>,
}

impl Connection {
    pub(crate) fn new(transport: TcpTransport, config: Config) -> Self {
        let rsv_mask = config.rsv_mask;
        Self {
            transport,
            config,
            state: State::Handshake,
            rsv_mask,
            request: None,
        }
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Stable connection identity
    #[inline]
    pub fn id(&self) -> i32 {
        self.transport.id()
    }

    /// Peer address and port
    pub fn peer_name(&self) -> Option<SocketAddr> {
        self.transport.peer_name()
    }

    /// The validated upgrade request, available once open
    pub fn request(&self) -> Option<&HandshakeRequest> {
        self.request.as_ref()
    }

    /// RSV bits currently permitted on inbound frames
    pub fn rsv_mask(&self) -> u8 {
        self.rsv_mask
    }

    /// Widen the permitted RSV bits. Only meaningful from
    /// [`Handler::on_open`], before any frame has been read.
    pub fn set_rsv_mask(&mut self, rsv_mask: u8) {
        self.rsv_mask = rsv_mask;
    }

    pub(crate) fn promote_open(&mut self, request: Option<HandshakeRequest>) {
        self.state = State::Open;
        self.request = request;
    }

    pub(crate) fn transport_mut(&mut self) -> &mut TcpTransport {
        &mut self.transport
    }

    /// Write a complete message, fragmenting at the configured size.
    ///
    /// The first frame carries `opcode`, the rest CONTINUATION; the last
    /// has FIN set. An empty payload still emits one final frame.
    pub fn write(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let fragment = self.config.fragment_size.max(1);
        if payload.len() <= fragment {
            return self.write_frame(true, opcode, payload);
        }

        let mut opcode = opcode;
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + fragment).min(payload.len());
            self.write_frame(end == payload.len(), opcode, &payload[offset..end])?;
            opcode = OpCode::Continuation;
            offset = end;
        }
        Ok(())
    }

    /// Write a text message
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        self.write(OpCode::Text, text.as_bytes())
    }

    /// Write a binary message
    pub fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        self.write(OpCode::Binary, data)
    }

    /// Write a single ping frame
    pub fn write_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(true, OpCode::Ping, payload)
    }

    /// Write a single pong frame
    pub fn write_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(true, OpCode::Pong, payload)
    }

    /// Write a single close frame carrying `code` and `reason`.
    ///
    /// The reason is truncated to keep the control payload within 125
    /// bytes.
    pub fn write_close(&mut self, code: u16, reason: &str) -> Result<()> {
        let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason[..cut].as_bytes());
        self.write_frame(true, OpCode::Close, &payload)
    }

    /// Write one raw frame, unmasked (server role).
    ///
    /// A non-final or oversized control frame is a programmer error, not a
    /// wire-level close.
    pub fn write_frame(&mut self, fin: bool, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if opcode.is_control() {
            if !fin {
                return Err(Error::InvalidUsage("control frames must be final"));
            }
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::InvalidUsage("control payload exceeds 125 bytes"));
            }
        }

        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER + payload.len());
        encode_frame(&mut buf, opcode, payload, fin, None);
        self.transport.write_all(&buf)
    }

    /// Tear the connection down.
    ///
    /// A `code >= 1000` while the connection is open is echoed as a CLOSE
    /// frame first; any smaller code closes silently. The transport is
    /// released and the state set to CLOSED regardless of whether that
    /// write succeeds.
    pub fn close(&mut self, code: u16, reason: &str) {
        if self.state == State::Closed {
            return;
        }
        if code >= 1000 && self.state == State::Open {
            if let Err(err) = self.write_close(code, reason) {
                tracing::debug!(fd = self.id(), error = %err, "close frame write failed");
            }
        }
        self.transport.close();
        self.state = State::Closed;
    }
}

/// Registry type shared between the server (owner) and its clients, who
/// deregister themselves on close.
pub(crate) type ClientRegistry<H> = Rc<RefCell<BTreeMap<i32, Rc<RefCell<WebSocketClient<H>>>>>>;

/// One accepted connection: handshake negotiation, frame I/O, and the
/// user handler, driven by reactor callbacks.
pub struct WebSocketClient<H: Handler> {
    conn: Connection,
    handler: H,
    handshake: Handshake,
    reader: FrameReader,
    machine: FrameHandler,
    registry: Weak<RefCell<BTreeMap<i32, Rc<RefCell<WebSocketClient<H>>>>>>,
}

impl<H: Handler> WebSocketClient<H> {
    pub(crate) fn new(
        transport: TcpTransport,
        config: Config,
        handler: H,
        registry: Weak<RefCell<BTreeMap<i32, Rc<RefCell<WebSocketClient<H>>>>>>,
    ) -> Self {
        let handshake = Handshake::new(config.max_handshake_bytes);
        let reader = FrameReader::new(config.max_frame_payload, config.rsv_mask);
        let machine = FrameHandler::new(config.max_message_bytes);
        Self {
            conn: Connection::new(transport, config),
            handler,
            handshake,
            reader,
            machine,
            registry,
        }
    }

    /// The connection half, for writes and state queries
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access to the connection half
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// The user handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable access to the user handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Close and deregister from the owning server
    pub fn close(&mut self, code: u16, reason: &str) {
        self.conn.close(code, reason);
        self.deregister();
    }

    fn deregister(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().remove(&self.conn.id());
        }
    }

    /// The single catch-and-close site: echo what the error dictates,
    /// tear down, and give the error back for the reactor to observe.
    fn fail(&mut self, err: Error) -> Error {
        if let Some(status) = err.http_status() {
            tracing::warn!(fd = self.conn.id(), status, reason = err.reason(), "handshake failed");
            let response = build_error_response(status);
            let _ = self.conn.transport_mut().write_all(&response);
            self.close(0, "");
        } else if let Some(code) = err.close_code() {
            let reason = err.reason().to_string();
            self.close(code, &reason);
        } else if matches!(err, Error::Io(_)) {
            // Transport gone; a CLOSE frame would not arrive anyway.
            self.close(0, "");
        } else {
            self.close(CloseReason::INTERNAL, "internal error");
        }
        err
    }

    /// Accumulate handshake bytes; on completion write the 101 response,
    /// run `on_open`, and hand any leftover bytes to the frame layer.
    fn drive_handshake(&mut self) -> Result<()> {
        loop {
            let chunk = self
                .conn
                .transport_mut()
                .recv_nonblocking(RECV_BUFFER_SIZE)?;
            if chunk.is_empty() {
                return Ok(());
            }

            if let Some(upgrade) = self.handshake.push(&chunk)? {
                self.conn.transport_mut().write_all(&upgrade.response)?;
                tracing::debug!(
                    fd = self.conn.id(),
                    path = %upgrade.request.path,
                    "connection upgraded"
                );
                self.conn.promote_open(Some(upgrade.request));
                self.handler.on_open(&mut self.conn)?;
                self.reader.set_rsv_mask(self.conn.rsv_mask());

                if !upgrade.leftover.is_empty() {
                    self.reader.feed(&upgrade.leftover);
                    self.pump_frames()?;
                }
                return self.drive_frames();
            }
        }
    }

    /// Read everything available and dispatch the frames it completes
    fn drive_frames(&mut self) -> Result<()> {
        while self.conn.state() == State::Open {
            let chunk = self
                .conn
                .transport_mut()
                .recv_nonblocking(RECV_BUFFER_SIZE)?;
            if chunk.is_empty() {
                return Ok(());
            }
            self.reader.feed(&chunk);
            self.pump_frames()?;
        }
        Ok(())
    }

    fn pump_frames(&mut self) -> Result<()> {
        while self.conn.state() == State::Open {
            match self.reader.next_frame()? {
                Some(frame) => self.machine.on_frame(&mut self.handler, &mut self.conn, frame)?,
                None => return Ok(()),
            }
        }
        Ok(())
    }
}

impl<H: Handler> crate::reactor::Reactive for WebSocketClient<H> {
    fn id(&self) -> i32 {
        self.conn.id()
    }

    fn is_open(&self) -> bool {
        self.conn.state() != State::Closed
    }

    fn on_readable(&mut self) -> Result<()> {
        if self.conn.state() == State::Closed {
            return Ok(());
        }

        // EOF probe: readable with nothing to read means the peer is gone.
        match self.conn.transport_mut().peek_eof() {
            Ok(true) => {
                self.close(0, "");
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => return Err(self.fail(err)),
        }

        let result = match self.conn.state() {
            State::Handshake => self.drive_handshake(),
            State::Open => self.drive_frames(),
            State::Closed => Ok(()),
        };

        match result {
            Ok(()) => {
                if self.conn.state() == State::Closed {
                    self.deregister();
                }
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn out_of_band_pending(&mut self) -> bool {
        self.conn.state() != State::Closed && self.conn.transport_mut().out_of_band_pending()
    }

    fn on_out_of_band(&mut self) -> Result<()> {
        Err(self.fail(Error::ws(CloseReason::PROTOCOL_ERROR, "out-of-band data")))
    }

    fn on_error(&mut self, err: &Error) {
        // fail() normally ran before the error reached the reactor; this
        // covers handles that did not tear themselves down.
        if self.conn.state() != State::Closed {
            match err.close_code() {
                Some(code) => {
                    let reason = err.reason().to_string();
                    self.close(code, &reason);
                }
                None => self.close(0, ""),
            }
        }
    }
}
