//! # Shoal-WS: single-threaded, readiness-driven WebSocket server
//!
//! An RFC 6455 (version 13) server that multiplexes many peers on one
//! thread: a readiness-polling [`Reactor`](reactor::Reactor) dispatches
//! to registered handles, each connection negotiates its HTTP upgrade
//! incrementally, and a per-connection state machine validates frames,
//! reassembles fragmented messages, and answers control frames.
//!
//! ## Architecture
//!
//! - **Transport facade** ([`transport`]): non-blocking reads, a blocking
//!   `write_all`, EOF probing, and surfacing of slipped socket errors
//! - **Reactor** ([`reactor`]): one readiness poll per tick, urgent data
//!   probed per ready handle, safe against membership changes mid-dispatch
//! - **Frame codec** ([`frame`], [`mask`]): incremental masked parsing,
//!   unmasked encoding
//! - **Handshake** ([`handshake`]): bounded HTTP accumulation and the
//!   exact `101 Switching Protocols` reply
//! - **Protocol** ([`protocol`]): fragment assembly, control routing,
//!   UTF-8 checks, and the user [`Handler`](protocol::Handler) trait
//! - **Client / Server** ([`client`], [`server`]): lifecycle and the
//!   accept loop
//!
//! ## Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use shoal_ws::client::Connection;
//! use shoal_ws::error::Result;
//! use shoal_ws::protocol::Handler;
//! use shoal_ws::reactor::Reactor;
//! use shoal_ws::server::WebSocketServer;
//! use shoal_ws::Config;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_text(&mut self, conn: &mut Connection, text: &str) -> Result<()> {
//!         conn.write_text(text)
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let reactor = Rc::new(Reactor::new()?);
//!     let _server =
//!         WebSocketServer::bind("127.0.0.1:9001", Config::default(), reactor.clone(), || Echo)?;
//!     loop {
//!         reactor.react(None)?;
//!     }
//! }
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod transport;

pub use client::{Connection, State, WebSocketClient};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, FrameReader, OpCode};
pub use protocol::Handler;
pub use reactor::{Reactive, Reactor};
pub use server::WebSocketServer;

/// WebSocket GUID for the handshake accept key
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER: usize = 14;

/// Largest control-frame payload permitted by RFC 6455
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Chunk size for non-blocking reads
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest admissible per-frame payload limit
const MIN_FRAME_PAYLOAD: usize = 125;

/// Configuration for accepted connections
///
/// # Example
///
/// ```
/// use shoal_ws::Config;
///
/// let config = Config::builder()
///     .max_frame_payload(64 * 1024)
///     .max_message_bytes(1024 * 1024)
///     .fragment_size(16 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Handshake request limit; beyond it the peer gets a 413 and is
    /// dropped (default: 4096)
    pub max_handshake_bytes: usize,
    /// Per-frame inbound payload limit (default: 128 KiB, floor 125)
    pub max_frame_payload: usize,
    /// Assembled-message inbound limit (default: 10 MiB)
    pub max_message_bytes: usize,
    /// Outbound fragmentation granularity (default: 128 KiB)
    pub fragment_size: usize,
    /// RSV bits permitted by negotiated extensions (default: 0)
    pub rsv_mask: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_handshake_bytes: 4096,
            max_frame_payload: 128 * 1024,
            max_message_bytes: 10 * 1024 * 1024,
            fragment_size: 128 * 1024,
            rsv_mask: 0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the handshake request limit
    pub fn max_handshake_bytes(mut self, bytes: usize) -> Self {
        self.config.max_handshake_bytes = bytes;
        self
    }

    /// Set the per-frame payload limit, clamped to the 125-byte floor
    pub fn max_frame_payload(mut self, bytes: usize) -> Self {
        self.config.max_frame_payload = bytes.max(MIN_FRAME_PAYLOAD);
        self
    }

    /// Set the assembled-message limit
    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.config.max_message_bytes = bytes;
        self
    }

    /// Set the outbound fragmentation granularity
    pub fn fragment_size(mut self, bytes: usize) -> Self {
        self.config.fragment_size = bytes;
        self
    }

    /// Set the RSV bits negotiated extensions may use
    pub fn rsv_mask(mut self, mask: u8) -> Self {
        self.config.rsv_mask = mask;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{Connection, State};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::protocol::Handler;
    pub use crate::reactor::Reactor;
    pub use crate::server::WebSocketServer;
    pub use crate::Config;
}
