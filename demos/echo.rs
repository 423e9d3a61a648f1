//! Echo server: repeats every text and binary message back to its sender.
//!
//! Run with `cargo run --example echo`, then point any WebSocket client at
//! `ws://127.0.0.1:9001/`.

use std::rc::Rc;

use shoal_ws::client::Connection;
use shoal_ws::error::Result;
use shoal_ws::protocol::Handler;
use shoal_ws::reactor::Reactor;
use shoal_ws::server::WebSocketServer;
use shoal_ws::Config;

struct Echo;

impl Handler for Echo {
    fn on_open(&mut self, conn: &mut Connection) -> Result<()> {
        if let Some(peer) = conn.peer_name() {
            tracing::info!(%peer, "peer connected");
        }
        Ok(())
    }

    fn on_text(&mut self, conn: &mut Connection, text: &str) -> Result<()> {
        conn.write_text(text)
    }

    fn on_binary(&mut self, conn: &mut Connection, data: &[u8]) -> Result<()> {
        conn.write_binary(data)
    }

    fn on_close(&mut self, conn: &mut Connection, code: u16, reason: &str) -> Result<()> {
        tracing::info!(code, reason, "peer disconnected");
        conn.close(code, reason);
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let reactor = Rc::new(Reactor::new()?);
    let server =
        WebSocketServer::bind("127.0.0.1:9001", Config::default(), reactor.clone(), || Echo)?;
    tracing::info!(addr = %server.borrow().local_addr(), "echo server ready");

    loop {
        reactor.react(None)?;
    }
}
