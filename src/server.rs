//! WebSocket server: accept loop, client registry, broadcast
//!
//! The server is itself a reactive handle: its readable callback drains
//! the accept backlog, wrapping each new socket in a [`WebSocketClient`]
//! that is registered with both the client registry (owning) and the
//! reactor (observing). Clients deregister themselves on close.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;

use crate::client::{ClientRegistry, State, WebSocketClient};
use crate::error::Result;
use crate::frame::OpCode;
use crate::protocol::Handler;
use crate::reactor::{Reactive, Reactor};
use crate::transport::Listener;
use crate::Config;

/// Accept loop plus registry over one listening socket.
///
/// Constructed with a handler factory: every accepted connection gets a
/// fresh `H` from it.
pub struct WebSocketServer<H: Handler> {
    listener: Listener,
    config: Config,
    reactor: Rc<Reactor>,
    clients: ClientRegistry<H>,
    factory: Box<dyn FnMut() -> H>,
}

impl<H: Handler + 'static> WebSocketServer<H> {
    /// Bind, register with the reactor, and return the shared server
    /// handle.
    pub fn bind(
        addr: impl ToSocketAddrs,
        config: Config,
        reactor: Rc<Reactor>,
        factory: impl FnMut() -> H + 'static,
    ) -> Result<Rc<RefCell<Self>>> {
        let listener = Listener::bind(addr)?;
        tracing::debug!(addr = %listener.local_addr(), "server listening");

        let server = Rc::new(RefCell::new(Self {
            listener,
            config,
            reactor: reactor.clone(),
            clients: Rc::new(RefCell::new(BTreeMap::new())),
            factory: Box::new(factory),
        }));
        reactor.add(server.clone());
        Ok(server)
    }

    /// The bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Server configuration applied to every accepted connection
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }

    /// Accept one pending connection, wrap it, and register it with the
    /// registry and the reactor. `None` when the backlog is empty.
    pub fn accept(&mut self) -> Result<Option<Rc<RefCell<WebSocketClient<H>>>>> {
        let Some(transport) = self.listener.accept()? else {
            return Ok(None);
        };

        let id = transport.id();
        let peer = transport.peer_name();
        let handler = (self.factory)();
        let client = Rc::new(RefCell::new(WebSocketClient::new(
            transport,
            self.config.clone(),
            handler,
            Rc::downgrade(&self.clients),
        )));

        self.clients.borrow_mut().insert(id, client.clone());
        self.reactor.add(client.clone());
        tracing::debug!(fd = id, peer = ?peer, "accepted connection");
        Ok(Some(client))
    }

    /// Write one message to every client in the open state.
    ///
    /// Per-client failures are swallowed so one bad peer cannot abort the
    /// fan-out; a client currently being dispatched is skipped the same
    /// way.
    pub fn broadcast(&self, opcode: OpCode, payload: &[u8]) {
        let snapshot: Vec<_> = self.clients.borrow().values().cloned().collect();
        for client in snapshot {
            let Ok(mut client) = client.try_borrow_mut() else {
                continue;
            };
            if client.connection().state() != State::Open {
                continue;
            }
            if let Err(err) = client.connection_mut().write(opcode, payload) {
                tracing::debug!(
                    fd = client.connection().id(),
                    error = %err,
                    "broadcast write failed"
                );
            }
        }
    }

    /// Close every client with `code`/`reason`, deregister from the
    /// reactor, and release the listening socket.
    pub fn close(&mut self, code: u16, reason: &str) {
        let snapshot: Vec<_> = self.clients.borrow().values().cloned().collect();
        for client in snapshot {
            if let Ok(mut client) = client.try_borrow_mut() {
                client.close(code, reason);
            }
        }
        self.clients.borrow_mut().clear();
        self.reactor.remove(self.listener.id());
        self.listener.close();
    }
}

impl<H: Handler + 'static> Reactive for WebSocketServer<H> {
    fn id(&self) -> i32 {
        self.listener.id()
    }

    fn is_open(&self) -> bool {
        self.listener.is_open()
    }

    fn on_readable(&mut self) -> Result<()> {
        while self.accept()?.is_some() {}
        Ok(())
    }
}
