//! Non-blocking TCP transport facade
//!
//! Thin wrapper over `std::net` sockets in non-blocking mode: it is the
//! only module that touches the socket API directly. Reads never block;
//! [`TcpTransport::write_all`] is the one sanctioned blocking point and
//! waits for writability with a transient single-descriptor poll.
//!
//! Non-blocking sockets can pick up asynchronous errors between calls;
//! those are drained with `SO_ERROR` and reported on the next operation.
//! Urgent (out-of-band) data has no `std` API at all, so pending urgent
//! bytes are probed with a one-byte `recv(MSG_OOB | MSG_PEEK)`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use polling::{Event as PollEvent, Poller};

use crate::error::{Error, Result};

/// One connected peer socket
pub struct TcpTransport {
    stream: Option<TcpStream>,
    fd: i32,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Take ownership of an accepted stream and switch it to non-blocking
    /// mode.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true).map_err(Error::Io)?;
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream: Some(stream),
            fd,
            peer,
        })
    }

    /// Stable connection identity, derived from the descriptor
    #[inline]
    pub fn id(&self) -> i32 {
        self.fd
    }

    /// True until [`close`](Self::close) runs
    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Peer address and port, cached at accept time
    pub fn peer_name(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Configure SO_RCVTIMEO / SO_SNDTIMEO for the rare blocking paths
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream()?;
        stream.set_read_timeout(timeout).map_err(Error::Io)?;
        stream.set_write_timeout(timeout).map_err(Error::Io)?;
        Ok(())
    }

    fn stream(&self) -> Result<&TcpStream> {
        self.stream.as_ref().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ))
        })
    }

    /// Drain an error that slipped in asynchronously (SO_ERROR), reporting
    /// it on first observation.
    fn check_pending_error(&self) -> Result<()> {
        if let Some(stream) = &self.stream {
            if let Some(err) = stream.take_error().map_err(Error::Io)? {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    /// Read up to `max` bytes without blocking.
    ///
    /// Returns an empty buffer both when nothing is ready and after the
    /// peer finished writing; the caller distinguishes the two by probing
    /// with [`peek_eof`](Self::peek_eof) while the socket is readable.
    pub fn recv_nonblocking(&mut self, max: usize) -> Result<Vec<u8>> {
        self.check_pending_error()?;
        let mut buf = vec![0u8; max];
        let mut stream = self.stream()?;
        match stream.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Vec::new())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Probe for a peer shutdown with a 1-byte MSG_PEEK.
    ///
    /// `Ok(true)` means the read channel is at EOF; data still buffered or
    /// not yet arrived both yield `Ok(false)`.
    pub fn peek_eof(&mut self) -> Result<bool> {
        let mut probe = [0u8; 1];
        match self.stream()?.peek(&mut probe) {
            Ok(0) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write once without blocking; returns the number of bytes accepted
    /// (possibly 0 when the send buffer is full).
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.check_pending_error()?;
        let mut stream = self.stream()?;
        match stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write the whole buffer, waiting for writability as needed.
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.send(data)?;
            if n == 0 {
                self.wait_writable()?;
                continue;
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Block until the socket accepts more output.
    ///
    /// Uses a throwaway poller armed for writability on this descriptor
    /// alone; a spurious wake is harmless because the send loop retries.
    fn wait_writable(&self) -> Result<()> {
        let fd = self.stream()?.as_raw_fd();
        let poller = Poller::new().map_err(Error::Io)?;
        poller
            .add(fd, PollEvent::writable(fd as usize))
            .map_err(Error::Io)?;

        let mut events: Vec<PollEvent> = Vec::with_capacity(1);
        let waited = poller.wait(&mut events, None);
        let _ = poller.delete(fd);

        match waited {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Check for pending urgent data without touching the in-band stream.
    ///
    /// `std::net` exposes no urgent-data API, so this peeks one byte with
    /// `MSG_OOB`; no urgent byte pending simply fails the call.
    pub fn out_of_band_pending(&mut self) -> bool {
        let Ok(stream) = self.stream() else {
            return false;
        };
        let mut probe = [0u8; 1];
        let rc = unsafe {
            libc::recv(
                stream.as_raw_fd(),
                probe.as_mut_ptr() as *mut libc::c_void,
                1,
                libc::MSG_OOB | libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        rc == 1
    }

    /// Half-close one or both channels
    pub fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        self.stream()?.shutdown(how).map_err(Error::Io)
    }

    /// Release the descriptor. Idempotent; `id` and `peer_name` keep
    /// answering from their cached values.
    pub fn close(&mut self) {
        self.stream = None;
    }
}

/// Non-blocking accept socket
pub struct Listener {
    inner: Option<TcpListener>,
    fd: i32,
    local: SocketAddr,
}

impl Listener {
    /// Bind and switch to non-blocking mode
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let inner = TcpListener::bind(addr).map_err(Error::Io)?;
        inner.set_nonblocking(true).map_err(Error::Io)?;
        let fd = inner.as_raw_fd();
        let local = inner.local_addr().map_err(Error::Io)?;
        Ok(Self {
            inner: Some(inner),
            fd,
            local,
        })
    }

    /// Accept one pending connection, `None` when the backlog is empty
    pub fn accept(&mut self) -> Result<Option<TcpTransport>> {
        let listener = self.inner.as_ref().ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
        })?;
        match listener.accept() {
            Ok((stream, _)) => Ok(Some(TcpTransport::new(stream)?)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// The bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stable identity, derived from the descriptor
    #[inline]
    pub fn id(&self) -> i32 {
        self.fd
    }

    /// True until [`close`](Self::close) runs
    #[inline]
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Release the descriptor
    pub fn close(&mut self) {
        self.inner = None;
    }
}
