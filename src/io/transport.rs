use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::event::Source;
use mio::net::TcpStream;

/// The byte stream under a connection.
///
/// Plain TCP is the only built-in transport. A TLS layer plugs in here as
/// an opaque transform with the same non-blocking read/write contract plus
/// a handshake that must complete before the connection is open.
pub trait Transport: Read + Write + Send {
    /// The selectable source registered with the reactor.
    fn source(&mut self) -> &mut dyn Source;

    /// Completes a non-blocking connect once the socket reported
    /// writability. `Ok(false)` means the connect is still in progress.
    fn finish_connect(&mut self) -> io::Result<bool>;

    /// Advances the handshake of a layered protocol. `Ok(true)` once
    /// application bytes can flow.
    fn handshake(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&mut self) -> io::Result<()>;
}

/// Plain TCP.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Starts a non-blocking connect.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        TcpStream::connect(addr).map(Self::new)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
