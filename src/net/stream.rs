use std::io::{Read, Result, Write};
use std::net::{Shutdown, SocketAddr};

use mio::event::Source;

/// The socket surface a connection needs from its transport. Implemented for
/// `mio::net::TcpStream` in production and for scripted in-memory streams in
/// tests, which is how the state machine is exercised without a kernel.
pub trait Stream: Read + Write + Source {
    /// Address of the connected peer.
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Shut down one or both halves of the connection.
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Toggle Nagle's algorithm.
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;
}

impl Stream for mio::net::TcpStream {
    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }
}
