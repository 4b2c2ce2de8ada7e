use std::io::{Error, ErrorKind, Result};
use std::net::{SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::options::TcpKeepaliveOptions;

/// Resolves `host:port` and returns every address as IPv6, with IPv4 results
/// encoded in v4-mapped form (`::ffff:a.b.c.d`). One dual-stack socket then
/// serves both families.
fn resolve_v6(host: &str, port: u16) -> Result<Vec<SocketAddrV6>> {
    let addrs = (host, port).to_socket_addrs()?;
    let mapped = addrs
        .map(|addr| match addr {
            SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), port, 0, 0),
            SocketAddr::V6(v6) => v6,
        })
        .collect::<Vec<_>>();

    if mapped.is_empty() {
        return Err(Error::new(
            ErrorKind::NotFound,
            "host resolved to no addresses",
        ));
    }
    Ok(mapped)
}

/// Creates the listening socket for one listener: IPv6 with `IPV6_V6ONLY`
/// off, close-on-exec, `SO_REUSEADDR` and `SO_REUSEPORT` set, optional TCP
/// keepalive tunables, bound, non-blocking, and listening with `backlog`.
///
/// Binding walks the resolved address list and fails fast on the first bind
/// failure.
pub fn bind_listener(
    host: &str,
    port: u16,
    backlog: i32,
    keepalive: Option<&TcpKeepaliveOptions>,
) -> Result<mio::net::TcpListener> {
    let addrs = resolve_v6(host, port)?;

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_cloexec(true)?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;

    if let Some(ka) = keepalive {
        socket.set_keepalive(true)?;
        let params = TcpKeepalive::new()
            .with_time(ka.idle.max(Duration::from_secs(1)))
            .with_interval(ka.interval.max(Duration::from_secs(1)))
            .with_retries(ka.retries);
        socket.set_tcp_keepalive(&params)?;
    }

    // a single socket binds once, so walking the list stops at the first
    // address; a bind failure is propagated rather than retried
    socket.bind(&SocketAddr::V6(addrs[0]).into())?;

    socket.set_nonblocking(true)?;
    socket.listen(backlog)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(listener))
}
