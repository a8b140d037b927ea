use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use dns_lookup::lookup_host;
use log::debug;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::PingError;

/// Datagram transport bound to a single destination.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Sends one datagram, returning the number of bytes written.
    fn send(&mut self, packet: &[u8]) -> io::Result<usize>;

    /// Waits at most `timeout` for a datagram and reads it into `buf`.
    /// `Ok(None)` means nothing arrived in time.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// Raw ICMPv4 socket. The kernel hands us whole IP datagrams, header included.
///
/// The socket is closed when this value is dropped.
pub struct RawSocket {
    socket: Socket,
    destination: SockAddr,
}

// A zero read timeout means "block forever" to the kernel
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

impl RawSocket {
    pub fn open(target: Ipv4Addr, ttl: Option<u32>) -> io::Result<Self> {
        let stype = Type::raw().cloexec();
        let socket = Socket::new(Domain::ipv4(), stype, Some(Protocol::icmpv4()))?;
        if let Some(ttl) = ttl {
            socket.set_ttl(ttl)?;
        }

        let destination = SockAddr::from(SocketAddr::from((target, 0)));
        Ok(RawSocket { socket, destination })
    }
}

impl Transport for RawSocket {
    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send_to(packet, &self.destination)
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        match self.socket.recv_from(buf) {
            Ok((n, _from)) => Ok(Some(n)),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(None),
                _ => Err(e),
            },
        }
    }
}

/// Turns a host name or address literal into the address we ping.
pub trait Resolve {
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, PingError>;
}

/// System resolver (`getaddrinfo`). Only IPv4 results are considered.
pub struct DnsResolver;

impl Resolve for DnsResolver {
    fn resolve(&self, host: &str) -> Result<Ipv4Addr, PingError> {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => return Ok(addr),
            Ok(IpAddr::V6(_)) => return Err(PingError::NoIpv4Address(host.to_string())),
            Err(_) => {}
        }

        let addrs = lookup_host(host).map_err(|source| PingError::Resolve {
            host: host.to_string(),
            source,
        })?;
        debug!("{} resolved to {:?}", host, addrs);

        first_ipv4(&addrs).ok_or_else(|| PingError::NoIpv4Address(host.to_string()))
    }
}

fn first_ipv4(addrs: &[IpAddr]) -> Option<Ipv4Addr> {
    addrs.iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn literal_addresses_skip_dns() {
        let addr = DnsResolver.resolve("192.0.2.1").unwrap();
        assert_eq!(addr, Ipv4Addr::new(192, 0, 2, 1));
    }

    #[test]
    fn ipv6_literal_is_not_pingable() {
        match DnsResolver.resolve("::1") {
            Err(PingError::NoIpv4Address(host)) => assert_eq!(host, "::1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn picks_first_ipv4_result() {
        let addrs = [
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        ];
        assert_eq!(first_ipv4(&addrs), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(first_ipv4(&addrs[..1]), None);
    }
}
