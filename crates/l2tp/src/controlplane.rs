//! The control-plane socket.
//!
//! A bound and connected datagram endpoint carrying control messages for
//! one tunnel.  UDP encapsulation works for both protocol versions; IP
//! encapsulation (protocol 115, L2TPv3 only) uses the kernel's `l2tp_ip`
//! socket family, whose addresses carry the control connection ID instead
//! of a port.

use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use l2tp_core::error::{Error, Result};
use l2tp_core::types::{ControlConnId, EncapType};

/// IP protocol number for L2TPv3, RFC 3931 section 4.1.1.
const IPPROTO_L2TP: libc::c_int = 115;

/// `struct sockaddr_l2tpip` from linux/l2tp.h.  The leading fields match
/// `sockaddr_in`; the port slot is unused and the connection ID follows
/// the address.
#[repr(C)]
struct SockaddrL2tpIp {
    l2tp_family: libc::sa_family_t,
    l2tp_unused: u16,
    l2tp_addr: libc::in_addr,
    l2tp_conn_id: u32,
    __pad: [u8; 4],
}

/// `struct sockaddr_l2tpip6` from linux/l2tp.h.
#[repr(C)]
struct SockaddrL2tpIp6 {
    l2tp_family: libc::sa_family_t,
    l2tp_unused: u16,
    l2tp_flowinfo: u32,
    l2tp_addr: libc::in6_addr,
    l2tp_scope_id: u32,
    l2tp_conn_id: u32,
}

/// Resolves an address string, e.g. `"127.0.0.1:1701"` or `"[::1]:1701"`.
pub fn resolve_addr(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("resolve {address:?}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("resolve {address:?}: no addresses")))
}

/// Resolves a local/peer address pair.
///
/// The peer address is required.  An empty local address yields the
/// wildcard address of the peer's family, leaving the port to the kernel.
pub fn address_pair(local: &str, peer: &str) -> Result<(SocketAddr, SocketAddr)> {
    let peer_addr = resolve_addr(peer)?;
    let local_addr = if local.is_empty() {
        match peer_addr.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    } else {
        resolve_addr(local)?
    };
    Ok((local_addr, peer_addr))
}

fn l2tpip_sockaddr(addr: SocketAddr, conn_id: ControlConnId) -> std::io::Result<SockAddr> {
    unsafe {
        SockAddr::try_init(|storage, len| {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    let sa = storage as *mut SockaddrL2tpIp;
                    (*sa).l2tp_family = libc::AF_INET as libc::sa_family_t;
                    (*sa).l2tp_unused = 0;
                    (*sa).l2tp_addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(ip.octets()),
                    };
                    (*sa).l2tp_conn_id = conn_id.0;
                    (*sa).__pad = [0; 4];
                    *len = mem::size_of::<SockaddrL2tpIp>() as libc::socklen_t;
                }
                IpAddr::V6(ip) => {
                    let sa = storage as *mut SockaddrL2tpIp6;
                    (*sa).l2tp_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sa).l2tp_unused = 0;
                    (*sa).l2tp_flowinfo = 0;
                    (*sa).l2tp_addr = libc::in6_addr {
                        s6_addr: ip.octets(),
                    };
                    (*sa).l2tp_scope_id = 0;
                    (*sa).l2tp_conn_id = conn_id.0;
                    *len = mem::size_of::<SockaddrL2tpIp6>() as libc::socklen_t;
                }
            }
            Ok(())
        })
    }
    .map(|(_, sockaddr)| sockaddr)
}

/// A bound, connected control-plane endpoint for one tunnel.
pub struct ControlPlane {
    socket: Socket,
    encap: EncapType,
    local: SocketAddr,
    peer: SocketAddr,
}

impl ControlPlane {
    /// Opens a UDP control-plane socket bound to `local` and connected to
    /// `peer`.
    pub fn new_udp(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let domain = Domain::for_address(peer);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&SockAddr::from(local))?;
        socket.connect(&SockAddr::from(peer))?;
        let local = socket
            .local_addr()?
            .as_socket()
            .unwrap_or(local);
        Ok(ControlPlane {
            socket,
            encap: EncapType::Udp,
            local,
            peer,
        })
    }

    /// Opens an L2TP/IP control-plane socket.  The connection IDs become
    /// part of the socket addresses; the kernel demultiplexes incoming
    /// packets on the local ID.
    pub fn new_ip(
        local: SocketAddr,
        conn_id: ControlConnId,
        peer: SocketAddr,
        peer_conn_id: ControlConnId,
    ) -> Result<Self> {
        let domain = Domain::for_address(peer);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::from(IPPROTO_L2TP)))?;
        socket.bind(&l2tpip_sockaddr(local, conn_id)?)?;
        socket.connect(&l2tpip_sockaddr(peer, peer_conn_id)?)?;
        Ok(ControlPlane {
            socket,
            encap: EncapType::Ip,
            local,
            peer,
        })
    }

    /// The encapsulation this socket carries.
    pub fn encap(&self) -> EncapType {
        self.encap
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The connected peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The raw socket fd, handed to the kernel data plane for managed
    /// tunnels.
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Sends one control datagram.
    ///
    /// On an L2TP/IP socket control packets begin with a zero session ID
    /// so the kernel can tell them apart from data; the prefix is added
    /// here.
    pub fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self.encap {
            EncapType::Udp => self.socket.send(buf),
            EncapType::Ip => {
                let mut framed = Vec::with_capacity(4 + buf.len());
                framed.extend_from_slice(&[0, 0, 0, 0]);
                framed.extend_from_slice(buf);
                self.socket.send(&framed).map(|n| n.saturating_sub(4))
            }
        }
    }

    /// Receives one control datagram, stripping the zero session ID
    /// prefix on L2TP/IP sockets.  Returns the number of payload bytes
    /// placed at the start of `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        // socket2 takes an uninitialised buffer; reuse the caller's.
        let uninit =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let n = self.socket.recv(uninit)?;
        match self.encap {
            EncapType::Udp => Ok(n),
            EncapType::Ip => {
                if n < 4 {
                    return Ok(0);
                }
                buf.copy_within(4..n, 0);
                Ok(n - 4)
            }
        }
    }

    /// Shuts the socket down, waking any blocked receive.
    pub fn shutdown(&self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("encap", &self.encap)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_pair_defaults_local() {
        let (local, peer) = address_pair("", "127.0.0.1:1701").unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(peer, "127.0.0.1:1701".parse().unwrap());

        let (local, _) = address_pair("", "[::1]:1701").unwrap();
        assert_eq!(local.ip(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_address_pair_rejects_garbage() {
        assert!(address_pair("", "not-an-address").is_err());
        assert!(address_pair("also-bad", "127.0.0.1:1701").is_err());
    }

    #[test]
    fn test_udp_send_recv_loopback() {
        let addr_a: SocketAddr = "127.0.0.1:17010".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:17011".parse().unwrap();
        let a = ControlPlane::new_udp(addr_a, addr_b).unwrap();
        let b = ControlPlane::new_udp(addr_b, addr_a).unwrap();

        a.send(b"ping").unwrap();
        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
