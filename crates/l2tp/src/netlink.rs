//! Linux kernel data plane over generic netlink.
//!
//! Drives the kernel's `l2tp` genetlink family: `TUNNEL_CREATE`,
//! `TUNNEL_DELETE`, `SESSION_CREATE` and `SESSION_DELETE`, with the
//! attribute set from linux/l2tp.h.  The family ID is resolved once at
//! dial time through the genetlink controller.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use tracing::debug;

use l2tp_core::config::{SessionConfig, TunnelConfig};
use l2tp_core::error::{Error, Result};
use l2tp_core::types::{ControlConnId, EncapType, L2SpecType};

use crate::dataplane::{DataPlane, SessionDataPlane, TunnelDataPlane};

const NETLINK_GENERIC: libc::c_int = 16;

const NLMSG_ERROR: u16 = 2;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const L2TP_GENL_NAME: &str = "l2tp";

// Commands, linux/l2tp.h.
const L2TP_CMD_TUNNEL_CREATE: u8 = 1;
const L2TP_CMD_TUNNEL_DELETE: u8 = 2;
const L2TP_CMD_SESSION_CREATE: u8 = 5;
const L2TP_CMD_SESSION_DELETE: u8 = 6;

// Attributes, linux/l2tp.h.
const L2TP_ATTR_PW_TYPE: u16 = 1;
const L2TP_ATTR_ENCAP_TYPE: u16 = 2;
const L2TP_ATTR_L2SPEC_TYPE: u16 = 5;
const L2TP_ATTR_L2SPEC_LEN: u16 = 6;
const L2TP_ATTR_PROTO_VERSION: u16 = 7;
const L2TP_ATTR_IFNAME: u16 = 8;
const L2TP_ATTR_CONN_ID: u16 = 9;
const L2TP_ATTR_SESSION_ID: u16 = 10;
const L2TP_ATTR_PEER_CONN_ID: u16 = 11;
const L2TP_ATTR_PEER_SESSION_ID: u16 = 12;
const L2TP_ATTR_COOKIE: u16 = 15;
const L2TP_ATTR_PEER_COOKIE: u16 = 16;
const L2TP_ATTR_DEBUG: u16 = 17;
const L2TP_ATTR_RECV_SEQ: u16 = 18;
const L2TP_ATTR_SEND_SEQ: u16 = 19;
const L2TP_ATTR_RECV_TIMEOUT: u16 = 22;
const L2TP_ATTR_FD: u16 = 23;
const L2TP_ATTR_IP_SADDR: u16 = 24;
const L2TP_ATTR_IP_DADDR: u16 = 25;
const L2TP_ATTR_UDP_SPORT: u16 = 26;
const L2TP_ATTR_UDP_DPORT: u16 = 27;
const L2TP_ATTR_IP6_SADDR: u16 = 31;
const L2TP_ATTR_IP6_DADDR: u16 = 32;

// Encapsulation values for L2TP_ATTR_ENCAP_TYPE.
const L2TP_ENCAPTYPE_UDP: u16 = 0;
const L2TP_ENCAPTYPE_IP: u16 = 1;

fn nl_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Appends one netlink attribute, padding the payload to 4 bytes.
fn put_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let len = 4 + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(buf.len() + nl_align(data.len()) - data.len(), 0);
}

fn put_attr_u8(buf: &mut Vec<u8>, attr_type: u16, value: u8) {
    put_attr(buf, attr_type, &[value]);
}

fn put_attr_u16(buf: &mut Vec<u8>, attr_type: u16, value: u16) {
    put_attr(buf, attr_type, &value.to_ne_bytes());
}

fn put_attr_u32(buf: &mut Vec<u8>, attr_type: u16, value: u32) {
    put_attr(buf, attr_type, &value.to_ne_bytes());
}

fn put_attr_u64(buf: &mut Vec<u8>, attr_type: u16, value: u64) {
    put_attr(buf, attr_type, &value.to_ne_bytes());
}

fn put_attr_str(buf: &mut Vec<u8>, attr_type: u16, value: &str) {
    let mut data = value.as_bytes().to_vec();
    data.push(0);
    put_attr(buf, attr_type, &data);
}

/// A blocking genetlink request/ack connection.
struct GenlConn {
    fd: RawFd,
    family_id: u16,
    seq: u32,
}

impl GenlConn {
    fn dial() -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_GENERIC) };
        if fd < 0 {
            return Err(Error::DataPlane(format!(
                "netlink socket: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::DataPlane(format!("netlink bind: {err}")));
        }

        let mut conn = GenlConn {
            fd,
            family_id: GENL_ID_CTRL,
            seq: 1,
        };
        conn.family_id = conn.resolve_family()?;
        debug!(family_id = conn.family_id, "resolved l2tp genetlink family");
        Ok(conn)
    }

    fn resolve_family(&mut self) -> Result<u16> {
        let mut attrs = Vec::new();
        put_attr_str(&mut attrs, CTRL_ATTR_FAMILY_NAME, L2TP_GENL_NAME);
        let response = self.transact(GENL_ID_CTRL, CTRL_CMD_GETFAMILY, &attrs, false)?;

        // Skip nlmsghdr (16) + genlmsghdr (4), walk the attributes.
        let mut offset = 20;
        while offset + 4 <= response.len() {
            let len =
                u16::from_ne_bytes([response[offset], response[offset + 1]]) as usize;
            let attr_type = u16::from_ne_bytes([response[offset + 2], response[offset + 3]]);
            if len < 4 || offset + len > response.len() {
                break;
            }
            if attr_type == CTRL_ATTR_FAMILY_ID && len >= 6 {
                return Ok(u16::from_ne_bytes([
                    response[offset + 4],
                    response[offset + 5],
                ]));
            }
            offset += nl_align(len);
        }
        Err(Error::DataPlane(
            "kernel did not report an l2tp genetlink family; is the l2tp module loaded?"
                .to_string(),
        ))
    }

    /// Executes one l2tp command and waits for the kernel's ack.
    fn request(&mut self, cmd: u8, attrs: &[u8]) -> Result<()> {
        self.transact(self.family_id, cmd, attrs, true).map(|_| ())
    }

    fn transact(
        &mut self,
        family: u16,
        cmd: u8,
        attrs: &[u8],
        want_ack: bool,
    ) -> Result<Vec<u8>> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        // nlmsghdr + genlmsghdr + attributes.
        let total = 16 + 4 + attrs.len();
        let mut msg = Vec::with_capacity(total);
        msg.extend_from_slice(&(total as u32).to_ne_bytes());
        msg.extend_from_slice(&family.to_ne_bytes());
        let flags = if want_ack {
            NLM_F_REQUEST | NLM_F_ACK
        } else {
            NLM_F_REQUEST
        };
        msg.extend_from_slice(&flags.to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel assigns
        msg.push(cmd);
        msg.push(1); // genl version
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(attrs);

        let sent = unsafe {
            libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        if sent < 0 {
            return Err(Error::DataPlane(format!(
                "netlink send: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut buf = vec![0u8; 8192];
        let received = unsafe {
            libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if received < 0 {
            return Err(Error::DataPlane(format!(
                "netlink recv: {}",
                std::io::Error::last_os_error()
            )));
        }
        buf.truncate(received as usize);

        if buf.len() < 16 {
            return Err(Error::DataPlane("short netlink response".to_string()));
        }
        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        if msg_type == NLMSG_ERROR {
            if buf.len() < 20 {
                return Err(Error::DataPlane("short netlink error".to_string()));
            }
            let errno = i32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]);
            if errno == 0 {
                return Ok(buf); // ack
            }
            return Err(Error::DataPlane(format!(
                "kernel rejected request: {}",
                std::io::Error::from_raw_os_error(-errno)
            )));
        }
        Ok(buf)
    }
}

impl Drop for GenlConn {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn tunnel_create_attrs(config: &TunnelConfig) -> Result<Vec<u8>> {
    if config.tunnel_id.is_unset() || config.peer_tunnel_id.is_unset() {
        return Err(Error::DataPlane(
            "tunnel data plane needs both tunnel IDs".to_string(),
        ));
    }
    let mut attrs = Vec::new();
    put_attr_u32(&mut attrs, L2TP_ATTR_CONN_ID, config.tunnel_id.0);
    put_attr_u32(&mut attrs, L2TP_ATTR_PEER_CONN_ID, config.peer_tunnel_id.0);
    put_attr_u8(
        &mut attrs,
        L2TP_ATTR_PROTO_VERSION,
        config.version.wire_value() as u8,
    );
    let encap = match config.encap {
        EncapType::Udp => L2TP_ENCAPTYPE_UDP,
        EncapType::Ip => L2TP_ENCAPTYPE_IP,
    };
    put_attr_u16(&mut attrs, L2TP_ATTR_ENCAP_TYPE, encap);
    put_attr_u32(&mut attrs, L2TP_ATTR_DEBUG, 0);
    Ok(attrs)
}

fn put_addr_attrs(attrs: &mut Vec<u8>, local: &SocketAddr, peer: &SocketAddr) {
    match (local.ip(), peer.ip()) {
        (std::net::IpAddr::V4(saddr), std::net::IpAddr::V4(daddr)) => {
            put_attr(attrs, L2TP_ATTR_IP_SADDR, &saddr.octets());
            put_attr(attrs, L2TP_ATTR_IP_DADDR, &daddr.octets());
        }
        _ => {
            if let std::net::IpAddr::V6(saddr) = local.ip() {
                put_attr(attrs, L2TP_ATTR_IP6_SADDR, &saddr.octets());
            }
            if let std::net::IpAddr::V6(daddr) = peer.ip() {
                put_attr(attrs, L2TP_ATTR_IP6_DADDR, &daddr.octets());
            }
        }
    }
    put_attr_u16(attrs, L2TP_ATTR_UDP_SPORT, local.port());
    put_attr_u16(attrs, L2TP_ATTR_UDP_DPORT, peer.port());
}

/// Data plane backed by the kernel L2TP subsystem.
pub(crate) struct NetlinkDataPlane {
    conn: Arc<Mutex<GenlConn>>,
}

impl NetlinkDataPlane {
    /// Connects to the kernel l2tp genetlink family.  Fails when the
    /// modules are absent or the process lacks permission.
    pub(crate) fn dial() -> Result<Self> {
        Ok(NetlinkDataPlane {
            conn: Arc::new(Mutex::new(GenlConn::dial()?)),
        })
    }
}

struct NetlinkTunnel {
    conn: Arc<Mutex<GenlConn>>,
    tunnel_id: ControlConnId,
}

struct NetlinkSession {
    conn: Arc<Mutex<GenlConn>>,
    tunnel_id: ControlConnId,
    session_id: ControlConnId,
}

impl DataPlane for NetlinkDataPlane {
    fn new_tunnel(
        &self,
        config: &TunnelConfig,
        local: &SocketAddr,
        peer: &SocketAddr,
        fd: Option<RawFd>,
    ) -> Result<Box<dyn TunnelDataPlane>> {
        let mut attrs = tunnel_create_attrs(config)?;
        match fd {
            // Managed tunnel: the kernel wraps our socket.
            Some(fd) => put_attr_u32(&mut attrs, L2TP_ATTR_FD, fd as u32),
            // Kernel-managed socket: pass the addresses instead.
            None => put_addr_attrs(&mut attrs, local, peer),
        }

        let mut conn = self.conn.lock().expect("netlink lock");
        conn.request(L2TP_CMD_TUNNEL_CREATE, &attrs)?;
        debug!(tunnel_id = config.tunnel_id.0, "kernel tunnel created");
        Ok(Box::new(NetlinkTunnel {
            conn: Arc::clone(&self.conn),
            tunnel_id: config.tunnel_id,
        }))
    }

    fn new_session(
        &self,
        tunnel_id: ControlConnId,
        peer_tunnel_id: ControlConnId,
        config: &SessionConfig,
    ) -> Result<Box<dyn SessionDataPlane>> {
        let mut attrs = Vec::new();
        put_attr_u32(&mut attrs, L2TP_ATTR_CONN_ID, tunnel_id.0);
        put_attr_u32(&mut attrs, L2TP_ATTR_PEER_CONN_ID, peer_tunnel_id.0);
        put_attr_u32(&mut attrs, L2TP_ATTR_SESSION_ID, config.session_id.0);
        put_attr_u32(
            &mut attrs,
            L2TP_ATTR_PEER_SESSION_ID,
            config.peer_session_id.0,
        );
        put_attr_u16(
            &mut attrs,
            L2TP_ATTR_PW_TYPE,
            config.pseudowire.wire_value(),
        );
        if config.seqnum {
            put_attr_u8(&mut attrs, L2TP_ATTR_SEND_SEQ, 1);
            put_attr_u8(&mut attrs, L2TP_ATTR_RECV_SEQ, 1);
        }
        if !config.reorder_timeout.is_zero() {
            put_attr_u64(
                &mut attrs,
                L2TP_ATTR_RECV_TIMEOUT,
                config.reorder_timeout.as_millis() as u64,
            );
        }
        if !config.cookie.is_empty() {
            put_attr(&mut attrs, L2TP_ATTR_COOKIE, &config.cookie);
        }
        if !config.peer_cookie.is_empty() {
            put_attr(&mut attrs, L2TP_ATTR_PEER_COOKIE, &config.peer_cookie);
        }
        if !config.interface_name.is_empty() {
            put_attr_str(&mut attrs, L2TP_ATTR_IFNAME, &config.interface_name);
        }
        put_attr_u8(
            &mut attrs,
            L2TP_ATTR_L2SPEC_TYPE,
            match config.l2spec_type {
                L2SpecType::None => 0,
                L2SpecType::Default => 1,
            },
        );
        put_attr_u8(
            &mut attrs,
            L2TP_ATTR_L2SPEC_LEN,
            config.l2spec_type.wire_len(),
        );

        let mut conn = self.conn.lock().expect("netlink lock");
        conn.request(L2TP_CMD_SESSION_CREATE, &attrs)?;
        debug!(
            tunnel_id = tunnel_id.0,
            session_id = config.session_id.0,
            "kernel session created"
        );
        Ok(Box::new(NetlinkSession {
            conn: Arc::clone(&self.conn),
            tunnel_id,
            session_id: config.session_id,
        }))
    }

    fn close(&self) {}
}

impl TunnelDataPlane for NetlinkTunnel {
    fn down(&self) -> Result<()> {
        let mut attrs = Vec::new();
        put_attr_u32(&mut attrs, L2TP_ATTR_CONN_ID, self.tunnel_id.0);
        let mut conn = self.conn.lock().expect("netlink lock");
        conn.request(L2TP_CMD_TUNNEL_DELETE, &attrs)
    }
}

impl SessionDataPlane for NetlinkSession {
    fn down(&self) -> Result<()> {
        let mut attrs = Vec::new();
        put_attr_u32(&mut attrs, L2TP_ATTR_CONN_ID, self.tunnel_id.0);
        put_attr_u32(&mut attrs, L2TP_ATTR_SESSION_ID, self.session_id.0);
        let mut conn = self.conn.lock().expect("netlink lock");
        conn.request(L2TP_CMD_SESSION_DELETE, &attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_alignment() {
        let mut buf = Vec::new();
        put_attr_u8(&mut buf, L2TP_ATTR_PROTO_VERSION, 3);
        // 4-byte header + 1 byte payload, padded to 8.
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[0..2], 5u16.to_ne_bytes());

        put_attr_u32(&mut buf, L2TP_ATTR_CONN_ID, 42);
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_string_attr_nul_terminated() {
        let mut buf = Vec::new();
        put_attr_str(&mut buf, L2TP_ATTR_IFNAME, "l2tpeth0");
        // 4 + 9 = 13, aligned to 16.
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[4..13], b"l2tpeth0\0");
    }

    #[test]
    fn test_tunnel_attrs_require_ids() {
        let config = TunnelConfig::default();
        assert!(tunnel_create_attrs(&config).is_err());
    }
}
