//! The data-plane interface.
//!
//! The control plane calls into a data plane after FSM transitions to
//! bring kernel forwarding state up or down.  The null implementation
//! satisfies the contract without kernel calls and is used for protocol
//! testing without root.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use l2tp_core::config::{SessionConfig, TunnelConfig};
use l2tp_core::error::Result;
use l2tp_core::types::ControlConnId;

/// Selects the data-plane implementation at context construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPlaneKind {
    /// No kernel interaction; every operation succeeds.
    #[default]
    Null,
    /// The Linux kernel L2TP subsystem, driven over generic netlink.
    /// Requires the l2tp modules and appropriate permissions.
    LinuxKernel,
}

/// A tunnel's data-plane state.
pub trait TunnelDataPlane: Send {
    /// Tears the tunnel data plane down.  On success the kernel state is
    /// fully destroyed.
    fn down(&self) -> Result<()>;
}

/// A session's data-plane state.
pub trait SessionDataPlane: Send {
    /// Tears the session data plane down.
    fn down(&self) -> Result<()>;
}

/// Factory for tunnel and session data-plane instances.
pub trait DataPlane: Send + Sync {
    /// Creates the data plane for a tunnel.
    ///
    /// `fd` is the control socket fd for tunnels whose socket lives in
    /// userspace, and `None` for kernel-managed (static) tunnels.
    fn new_tunnel(
        &self,
        config: &TunnelConfig,
        local: &SocketAddr,
        peer: &SocketAddr,
        fd: Option<RawFd>,
    ) -> Result<Box<dyn TunnelDataPlane>>;

    /// Creates the data plane for a session inside an existing tunnel.
    fn new_session(
        &self,
        tunnel_id: ControlConnId,
        peer_tunnel_id: ControlConnId,
        config: &SessionConfig,
    ) -> Result<Box<dyn SessionDataPlane>>;

    /// Releases resources held by the data plane.  Called when the
    /// context shuts down, after every tunnel has closed.
    fn close(&self);
}

pub(crate) struct NullDataPlane;

struct NullTunnel;
struct NullSession;

impl TunnelDataPlane for NullTunnel {
    fn down(&self) -> Result<()> {
        Ok(())
    }
}

impl SessionDataPlane for NullSession {
    fn down(&self) -> Result<()> {
        Ok(())
    }
}

impl DataPlane for NullDataPlane {
    fn new_tunnel(
        &self,
        _config: &TunnelConfig,
        _local: &SocketAddr,
        _peer: &SocketAddr,
        _fd: Option<RawFd>,
    ) -> Result<Box<dyn TunnelDataPlane>> {
        Ok(Box::new(NullTunnel))
    }

    fn new_session(
        &self,
        _tunnel_id: ControlConnId,
        _peer_tunnel_id: ControlConnId,
        _config: &SessionConfig,
    ) -> Result<Box<dyn SessionDataPlane>> {
        Ok(Box::new(NullSession))
    }

    fn close(&self) {}
}
