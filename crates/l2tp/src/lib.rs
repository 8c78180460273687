#![warn(missing_docs)]

//! l2tp: an L2TPv2 (RFC 2661) and L2TPv3 (RFC 3931) control plane for
//! Linux.
//!
//! The crate establishes and manages tunnels and the sessions they
//! contain, runs the reliable control message transport the protocol
//! demands, and instructs the kernel L2TP subsystem to bring up
//! data-plane state.
//!
//! The entry point is [`Context`], which holds a collection of tunnels:
//!
//! ```no_run
//! use l2tp::{Context, DataPlaneKind, TunnelConfig};
//!
//! # fn main() -> Result<(), l2tp::Error> {
//! let ctx = Context::new(DataPlaneKind::Null)?;
//! let tunnel = ctx.new_dynamic_tunnel("t1", &TunnelConfig {
//!     peer: "127.0.0.1:1701".to_string(),
//!     ..TunnelConfig::default()
//! })?;
//! // ... later:
//! tunnel.close();
//! ctx.close();
//! # Ok(())
//! # }
//! ```
//!
//! Tunnels come in three flavours: *dynamic* tunnels run the full
//! control protocol as an L2TP Access Concentrator, *quiescent* tunnels
//! only acknowledge and keep alive, and *static* tunnels instantiate
//! kernel state with no userspace socket at all.

/// TOML configuration loading.
pub mod config;
/// The context registry holding tunnels.
pub mod context;
/// The control-plane datagram socket.
pub mod controlplane;
/// The data-plane interface and its null implementation.
pub mod dataplane;
/// User-facing events and the handler trait.
pub mod event;
mod netlink;
/// Sessions and their FSM.
pub mod session;
/// The reliable control message transport.
pub mod transport;
/// Tunnels and their FSM.
pub mod tunnel;

pub use l2tp_proto as proto;

pub use config::Config;
pub use context::Context;
pub use controlplane::ControlPlane;
pub use dataplane::{DataPlane, DataPlaneKind, SessionDataPlane, TunnelDataPlane};
pub use event::{Event, EventHandler};
pub use session::Session;
pub use transport::Transport;
pub use tunnel::Tunnel;

pub use l2tp_core::config::{SessionConfig, TransportConfig, TunnelConfig};
pub use l2tp_core::error::{Error, ProtocolError, Result, TransportError};
pub use l2tp_core::types::{
    ControlConnId, EncapType, FramingCaps, L2SpecType, ProtocolVersion, PseudowireType,
};
