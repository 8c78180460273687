//! User-facing events.
//!
//! Events are dispatched on the thread of the tunnel that generated them:
//! events for one tunnel arrive in order, events from different tunnels
//! may arrive concurrently.

use std::net::SocketAddr;

use l2tp_core::config::{SessionConfig, TunnelConfig};

/// Events emitted to registered handlers as tunnels and sessions change
/// state.
#[derive(Debug, Clone)]
pub enum Event {
    /// A tunnel came up.  For quiescent and static tunnels this fires on
    /// instantiation; for dynamic tunnels on completion of the control
    /// protocol exchange.
    TunnelUp {
        /// Tunnel name.
        name: String,
        /// The tunnel's configuration, including any identifiers assigned
        /// during establishment.
        config: TunnelConfig,
        /// Local control-plane address, where one exists.
        local_addr: Option<SocketAddr>,
        /// Peer control-plane address, where one exists.
        peer_addr: Option<SocketAddr>,
    },
    /// A tunnel went down.
    TunnelDown {
        /// Tunnel name.
        name: String,
        /// The tunnel's configuration.
        config: TunnelConfig,
        /// The failure that brought the tunnel down, absent on a clean
        /// administrative close.
        cause: Option<String>,
    },
    /// A session came up.
    SessionUp {
        /// Parent tunnel name.
        tunnel_name: String,
        /// Session name.
        name: String,
        /// The session's configuration, including the peer session ID.
        config: SessionConfig,
    },
    /// A session went down.
    SessionDown {
        /// Parent tunnel name.
        tunnel_name: String,
        /// Session name.
        name: String,
        /// The session's configuration.
        config: SessionConfig,
    },
}

/// Receiver for L2TP events.
///
/// Handlers are called from the tunnel threads managed by the context.
/// A handler must not unregister itself (or any other handler) from
/// within the callback.
pub trait EventHandler: Send + Sync {
    /// Called when an event occurs.
    fn handle_event(&self, event: &Event);
}
