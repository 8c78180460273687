use std::time::Duration;

use crate::types::{
    ControlConnId, EncapType, FramingCaps, L2SpecType, ProtocolVersion, PseudowireType,
};

/// Configuration for a single tunnel between two L2TP hosts.
///
/// Each tunnel may contain multiple sessions.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local address string, e.g. `"127.0.0.1:9000"` or `"[::1]:9000"`.
    /// May be empty, in which case the wildcard address of the peer's
    /// family is used.
    pub local: String,
    /// Peer address string.  Required.
    pub peer: String,
    /// Encapsulation type.  IP encapsulation requires L2TPv3.
    pub encap: EncapType,
    /// Protocol version.
    pub version: ProtocolVersion,
    /// Local tunnel ID.  Zero means allocate one.
    pub tunnel_id: ControlConnId,
    /// Peer tunnel ID.  Must be zero for dynamic tunnels and nonzero for
    /// quiescent and static tunnels.
    pub peer_tunnel_id: ControlConnId,
    /// Host name advertised in SCCRQ.  Filled from the OS hostname when
    /// empty.
    pub host_name: String,
    /// Framing capabilities advertised in SCCRQ.
    pub framing_caps: FramingCaps,
    /// How long to keep retransmitting StopCCN before declaring the tunnel
    /// dead.  RFC 2661 section 5.7 recommends 31 seconds, applied when the
    /// field is zero.
    pub stopccn_timeout: Duration,
    /// Transmit window advertised to the peer and used to cap the
    /// congestion window.
    pub tx_window_size: u16,
    /// Interval between Hello keepalives when the transport is idle.
    /// Zero disables Hello generation.
    pub hello_timeout: Duration,
    /// Retransmits allowed per message before giving up on the peer.
    pub max_retries: usize,
    /// Delay before a queued message is retransmitted.
    pub retry_timeout: Duration,
    /// Shared secret for AVP hiding.  Empty disables hidden AVPs.
    pub secret: Vec<u8>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            local: String::new(),
            peer: String::new(),
            encap: EncapType::Udp,
            version: ProtocolVersion::V2,
            tunnel_id: ControlConnId(0),
            peer_tunnel_id: ControlConnId(0),
            host_name: String::new(),
            framing_caps: FramingCaps::default(),
            stopccn_timeout: Duration::ZERO,
            tx_window_size: 4,
            hello_timeout: Duration::ZERO,
            max_retries: 5,
            retry_timeout: Duration::from_secs(1),
            secret: Vec::new(),
        }
    }
}

/// Configuration for a pseudowire session within a tunnel.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Local session ID.  Zero means allocate one.
    pub session_id: ControlConnId,
    /// Peer session ID.  Learned from ICRP for dynamic sessions.
    pub peer_session_id: ControlConnId,
    /// Type of traffic carried by the session.
    pub pseudowire: PseudowireType,
    /// Enable data packet sequence numbers.
    pub seqnum: bool,
    /// How long the kernel holds a data packet in the reorder queue when
    /// sequence numbers are enabled.
    pub reorder_timeout: Duration,
    /// Local cookie for L2TPv3 data packets: 0, 4 or 8 bytes.
    pub cookie: Vec<u8>,
    /// Peer cookie for L2TPv3 data packets: 0, 4 or 8 bytes.
    pub peer_cookie: Vec<u8>,
    /// Interface name hint for Ethernet pseudowires.  The kernel picks
    /// `l2tpethN` when empty.
    pub interface_name: String,
    /// L2-specific sublayer type for data packets.
    pub l2spec_type: L2SpecType,
}

/// Configuration for the reliable control message transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Protocol version framing to use.
    pub version: ProtocolVersion,
    /// The peer's tunnel ID / control connection ID, stamped into outgoing
    /// message headers.  May start at zero for dynamic tunnels and be set
    /// once SCCRP arrives.
    pub peer_conn_id: ControlConnId,
    /// Maximum transmit window.
    pub tx_window_size: u16,
    /// Retransmits allowed per message.
    pub max_retries: usize,
    /// Delay before retransmitting the oldest unacknowledged message.
    pub retry_timeout: Duration,
    /// How long to wait for a piggyback opportunity before sending an
    /// explicit ZLB acknowledgement.
    pub ack_timeout: Duration,
    /// Idle interval after which a Hello is generated.  Zero disables.
    pub hello_timeout: Duration,
    /// Shared secret for AVP hiding.  Empty disables unhiding.
    pub secret: Vec<u8>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            version: ProtocolVersion::V2,
            peer_conn_id: ControlConnId(0),
            tx_window_size: 4,
            max_retries: 5,
            retry_timeout: Duration::from_secs(1),
            ack_timeout: Duration::from_millis(100),
            hello_timeout: Duration::ZERO,
            secret: Vec::new(),
        }
    }
}
