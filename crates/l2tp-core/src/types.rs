use std::fmt::{self, Formatter};

/// Numeric identifier for an L2TP tunnel or session.
///
/// L2TPv2 identifiers occupy 16 bits on the wire, L2TPv3 identifiers the
/// full 32 bits.  The value zero is reserved to mean "not yet assigned" in
/// request messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ControlConnId(pub u32);

impl ControlConnId {
    /// Returns true if the identifier has not been assigned.
    #[inline]
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the identifier fits the 16-bit L2TPv2 space.
    #[inline]
    pub fn fits_v2(&self) -> bool {
        self.0 <= u16::MAX as u32
    }
}

impl From<u32> for ControlConnId {
    fn from(value: u32) -> Self {
        ControlConnId(value)
    }
}

impl fmt::Display for ControlConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// L2TP protocol version.
///
/// L2TPv2 is described by RFC 2661, L2TPv3 by RFC 3931.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// RFC 2661
    #[default]
    V2,
    /// RFC 3931
    V3,
}

impl ProtocolVersion {
    /// Wire value carried in message headers.
    pub fn wire_value(&self) -> u16 {
        match self {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V2 => write!(f, "L2TPv2"),
            ProtocolVersion::V3 => write!(f, "L2TPv3"),
        }
    }
}

/// Tunnel encapsulation type.
///
/// IP encapsulation is only valid for L2TPv3 tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncapType {
    /// L2TP over UDP, both protocol versions.
    #[default]
    Udp,
    /// L2TP over IP (protocol 115), L2TPv3 only.
    Ip,
}

impl fmt::Display for EncapType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EncapType::Udp => write!(f, "udp"),
            EncapType::Ip => write!(f, "ip"),
        }
    }
}

/// The emulated layer-2 service carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PseudowireType {
    /// PPP pseudowire.
    #[default]
    Ppp,
    /// Ethernet pseudowire (L2TPv3 only).
    Eth,
}

impl PseudowireType {
    /// RFC 4446 pseudowire type number, as carried in the L2TPv3
    /// Pseudowire Type AVP and the kernel netlink attribute.
    pub fn wire_value(&self) -> u16 {
        match self {
            PseudowireType::Ppp => 7,
            PseudowireType::Eth => 5,
        }
    }
}

impl fmt::Display for PseudowireType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PseudowireType::Ppp => write!(f, "ppp"),
            PseudowireType::Eth => write!(f, "eth"),
        }
    }
}

/// RFC 3931 L2-specific sublayer type for session data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L2SpecType {
    /// No L2-specific sublayer.
    #[default]
    None,
    /// The default 4-byte sublayer.
    Default,
}

impl L2SpecType {
    /// Length in bytes of the sublayer in data packets.
    pub fn wire_len(&self) -> u8 {
        match self {
            L2SpecType::None => 0,
            L2SpecType::Default => 4,
        }
    }
}

/// Framing capabilities advertised in SCCRQ/SCCRP, RFC 2661 section 4.4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingCaps(pub u32);

impl FramingCaps {
    /// Synchronous framing supported.
    pub const SYNC: u32 = 0x1;
    /// Asynchronous framing supported.
    pub const ASYNC: u32 = 0x2;
}

impl Default for FramingCaps {
    fn default() -> Self {
        FramingCaps(Self::SYNC | Self::ASYNC)
    }
}
