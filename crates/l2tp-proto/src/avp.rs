//! Attribute-Value-Pair model and codec.
//!
//! AVPs are the type-length-value units carried by L2TP control messages.
//! The wire layout (RFC 2661 section 4.1):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |M|H| rsvd  |      Length       |           Vendor ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Attribute Type        |        Attribute Value...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt::{self, Formatter};
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use l2tp_core::error::ProtocolError;

/// Mandatory bit in the AVP flags field.
pub const AVP_FLAG_MANDATORY: u16 = 0x8000;
/// Hidden bit in the AVP flags field.
pub const AVP_FLAG_HIDDEN: u16 = 0x4000;
/// Length mask: the low 10 bits of the flags field.
pub const AVP_LENGTH_MASK: u16 = 0x03ff;
/// Fixed part of every AVP: flags/length, vendor ID, attribute type.
pub const AVP_HEADER_LEN: usize = 6;
/// The IETF vendor ID.
pub const VENDOR_ID_IETF: u16 = 0;

/// Control message types for both protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Start-Control-Connection-Request
    Sccrq,
    /// Start-Control-Connection-Reply
    Sccrp,
    /// Start-Control-Connection-Connected
    Scccn,
    /// Stop-Control-Connection-Notification
    StopCcn,
    /// Keepalive
    Hello,
    /// Outgoing-Call-Request
    Ocrq,
    /// Outgoing-Call-Reply
    Ocrp,
    /// Outgoing-Call-Connected
    Occn,
    /// Incoming-Call-Request
    Icrq,
    /// Incoming-Call-Reply
    Icrp,
    /// Incoming-Call-Connected
    Iccn,
    /// Call-Disconnect-Notify
    Cdn,
    /// WAN-Error-Notify
    Wen,
    /// Set-Link-Info
    Sli,
    /// Explicit acknowledgement (L2TPv3)
    Ack,
    /// Anything else
    Unknown(u16),
}

impl MessageType {
    /// Wire value of the message type.
    pub fn wire_value(&self) -> u16 {
        match self {
            MessageType::Sccrq => 1,
            MessageType::Sccrp => 2,
            MessageType::Scccn => 3,
            MessageType::StopCcn => 4,
            MessageType::Hello => 6,
            MessageType::Ocrq => 7,
            MessageType::Ocrp => 8,
            MessageType::Occn => 9,
            MessageType::Icrq => 10,
            MessageType::Icrp => 11,
            MessageType::Iccn => 12,
            MessageType::Cdn => 14,
            MessageType::Wen => 15,
            MessageType::Sli => 16,
            MessageType::Ack => 20,
            MessageType::Unknown(v) => *v,
        }
    }
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        match value {
            1 => MessageType::Sccrq,
            2 => MessageType::Sccrp,
            3 => MessageType::Scccn,
            4 => MessageType::StopCcn,
            6 => MessageType::Hello,
            7 => MessageType::Ocrq,
            8 => MessageType::Ocrp,
            9 => MessageType::Occn,
            10 => MessageType::Icrq,
            11 => MessageType::Icrp,
            12 => MessageType::Iccn,
            14 => MessageType::Cdn,
            15 => MessageType::Wen,
            16 => MessageType::Sli,
            20 => MessageType::Ack,
            v => MessageType::Unknown(v),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Sccrq => "SCCRQ",
            MessageType::Sccrp => "SCCRP",
            MessageType::Scccn => "SCCCN",
            MessageType::StopCcn => "StopCCN",
            MessageType::Hello => "HELLO",
            MessageType::Ocrq => "OCRQ",
            MessageType::Ocrp => "OCRP",
            MessageType::Occn => "OCCN",
            MessageType::Icrq => "ICRQ",
            MessageType::Icrp => "ICRP",
            MessageType::Iccn => "ICCN",
            MessageType::Cdn => "CDN",
            MessageType::Wen => "WEN",
            MessageType::Sli => "SLI",
            MessageType::Ack => "ACK",
            MessageType::Unknown(v) => return write!(f, "Unknown({})", v),
        };
        write!(f, "{}", name)
    }
}

/// IETF-assigned attribute types used by the tunnel and session FSMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvpType {
    /// 0: the leading AVP of every non-ZLB control message.
    MessageType,
    /// 1: StopCCN/CDN result and error codes.
    ResultCode,
    /// 2: protocol version and revision.
    ProtocolVersion,
    /// 3: framing capabilities bitmask.
    FramingCapabilities,
    /// 4: bearer capabilities bitmask.
    BearerCapabilities,
    /// 5: tie breaker for simultaneous SCCRQ.
    TieBreaker,
    /// 6: firmware revision.
    FirmwareRevision,
    /// 7: sender host name.
    HostName,
    /// 8: sender vendor name.
    VendorName,
    /// 9: L2TPv2 assigned tunnel ID.
    AssignedTunnelId,
    /// 10: receive window size.
    ReceiveWindowSize,
    /// 12: Q.931 cause code, carried in CDN.
    Q931CauseCode,
    /// 14: L2TPv2 assigned session ID.
    AssignedSessionId,
    /// 15: call serial number.
    CallSerialNumber,
    /// 36: random vector, IV material for hidden AVPs.
    RandomVector,
    /// 60: L2TPv3 router ID.
    RouterId,
    /// 61: L2TPv3 assigned control connection ID.
    AssignedConnId,
    /// 62: L2TPv3 pseudowire capabilities list.
    PseudowireCaps,
    /// 63: L2TPv3 local session ID.
    LocalSessionId,
    /// 64: L2TPv3 remote session ID.
    RemoteSessionId,
    /// 65: L2TPv3 assigned cookie.
    AssignedCookie,
    /// 66: L2TPv3 remote end ID.
    RemoteEndId,
    /// 68: L2TPv3 pseudowire type.
    PseudowireType,
    /// 69: L2TPv3 L2-specific sublayer.
    L2SpecSublayer,
    /// 70: L2TPv3 data sequencing.
    DataSequencing,
    /// Anything else.
    Unknown(u16),
}

impl AvpType {
    /// Wire value of the attribute type.
    pub fn wire_value(&self) -> u16 {
        match self {
            AvpType::MessageType => 0,
            AvpType::ResultCode => 1,
            AvpType::ProtocolVersion => 2,
            AvpType::FramingCapabilities => 3,
            AvpType::BearerCapabilities => 4,
            AvpType::TieBreaker => 5,
            AvpType::FirmwareRevision => 6,
            AvpType::HostName => 7,
            AvpType::VendorName => 8,
            AvpType::AssignedTunnelId => 9,
            AvpType::ReceiveWindowSize => 10,
            AvpType::Q931CauseCode => 12,
            AvpType::AssignedSessionId => 14,
            AvpType::CallSerialNumber => 15,
            AvpType::RandomVector => 36,
            AvpType::RouterId => 60,
            AvpType::AssignedConnId => 61,
            AvpType::PseudowireCaps => 62,
            AvpType::LocalSessionId => 63,
            AvpType::RemoteSessionId => 64,
            AvpType::AssignedCookie => 65,
            AvpType::RemoteEndId => 66,
            AvpType::PseudowireType => 68,
            AvpType::L2SpecSublayer => 69,
            AvpType::DataSequencing => 70,
            AvpType::Unknown(v) => *v,
        }
    }

    /// True for attribute types the FSMs generate with the mandatory bit
    /// set, per the RFC 2661/3931 AVP tables.
    pub fn is_mandatory(&self) -> bool {
        !matches!(
            self,
            AvpType::FirmwareRevision
                | AvpType::VendorName
                | AvpType::TieBreaker
                | AvpType::RandomVector
                | AvpType::Unknown(_)
        )
    }
}

impl From<u16> for AvpType {
    fn from(value: u16) -> Self {
        match value {
            0 => AvpType::MessageType,
            1 => AvpType::ResultCode,
            2 => AvpType::ProtocolVersion,
            3 => AvpType::FramingCapabilities,
            4 => AvpType::BearerCapabilities,
            5 => AvpType::TieBreaker,
            6 => AvpType::FirmwareRevision,
            7 => AvpType::HostName,
            8 => AvpType::VendorName,
            9 => AvpType::AssignedTunnelId,
            10 => AvpType::ReceiveWindowSize,
            12 => AvpType::Q931CauseCode,
            14 => AvpType::AssignedSessionId,
            15 => AvpType::CallSerialNumber,
            36 => AvpType::RandomVector,
            60 => AvpType::RouterId,
            61 => AvpType::AssignedConnId,
            62 => AvpType::PseudowireCaps,
            63 => AvpType::LocalSessionId,
            64 => AvpType::RemoteSessionId,
            65 => AvpType::AssignedCookie,
            66 => AvpType::RemoteEndId,
            68 => AvpType::PseudowireType,
            69 => AvpType::L2SpecSublayer,
            70 => AvpType::DataSequencing,
            v => AvpType::Unknown(v),
        }
    }
}

/// Result Code AVP payload for StopCCN and CDN.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultCode {
    /// Result code.
    pub result: u16,
    /// Optional error code.
    pub error: Option<u16>,
    /// Optional human-readable error message.
    pub message: String,
}

impl ResultCode {
    /// StopCCN result 1: general request to clear the control connection.
    pub const STOPCCN_CLEAR_CONNECTION: u16 = 1;
    /// StopCCN result 2: general error.
    pub const STOPCCN_GENERAL_ERROR: u16 = 2;
    /// StopCCN result 3: control channel already exists.
    pub const STOPCCN_CHANNEL_EXISTS: u16 = 3;
    /// CDN result 3: call disconnected for administrative reasons.
    pub const CDN_ADMINISTRATIVE: u16 = 3;

    /// A bare result code with no error detail.
    pub fn new(result: u16) -> Self {
        ResultCode {
            result,
            error: None,
            message: String::new(),
        }
    }
}

/// Q.931 Cause Code AVP payload, carried in CDN messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Q931Cause {
    /// Q.931 cause code.
    pub cause_code: u16,
    /// Q.931 cause message.
    pub cause_msg: u8,
    /// Optional advisory text.
    pub advisory: String,
}

/// Typed AVP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvpValue {
    /// Message type payload (attribute 0).
    MessageType(MessageType),
    /// Result code payload (attribute 1).
    ResultCode(ResultCode),
    /// Q.931 cause payload (attribute 12).
    Q931Cause(Q931Cause),
    /// 16-bit scalar.
    U16(u16),
    /// 32-bit scalar.
    U32(u32),
    /// 64-bit scalar (tie breaker).
    U64(u64),
    /// List of 16-bit values (pseudowire capabilities).
    U16Array(Vec<u16>),
    /// Raw octets.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    String(String),
}

impl AvpValue {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            AvpValue::MessageType(mt) => buf.write_u16::<BigEndian>(mt.wire_value()).unwrap(),
            AvpValue::ResultCode(rc) => {
                buf.write_u16::<BigEndian>(rc.result).unwrap();
                if let Some(error) = rc.error {
                    buf.write_u16::<BigEndian>(error).unwrap();
                    buf.extend_from_slice(rc.message.as_bytes());
                }
            }
            AvpValue::Q931Cause(q) => {
                buf.write_u16::<BigEndian>(q.cause_code).unwrap();
                buf.push(q.cause_msg);
                buf.extend_from_slice(q.advisory.as_bytes());
            }
            AvpValue::U16(v) => buf.write_u16::<BigEndian>(*v).unwrap(),
            AvpValue::U32(v) => buf.write_u32::<BigEndian>(*v).unwrap(),
            AvpValue::U64(v) => buf.write_u64::<BigEndian>(*v).unwrap(),
            AvpValue::U16Array(vs) => {
                for v in vs {
                    buf.write_u16::<BigEndian>(*v).unwrap();
                }
            }
            AvpValue::Bytes(b) => buf.extend_from_slice(b),
            AvpValue::String(s) => buf.extend_from_slice(s.as_bytes()),
        }
    }

    fn decode(avp_type: AvpType, raw: &[u8]) -> Result<AvpValue, ProtocolError> {
        let mut cursor = Cursor::new(raw);
        let value = match avp_type {
            AvpType::MessageType => {
                AvpValue::MessageType(MessageType::from(read_u16(&mut cursor, "message type")?))
            }
            AvpType::ResultCode => {
                let result = read_u16(&mut cursor, "result code")?;
                let error = if raw.len() >= 4 {
                    Some(read_u16(&mut cursor, "error code")?)
                } else {
                    None
                };
                let mut message = String::new();
                if raw.len() > 4 {
                    message = String::from_utf8_lossy(&raw[4..]).into_owned();
                }
                AvpValue::ResultCode(ResultCode {
                    result,
                    error,
                    message,
                })
            }
            AvpType::Q931CauseCode => {
                let cause_code = read_u16(&mut cursor, "cause code")?;
                let mut cause_msg = [0u8; 1];
                cursor
                    .read_exact(&mut cause_msg)
                    .map_err(|_| ProtocolError::ShortBuffer("cause message"))?;
                let advisory = String::from_utf8_lossy(&raw[3..]).into_owned();
                AvpValue::Q931Cause(Q931Cause {
                    cause_code,
                    cause_msg: cause_msg[0],
                    advisory,
                })
            }
            AvpType::ProtocolVersion
            | AvpType::FirmwareRevision
            | AvpType::AssignedTunnelId
            | AvpType::ReceiveWindowSize
            | AvpType::AssignedSessionId
            | AvpType::PseudowireType
            | AvpType::L2SpecSublayer
            | AvpType::DataSequencing => {
                if raw.len() != 2 {
                    return Err(ProtocolError::Malformed("16-bit AVP value"));
                }
                AvpValue::U16(read_u16(&mut cursor, "u16 value")?)
            }
            AvpType::FramingCapabilities
            | AvpType::BearerCapabilities
            | AvpType::CallSerialNumber
            | AvpType::RouterId
            | AvpType::AssignedConnId
            | AvpType::LocalSessionId
            | AvpType::RemoteSessionId => {
                if raw.len() != 4 {
                    return Err(ProtocolError::Malformed("32-bit AVP value"));
                }
                AvpValue::U32(
                    cursor
                        .read_u32::<BigEndian>()
                        .map_err(|_| ProtocolError::ShortBuffer("u32 value"))?,
                )
            }
            AvpType::TieBreaker => {
                if raw.len() != 8 {
                    return Err(ProtocolError::Malformed("tie breaker"));
                }
                AvpValue::U64(
                    cursor
                        .read_u64::<BigEndian>()
                        .map_err(|_| ProtocolError::ShortBuffer("tie breaker"))?,
                )
            }
            AvpType::PseudowireCaps => {
                if raw.len() % 2 != 0 {
                    return Err(ProtocolError::Malformed("pseudowire capabilities"));
                }
                let mut caps = Vec::with_capacity(raw.len() / 2);
                for _ in 0..raw.len() / 2 {
                    caps.push(read_u16(&mut cursor, "pseudowire capability")?);
                }
                AvpValue::U16Array(caps)
            }
            AvpType::HostName | AvpType::VendorName => {
                AvpValue::String(String::from_utf8_lossy(raw).into_owned())
            }
            AvpType::RandomVector
            | AvpType::AssignedCookie
            | AvpType::RemoteEndId
            | AvpType::Unknown(_) => AvpValue::Bytes(raw.to_vec()),
        };
        Ok(value)
    }
}

fn read_u16(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u16, ProtocolError> {
    cursor
        .read_u16::<BigEndian>()
        .map_err(|_| ProtocolError::ShortBuffer(what))
}

/// A single Attribute-Value-Pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    /// Mandatory bit: an unrecognised AVP with this set aborts the
    /// control connection or session.
    pub mandatory: bool,
    /// Hidden bit.  While set, `value` holds the obscured payload as
    /// [`AvpValue::Bytes`]; unhiding decodes it and clears the bit.
    pub hidden: bool,
    /// Vendor ID; zero for IETF-defined attributes.
    pub vendor_id: u16,
    /// Attribute type.
    pub avp_type: AvpType,
    /// Decoded payload.
    pub value: AvpValue,
}

impl Avp {
    /// Builds an AVP with the mandatory bit implied by its type.
    pub fn new(avp_type: AvpType, value: AvpValue) -> Self {
        Avp {
            mandatory: avp_type.is_mandatory(),
            hidden: false,
            vendor_id: VENDOR_ID_IETF,
            avp_type,
            value,
        }
    }

    /// Builds the leading Message Type AVP.
    pub fn message_type(mt: MessageType) -> Self {
        Avp::new(AvpType::MessageType, AvpValue::MessageType(mt))
    }

    /// Builds a hidden AVP whose clear payload is obscured with the shared
    /// secret and the random vector the caller has placed earlier in the
    /// same message.
    pub fn new_hidden(
        avp_type: AvpType,
        value: AvpValue,
        secret: &[u8],
        random_vector: &[u8],
    ) -> Self {
        let mut clear = Vec::new();
        value.encode(&mut clear);
        let obscured = crate::hidden::hide(avp_type.wire_value(), &clear, secret, random_vector);
        Avp {
            mandatory: avp_type.is_mandatory(),
            hidden: true,
            vendor_id: VENDOR_ID_IETF,
            avp_type,
            value: AvpValue::Bytes(obscured),
        }
    }

    /// Recovers the clear payload of a hidden AVP in place.
    pub fn unhide(&mut self, secret: &[u8], random_vector: &[u8]) -> Result<(), ProtocolError> {
        if !self.hidden {
            return Ok(());
        }
        let obscured = match &self.value {
            AvpValue::Bytes(raw) => raw,
            _ => return Err(ProtocolError::Malformed("hidden AVP payload")),
        };
        let clear = crate::hidden::unhide(
            self.avp_type.wire_value(),
            obscured,
            secret,
            random_vector,
        )?;
        self.value = AvpValue::decode(self.avp_type, &clear)?;
        self.hidden = false;
        Ok(())
    }

    /// Serialised length of this AVP including its header.
    pub fn wire_len(&self) -> usize {
        let mut value = Vec::new();
        self.value.encode(&mut value);
        AVP_HEADER_LEN + value.len()
    }

    /// Appends the wire encoding of this AVP to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut value = Vec::new();
        self.value.encode(&mut value);

        let total = AVP_HEADER_LEN + value.len();
        if total > AVP_LENGTH_MASK as usize {
            return Err(ProtocolError::Malformed("AVP value too long"));
        }

        let mut flags_len = total as u16;
        if self.mandatory {
            flags_len |= AVP_FLAG_MANDATORY;
        }
        if self.hidden {
            flags_len |= AVP_FLAG_HIDDEN;
        }
        buf.write_u16::<BigEndian>(flags_len).unwrap();
        buf.write_u16::<BigEndian>(self.vendor_id).unwrap();
        buf.write_u16::<BigEndian>(self.avp_type.wire_value())
            .unwrap();
        buf.extend_from_slice(&value);
        Ok(())
    }

    /// Parses one AVP from the front of `buf`.
    ///
    /// Returns the parsed AVP and the number of bytes consumed.  A hidden
    /// AVP is returned with its raw obscured payload in
    /// [`AvpValue::Bytes`]; the caller unhides it once the message's
    /// random vector is known.
    pub fn parse(buf: &[u8]) -> Result<(Avp, usize), ProtocolError> {
        if buf.len() < AVP_HEADER_LEN {
            return Err(ProtocolError::ShortBuffer("AVP header"));
        }
        let mut cursor = Cursor::new(buf);
        let flags_len = cursor.read_u16::<BigEndian>().unwrap();
        let vendor_id = cursor.read_u16::<BigEndian>().unwrap();
        let attribute = cursor.read_u16::<BigEndian>().unwrap();

        let total = (flags_len & AVP_LENGTH_MASK) as usize;
        if total < AVP_HEADER_LEN {
            return Err(ProtocolError::Malformed("AVP length below header size"));
        }
        if total > buf.len() {
            return Err(ProtocolError::LengthExceedsBuffer {
                declared: total,
                remaining: buf.len(),
            });
        }

        let mandatory = flags_len & AVP_FLAG_MANDATORY != 0;
        let hidden = flags_len & AVP_FLAG_HIDDEN != 0;
        let raw = &buf[AVP_HEADER_LEN..total];

        let avp_type = AvpType::from(attribute);
        if vendor_id != VENDOR_ID_IETF || matches!(avp_type, AvpType::Unknown(_)) {
            if mandatory {
                return Err(ProtocolError::UnknownMandatoryAvp {
                    vendor_id,
                    attribute,
                });
            }
            tracing::debug!(vendor_id, attribute, "skipping unrecognised optional AVP");
            return Ok((
                Avp {
                    mandatory,
                    hidden,
                    vendor_id,
                    avp_type: AvpType::Unknown(attribute),
                    value: AvpValue::Bytes(raw.to_vec()),
                },
                total,
            ));
        }

        let value = if hidden {
            AvpValue::Bytes(raw.to_vec())
        } else {
            AvpValue::decode(avp_type, raw)?
        };

        Ok((
            Avp {
                mandatory,
                hidden,
                vendor_id,
                avp_type,
                value,
            },
            total,
        ))
    }

    /// The payload as a u16, if it is one.
    pub fn as_u16(&self) -> Option<u16> {
        match self.value {
            AvpValue::U16(v) => Some(v),
            _ => None,
        }
    }

    /// The payload as a u32, widening a 16-bit value where the v2 variant
    /// of an attribute carries one.
    pub fn as_u32(&self) -> Option<u32> {
        match self.value {
            AvpValue::U16(v) => Some(v as u32),
            AvpValue::U32(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Avp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}{} {:?}",
            self.avp_type,
            if self.mandatory { "[M]" } else { "" },
            self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(avp: Avp) {
        let mut buf = Vec::new();
        avp.encode(&mut buf).unwrap();
        let (parsed, consumed) = Avp::parse(&buf).unwrap();
        assert!(!parsed.hidden);
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, avp);
    }

    #[test]
    fn test_round_trip_all_supported_types() {
        round_trip(Avp::message_type(MessageType::Sccrq));
        round_trip(Avp::new(
            AvpType::ResultCode,
            AvpValue::ResultCode(ResultCode {
                result: 1,
                error: Some(0),
                message: "administrative shutdown".to_string(),
            }),
        ));
        round_trip(Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)));
        round_trip(Avp::new(
            AvpType::FramingCapabilities,
            AvpValue::U32(0x0000_0003),
        ));
        round_trip(Avp::new(AvpType::BearerCapabilities, AvpValue::U32(0)));
        round_trip(Avp::new(
            AvpType::TieBreaker,
            AvpValue::U64(0x0123_4567_89ab_cdef),
        ));
        round_trip(Avp::new(AvpType::FirmwareRevision, AvpValue::U16(0x0100)));
        round_trip(Avp::new(
            AvpType::HostName,
            AvpValue::String("lac.example.com".to_string()),
        ));
        round_trip(Avp::new(
            AvpType::VendorName,
            AvpValue::String("rust-l2tp".to_string()),
        ));
        round_trip(Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(42)));
        round_trip(Avp::new(AvpType::ReceiveWindowSize, AvpValue::U16(4)));
        round_trip(Avp::new(
            AvpType::Q931CauseCode,
            AvpValue::Q931Cause(Q931Cause {
                cause_code: 0,
                cause_msg: 0,
                advisory: String::new(),
            }),
        ));
        round_trip(Avp::new(AvpType::AssignedSessionId, AvpValue::U16(90)));
        round_trip(Avp::new(AvpType::CallSerialNumber, AvpValue::U32(12345)));
        round_trip(Avp::new(
            AvpType::RandomVector,
            AvpValue::Bytes(vec![1, 2, 3, 4]),
        ));
        round_trip(Avp::new(AvpType::AssignedConnId, AvpValue::U32(0xdead_beef)));
        round_trip(Avp::new(
            AvpType::PseudowireCaps,
            AvpValue::U16Array(vec![5, 7]),
        ));
        round_trip(Avp::new(AvpType::LocalSessionId, AvpValue::U32(99)));
        round_trip(Avp::new(AvpType::RemoteSessionId, AvpValue::U32(100)));
        round_trip(Avp::new(
            AvpType::AssignedCookie,
            AvpValue::Bytes(vec![0xaa; 8]),
        ));
        round_trip(Avp::new(AvpType::PseudowireType, AvpValue::U16(7)));
        round_trip(Avp::new(AvpType::L2SpecSublayer, AvpValue::U16(1)));
        round_trip(Avp::new(AvpType::DataSequencing, AvpValue::U16(0)));
    }

    #[test]
    fn test_known_encoding() {
        // Message Type SCCRQ: M-bit, length 8, vendor 0, attribute 0, value 1.
        let mut buf = Vec::new();
        Avp::message_type(MessageType::Sccrq).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x80, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_unknown_mandatory_rejected() {
        // Mandatory AVP with unassigned attribute type 999.
        let buf = vec![0x80, 0x08, 0x00, 0x00, 0x03, 0xe7, 0x00, 0x00];
        match Avp::parse(&buf) {
            Err(ProtocolError::UnknownMandatoryAvp { attribute, .. }) => {
                assert_eq!(attribute, 999)
            }
            other => panic!("expected UnknownMandatoryAvp, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_optional_skipped() {
        let buf = vec![0x00, 0x08, 0x00, 0x00, 0x03, 0xe7, 0x12, 0x34];
        let (avp, consumed) = Avp::parse(&buf).unwrap();
        assert!(!avp.hidden);
        assert_eq!(consumed, 8);
        assert_eq!(avp.avp_type, AvpType::Unknown(999));
        assert_eq!(avp.value, AvpValue::Bytes(vec![0x12, 0x34]));
    }

    #[test]
    fn test_hidden_avp_round_trip() {
        let secret = b"opensesame";
        let rv = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
        let avp = Avp::new_hidden(
            AvpType::HostName,
            AvpValue::String("lac.example.com".to_string()),
            secret,
            &rv,
        );
        let mut buf = Vec::new();
        avp.encode(&mut buf).unwrap();
        // H bit on the wire.
        assert_eq!(buf[0] & 0x40, 0x40);

        let (mut parsed, _) = Avp::parse(&buf).unwrap();
        assert!(parsed.hidden);
        parsed.unhide(secret, &rv).unwrap();
        assert_eq!(
            parsed.value,
            AvpValue::String("lac.example.com".to_string())
        );
    }

    #[test]
    fn test_length_exceeding_buffer_rejected() {
        // Declares 12 bytes but only 8 are present.
        let buf = vec![0x80, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert!(matches!(
            Avp::parse(&buf),
            Err(ProtocolError::LengthExceedsBuffer { .. })
        ));
    }

    #[test]
    fn test_length_below_header_rejected() {
        let buf = vec![0x80, 0x04, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(Avp::parse(&buf), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_bare_result_code() {
        let avp = Avp::new(
            AvpType::ResultCode,
            AvpValue::ResultCode(ResultCode::new(1)),
        );
        let mut buf = Vec::new();
        avp.encode(&mut buf).unwrap();
        // Header + 2-byte result only.
        assert_eq!(buf.len(), 8);
        let (parsed, _) = Avp::parse(&buf).unwrap();
        assert_eq!(parsed, avp);
    }
}
