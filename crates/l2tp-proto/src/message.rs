//! Control message framing.
//!
//! L2TPv2 control header (RFC 2661 section 3.1), 12 bytes with T, L and S
//! set:
//!
//! ```text
//! |T|L|x|x|S|x|O|P|x|x|x|x|  Ver  |            Length             |
//! |           Tunnel ID           |           Session ID          |
//! |               Ns              |               Nr              |
//! ```
//!
//! L2TPv3 control header over UDP (RFC 3931 section 4.1.2.1), 12 bytes:
//!
//! ```text
//! |T|L|x|x|S|x|x|x|x|x|x|x|  Ver  |            Length             |
//! |                 Control Connection ID                         |
//! |               Ns              |               Nr              |
//! ```
//!
//! A control message carrying no AVPs is a ZLB, pure acknowledgement.

use std::fmt::{self, Formatter};
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use l2tp_core::error::ProtocolError;
use l2tp_core::types::{ControlConnId, ProtocolVersion};

use crate::avp::{Avp, AvpType, AvpValue, MessageType};

/// Length of the fixed control header, identical for both versions.
pub const CONTROL_HEADER_LEN: usize = 12;

/// T bit: control message.
const FLAG_TYPE: u16 = 0x8000;
/// L bit: length field present.
const FLAG_LENGTH: u16 = 0x4000;
/// S bit: sequence fields present.
const FLAG_SEQUENCE: u16 = 0x0800;
/// Low nibble: protocol version.
const VERSION_MASK: u16 = 0x000f;

/// Flag word for outgoing v2 control messages: T, L, S, version 2.
const V2_CONTROL_FLAGS: u16 = FLAG_TYPE | FLAG_LENGTH | FLAG_SEQUENCE | 2;
/// Flag word for outgoing v3 control messages: T, L, S, version 3.
const V3_CONTROL_FLAGS: u16 = FLAG_TYPE | FLAG_LENGTH | FLAG_SEQUENCE | 3;

/// An L2TPv2 control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2ControlMessage {
    /// Recipient tunnel ID.
    pub tunnel_id: u16,
    /// Recipient session ID, zero for tunnel-level messages.
    pub session_id: u16,
    /// Send sequence number.
    pub ns: u16,
    /// Receive sequence number (acknowledgement).
    pub nr: u16,
    /// Message body.
    pub avps: Vec<Avp>,
}

/// An L2TPv3 control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V3ControlMessage {
    /// Recipient control connection ID.
    pub conn_id: u32,
    /// Send sequence number.
    pub ns: u16,
    /// Receive sequence number (acknowledgement).
    pub nr: u16,
    /// Message body.
    pub avps: Vec<Avp>,
}

/// A parsed or to-be-sent control message of either protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// RFC 2661 framing.
    V2(V2ControlMessage),
    /// RFC 3931 framing.
    V3(V3ControlMessage),
}

impl ControlMessage {
    /// Builds a v2 control message addressed to the peer's tunnel and
    /// session.  Ns/Nr are stamped by the transport at send time.
    pub fn new_v2(tunnel_id: u16, session_id: u16, avps: Vec<Avp>) -> Self {
        ControlMessage::V2(V2ControlMessage {
            tunnel_id,
            session_id,
            ns: 0,
            nr: 0,
            avps,
        })
    }

    /// Builds a v3 control message addressed to the peer's control
    /// connection.
    pub fn new_v3(conn_id: u32, avps: Vec<Avp>) -> Self {
        ControlMessage::V3(V3ControlMessage {
            conn_id,
            ns: 0,
            nr: 0,
            avps,
        })
    }

    /// Builds an empty-body acknowledgement for the given peer.
    pub fn zlb(version: ProtocolVersion, peer_conn_id: ControlConnId) -> Self {
        match version {
            ProtocolVersion::V2 => Self::new_v2(peer_conn_id.0 as u16, 0, Vec::new()),
            ProtocolVersion::V3 => Self::new_v3(peer_conn_id.0, Vec::new()),
        }
    }

    /// Protocol version of the framing.
    pub fn version(&self) -> ProtocolVersion {
        match self {
            ControlMessage::V2(_) => ProtocolVersion::V2,
            ControlMessage::V3(_) => ProtocolVersion::V3,
        }
    }

    /// The recipient tunnel / control connection ID from the header.
    pub fn conn_id(&self) -> u32 {
        match self {
            ControlMessage::V2(m) => m.tunnel_id as u32,
            ControlMessage::V3(m) => m.conn_id,
        }
    }

    /// The recipient session ID for v2 session-level messages.
    pub fn session_id(&self) -> u16 {
        match self {
            ControlMessage::V2(m) => m.session_id,
            ControlMessage::V3(_) => 0,
        }
    }

    /// Send sequence number.
    pub fn ns(&self) -> u16 {
        match self {
            ControlMessage::V2(m) => m.ns,
            ControlMessage::V3(m) => m.ns,
        }
    }

    /// Receive sequence number.
    pub fn nr(&self) -> u16 {
        match self {
            ControlMessage::V2(m) => m.nr,
            ControlMessage::V3(m) => m.nr,
        }
    }

    /// Stamps the send sequence number.
    pub fn set_ns(&mut self, ns: u16) {
        match self {
            ControlMessage::V2(m) => m.ns = ns,
            ControlMessage::V3(m) => m.ns = ns,
        }
    }

    /// Stamps the receive sequence number.
    pub fn set_nr(&mut self, nr: u16) {
        match self {
            ControlMessage::V2(m) => m.nr = nr,
            ControlMessage::V3(m) => m.nr = nr,
        }
    }

    /// The message body.
    pub fn avps(&self) -> &[Avp] {
        match self {
            ControlMessage::V2(m) => &m.avps,
            ControlMessage::V3(m) => &m.avps,
        }
    }

    /// Appends an AVP to the body.
    pub fn push_avp(&mut self, avp: Avp) {
        match self {
            ControlMessage::V2(m) => m.avps.push(avp),
            ControlMessage::V3(m) => m.avps.push(avp),
        }
    }

    /// True when the message has no body and is purely an acknowledgement.
    pub fn is_zlb(&self) -> bool {
        self.avps().is_empty()
    }

    /// The message type from the leading Message Type AVP, absent for ZLBs.
    pub fn msg_type(&self) -> Option<MessageType> {
        match self.avps().first() {
            Some(Avp {
                value: AvpValue::MessageType(mt),
                ..
            }) => Some(*mt),
            _ => None,
        }
    }

    /// Finds the first AVP of the given type.
    pub fn find_avp(&self, avp_type: AvpType) -> Option<&Avp> {
        self.avps().iter().find(|avp| avp.avp_type == avp_type)
    }

    /// Recovers the clear payloads of any hidden AVPs in the body.
    ///
    /// The random vector AVP preceding a hidden AVP supplies the IV; a
    /// hidden AVP with no preceding random vector is malformed.
    pub fn unhide_avps(&mut self, secret: &[u8]) -> Result<(), ProtocolError> {
        let avps = match self {
            ControlMessage::V2(m) => &mut m.avps,
            ControlMessage::V3(m) => &mut m.avps,
        };
        let mut random_vector: Option<Vec<u8>> = None;
        for avp in avps.iter_mut() {
            if avp.avp_type == AvpType::RandomVector {
                if let AvpValue::Bytes(rv) = &avp.value {
                    random_vector = Some(rv.clone());
                }
                continue;
            }
            if avp.hidden {
                let rv = random_vector
                    .as_deref()
                    .ok_or(ProtocolError::Malformed("hidden AVP without random vector"))?;
                avp.unhide(secret, rv)?;
            }
        }
        Ok(())
    }

    /// Serialises the message, header and body, to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();
        for avp in self.avps() {
            avp.encode(&mut body)?;
        }
        let total = CONTROL_HEADER_LEN + body.len();

        let mut buf = Vec::with_capacity(total);
        match self {
            ControlMessage::V2(m) => {
                buf.write_u16::<BigEndian>(V2_CONTROL_FLAGS).unwrap();
                buf.write_u16::<BigEndian>(total as u16).unwrap();
                buf.write_u16::<BigEndian>(m.tunnel_id).unwrap();
                buf.write_u16::<BigEndian>(m.session_id).unwrap();
                buf.write_u16::<BigEndian>(m.ns).unwrap();
                buf.write_u16::<BigEndian>(m.nr).unwrap();
            }
            ControlMessage::V3(m) => {
                buf.write_u16::<BigEndian>(V3_CONTROL_FLAGS).unwrap();
                buf.write_u16::<BigEndian>(total as u16).unwrap();
                buf.write_u32::<BigEndian>(m.conn_id).unwrap();
                buf.write_u16::<BigEndian>(m.ns).unwrap();
                buf.write_u16::<BigEndian>(m.nr).unwrap();
            }
        }
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parses every control message in a datagram.
    ///
    /// A datagram may carry several back-to-back messages; each declares
    /// its own length, and a declared length overrunning the remaining
    /// buffer rejects the datagram.
    pub fn parse(buf: &[u8], version: ProtocolVersion) -> Result<Vec<ControlMessage>, ProtocolError> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < buf.len() {
            let remaining = &buf[offset..];
            if remaining.len() < CONTROL_HEADER_LEN {
                return Err(ProtocolError::ShortBuffer("control header"));
            }

            let mut cursor = Cursor::new(remaining);
            let flags = cursor.read_u16::<BigEndian>().unwrap();
            if flags & FLAG_TYPE == 0 {
                return Err(ProtocolError::Malformed("data message on control socket"));
            }
            if flags & FLAG_LENGTH == 0 || flags & FLAG_SEQUENCE == 0 {
                return Err(ProtocolError::Malformed("control message missing L or S bit"));
            }
            if flags & VERSION_MASK != version.wire_value() {
                return Err(ProtocolError::Malformed("protocol version mismatch"));
            }

            let length = cursor.read_u16::<BigEndian>().unwrap() as usize;
            if length < CONTROL_HEADER_LEN {
                return Err(ProtocolError::Malformed("control length below header size"));
            }
            if length > remaining.len() {
                return Err(ProtocolError::LengthExceedsBuffer {
                    declared: length,
                    remaining: remaining.len(),
                });
            }

            let message = match version {
                ProtocolVersion::V2 => {
                    let tunnel_id = cursor.read_u16::<BigEndian>().unwrap();
                    let session_id = cursor.read_u16::<BigEndian>().unwrap();
                    let ns = cursor.read_u16::<BigEndian>().unwrap();
                    let nr = cursor.read_u16::<BigEndian>().unwrap();
                    ControlMessage::V2(V2ControlMessage {
                        tunnel_id,
                        session_id,
                        ns,
                        nr,
                        avps: parse_avps(&remaining[CONTROL_HEADER_LEN..length])?,
                    })
                }
                ProtocolVersion::V3 => {
                    let conn_id = cursor.read_u32::<BigEndian>().unwrap();
                    let ns = cursor.read_u16::<BigEndian>().unwrap();
                    let nr = cursor.read_u16::<BigEndian>().unwrap();
                    ControlMessage::V3(V3ControlMessage {
                        conn_id,
                        ns,
                        nr,
                        avps: parse_avps(&remaining[CONTROL_HEADER_LEN..length])?,
                    })
                }
            };

            messages.push(message);
            offset += length;
        }

        Ok(messages)
    }
}

fn parse_avps(mut body: &[u8]) -> Result<Vec<Avp>, ProtocolError> {
    let mut avps = Vec::new();
    while !body.is_empty() {
        let (avp, consumed) = Avp::parse(body)?;
        avps.push(avp);
        body = &body[consumed..];
    }
    Ok(avps)
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let kind = match self.msg_type() {
            Some(mt) => mt.to_string(),
            None => "ZLB".to_string(),
        };
        write!(
            f,
            "{} {} conn={} ns={} nr={}",
            self.version(),
            kind,
            self.conn_id(),
            self.ns(),
            self.nr()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avp::ResultCode;

    fn sccrq_avps(tid: u16) -> Vec<Avp> {
        vec![
            Avp::message_type(MessageType::Sccrq),
            Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)),
            Avp::new(
                AvpType::HostName,
                AvpValue::String("lac.example.com".to_string()),
            ),
            Avp::new(AvpType::FramingCapabilities, AvpValue::U32(3)),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(tid)),
            Avp::new(AvpType::ReceiveWindowSize, AvpValue::U16(4)),
        ]
    }

    #[test]
    fn test_v2_round_trip() {
        let mut msg = ControlMessage::new_v2(90, 0, sccrq_avps(42));
        msg.set_ns(7);
        msg.set_nr(3);
        let buf = msg.encode().unwrap();
        let parsed = ControlMessage::parse(&buf, ProtocolVersion::V2).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], msg);
        assert_eq!(parsed[0].msg_type(), Some(MessageType::Sccrq));
    }

    #[test]
    fn test_v3_round_trip() {
        let avps = vec![
            Avp::message_type(MessageType::Sccrq),
            Avp::new(AvpType::AssignedConnId, AvpValue::U32(0xcafe_f00d)),
            Avp::new(AvpType::PseudowireCaps, AvpValue::U16Array(vec![5, 7])),
        ];
        let msg = ControlMessage::new_v3(0xdead_beef, avps);
        let buf = msg.encode().unwrap();
        let parsed = ControlMessage::parse(&buf, ProtocolVersion::V3).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], msg);
        assert_eq!(parsed[0].conn_id(), 0xdead_beef);
    }

    #[test]
    fn test_zlb_encoding() {
        let mut zlb = ControlMessage::zlb(ProtocolVersion::V2, ControlConnId(90));
        zlb.set_ns(1);
        zlb.set_nr(2);
        let buf = zlb.encode().unwrap();
        assert_eq!(
            buf,
            vec![0xc8, 0x02, 0x00, 0x0c, 0x00, 0x5a, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02]
        );
        let parsed = ControlMessage::parse(&buf, ProtocolVersion::V2).unwrap();
        assert!(parsed[0].is_zlb());
        assert_eq!(parsed[0].msg_type(), None);
    }

    #[test]
    fn test_v3_header_layout() {
        let zlb = ControlMessage::zlb(ProtocolVersion::V3, ControlConnId(0x01020304));
        let buf = zlb.encode().unwrap();
        assert_eq!(
            buf,
            vec![0xc8, 0x03, 0x00, 0x0c, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_multiple_messages_per_datagram() {
        let first = ControlMessage::new_v2(1, 0, vec![Avp::message_type(MessageType::Hello)]);
        let second = ControlMessage::zlb(ProtocolVersion::V2, ControlConnId(1));
        let mut buf = first.encode().unwrap();
        buf.extend_from_slice(&second.encode().unwrap());

        let parsed = ControlMessage::parse(&buf, ProtocolVersion::V2).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].msg_type(), Some(MessageType::Hello));
        assert!(parsed[1].is_zlb());
    }

    #[test]
    fn test_truncated_length_rejected() {
        let msg = ControlMessage::new_v2(1, 0, sccrq_avps(42));
        let mut buf = msg.encode().unwrap();
        // Inflate the declared length past the datagram.
        buf[3] += 8;
        assert!(matches!(
            ControlMessage::parse(&buf, ProtocolVersion::V2),
            Err(ProtocolError::LengthExceedsBuffer { .. })
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let msg = ControlMessage::new_v3(1, Vec::new());
        let buf = msg.encode().unwrap();
        assert!(matches!(
            ControlMessage::parse(&buf, ProtocolVersion::V2),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_stopccn_result_code() {
        let avps = vec![
            Avp::message_type(MessageType::StopCcn),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(42)),
            Avp::new(
                AvpType::ResultCode,
                AvpValue::ResultCode(ResultCode::new(ResultCode::STOPCCN_CLEAR_CONNECTION)),
            ),
        ];
        let msg = ControlMessage::new_v2(90, 0, avps);
        let buf = msg.encode().unwrap();
        let parsed = ControlMessage::parse(&buf, ProtocolVersion::V2).unwrap();
        let rc = parsed[0].find_avp(AvpType::ResultCode).unwrap();
        assert_eq!(
            rc.value,
            AvpValue::ResultCode(ResultCode::new(1)),
        );
    }

    #[test]
    fn test_hidden_avp_through_message() {
        let secret = b"opensesame";
        let rv = vec![9u8, 8, 7, 6, 5, 4, 3, 2];
        let avps = vec![
            Avp::message_type(MessageType::Sccrq),
            Avp::new(AvpType::RandomVector, AvpValue::Bytes(rv.clone())),
            Avp::new_hidden(
                AvpType::HostName,
                AvpValue::String("hidden.example.com".to_string()),
                secret,
                &rv,
            ),
        ];
        let msg = ControlMessage::new_v2(90, 0, avps);
        let buf = msg.encode().unwrap();

        let mut parsed = ControlMessage::parse(&buf, ProtocolVersion::V2).unwrap();
        assert!(parsed[0].find_avp(AvpType::HostName).unwrap().hidden);

        parsed[0].unhide_avps(secret).unwrap();
        let host = parsed[0].find_avp(AvpType::HostName).unwrap();
        assert!(!host.hidden);
        assert_eq!(
            host.value,
            AvpValue::String("hidden.example.com".to_string())
        );

        // Without a secret the decode must fail distinctly.
        let mut parsed = ControlMessage::parse(&buf, ProtocolVersion::V2).unwrap();
        assert!(matches!(
            parsed[0].unhide_avps(b""),
            Err(ProtocolError::HiddenAvpNoSecret)
        ));
    }
}
