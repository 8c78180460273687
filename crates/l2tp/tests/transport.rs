//! Integration tests exercising the transport and the dynamic tunnel
//! FSM over loopback UDP.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use l2tp::proto::avp::{Avp, AvpType, AvpValue, MessageType};
use l2tp::proto::message::ControlMessage;
use l2tp::{
    ControlConnId, ControlPlane, Context, DataPlaneKind, Event, EventHandler, ProtocolVersion,
    SessionConfig, Transport, TransportConfig, TunnelConfig,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn new_transport(
    local: &str,
    peer: &str,
    version: ProtocolVersion,
    peer_conn_id: u32,
) -> Transport {
    let local: SocketAddr = local.parse().unwrap();
    let peer: SocketAddr = peer.parse().unwrap();
    let cp = ControlPlane::new_udp(local, peer).unwrap();
    Transport::new(
        cp,
        TransportConfig {
            version,
            peer_conn_id: ControlConnId(peer_conn_id),
            ack_timeout: Duration::from_millis(5),
            ..TransportConfig::default()
        },
    )
    .unwrap()
}

fn hello_message(version: ProtocolVersion, peer_conn_id: u32) -> ControlMessage {
    let avps = vec![Avp::message_type(MessageType::Hello)];
    match version {
        ProtocolVersion::V2 => ControlMessage::new_v2(peer_conn_id as u16, 0, avps),
        ProtocolVersion::V3 => ControlMessage::new_v3(peer_conn_id, avps),
    }
}

/// Both peers exchange 3x the transmit window of HELLO messages, which
/// exercises slow start; the receiver must observe them all, in order,
/// with no duplicates.
#[test]
fn test_basic_send_receive() {
    let cases = [
        ("127.0.0.1:17100", "127.0.0.1:17101", ProtocolVersion::V2),
        ("[::1]:17102", "[::1]:17103", ProtocolVersion::V2),
        ("127.0.0.1:17104", "127.0.0.1:17105", ProtocolVersion::V3),
        ("[::1]:17106", "[::1]:17107", ProtocolVersion::V3),
    ];

    for (local, peer, version) in cases {
        let tx = new_transport(local, peer, version, 90);
        let rx = new_transport(peer, local, version, 42);

        let count = 3 * tx.config().tx_window_size;
        for _ in 0..count {
            tx.send(hello_message(version, 90)).unwrap();
        }

        for i in 0..count {
            let item = rx
                .receiver()
                .recv_timeout(RECV_TIMEOUT)
                .unwrap_or_else(|_| panic!("{version} {local}: timed out at message {i}"));
            let msg = item.unwrap();
            assert_eq!(
                msg.msg_type(),
                Some(MessageType::Hello),
                "{version} {local}: message {i}"
            );
        }

        // No duplicates: nothing further may be delivered.
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.receiver().try_recv().is_err(), "{version} {local}");
    }
}

/// Collects context events into a channel for assertions.
struct EventTap(Sender<Event>);

impl EventHandler for EventTap {
    fn handle_event(&self, event: &Event) {
        let _ = self.0.send(event.clone());
    }
}

fn event_tap(ctx: &Context) -> Receiver<Event> {
    let (tx, rx) = unbounded();
    ctx.register_event_handler(Arc::new(EventTap(tx)));
    rx
}

/// A scripted LNS-side peer driving raw datagrams over a UDP socket.
struct TestPeer {
    sock: UdpSocket,
    lac: Option<SocketAddr>,
    /// The LAC's assigned tunnel ID, learned from SCCRQ.
    lac_tid: u16,
    ns: u16,
    nr: u16,
}

impl TestPeer {
    fn bind() -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        TestPeer {
            sock,
            lac: None,
            lac_tid: 0,
            ns: 0,
            nr: 0,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.sock.local_addr().unwrap()
    }

    /// Receives the next control message, skipping ZLB acks.
    fn recv(&mut self) -> ControlMessage {
        self.try_recv()
            .expect("timed out waiting for a control message")
    }

    /// Receives one non-ZLB message, or None on timeout.
    fn try_recv(&mut self) -> Option<ControlMessage> {
        let mut buf = [0u8; 1500];
        loop {
            let (n, from) = match self.sock.recv_from(&mut buf) {
                Ok(ok) => ok,
                Err(_) => return None,
            };
            self.lac = Some(from);
            let msgs = ControlMessage::parse(&buf[..n], ProtocolVersion::V2).unwrap();
            for msg in msgs {
                if msg.is_zlb() {
                    continue;
                }
                self.nr = msg.ns().wrapping_add(1);
                return Some(msg);
            }
        }
    }

    fn send(&mut self, session_id: u16, avps: Vec<Avp>) {
        let mut msg = ControlMessage::new_v2(self.lac_tid, session_id, avps);
        msg.set_ns(self.ns);
        msg.set_nr(self.nr);
        self.ns = self.ns.wrapping_add(1);
        let bytes = msg.encode().unwrap();
        self.sock.send_to(&bytes, self.lac.unwrap()).unwrap();
    }

    fn ack(&mut self) {
        let mut zlb = ControlMessage::new_v2(self.lac_tid, 0, Vec::new());
        zlb.set_ns(self.ns);
        zlb.set_nr(self.nr);
        let bytes = zlb.encode().unwrap();
        self.sock.send_to(&bytes, self.lac.unwrap()).unwrap();
    }
}

fn wait_event(events: &Receiver<Event>, want: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = events
            .recv_timeout(RECV_TIMEOUT)
            .expect("timed out waiting for event");
        if want(&event) {
            return event;
        }
    }
}

/// The v2 LAC dynamic tunnel handshake against a scripted peer: SCCRQ
/// (Ns=0, Nr=0), SCCRP carrying Assigned-Tunnel-ID 90, SCCCN (Ns=1,
/// Nr=1), TunnelUp with the peer's ID recorded.
#[test]
fn test_dynamic_tunnel_handshake() {
    let mut peer = TestPeer::bind();

    let ctx = Context::new(DataPlaneKind::Null).unwrap();
    let events = event_tap(&ctx);

    let config = TunnelConfig {
        peer: peer.addr().to_string(),
        version: ProtocolVersion::V2,
        tunnel_id: ControlConnId(42),
        retry_timeout: Duration::from_millis(200),
        ..TunnelConfig::default()
    };
    let _tunnel = ctx.new_dynamic_tunnel("t1", &config).unwrap();

    // SCCRQ opens the exchange.
    let sccrq = peer.recv();
    assert_eq!(sccrq.msg_type(), Some(MessageType::Sccrq));
    assert_eq!(sccrq.ns(), 0);
    assert_eq!(sccrq.nr(), 0);
    assert_eq!(sccrq.conn_id(), 0);
    let lac_tid = sccrq
        .find_avp(AvpType::AssignedTunnelId)
        .and_then(|avp| avp.as_u32())
        .expect("SCCRQ must carry an assigned tunnel ID");
    assert_eq!(lac_tid, 42);
    peer.lac_tid = lac_tid as u16;
    assert!(sccrq.find_avp(AvpType::HostName).is_some());
    assert!(sccrq.find_avp(AvpType::ProtocolVersion).is_some());
    assert!(sccrq.find_avp(AvpType::ReceiveWindowSize).is_some());

    // SCCRP assigns our tunnel ID.
    peer.send(
        0,
        vec![
            Avp::message_type(MessageType::Sccrp),
            Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(90)),
            Avp::new(AvpType::FramingCapabilities, AvpValue::U32(3)),
            Avp::new(
                AvpType::HostName,
                AvpValue::String("lns.example.com".to_string()),
            ),
        ],
    );

    // SCCCN completes it.
    let scccn = peer.recv();
    assert_eq!(scccn.msg_type(), Some(MessageType::Scccn));
    assert_eq!(scccn.ns(), 1);
    assert_eq!(scccn.nr(), 1);
    assert_eq!(scccn.conn_id(), 90);
    peer.ack();

    let up = wait_event(&events, |event| matches!(event, Event::TunnelUp { .. }));
    match up {
        Event::TunnelUp { name, config, .. } => {
            assert_eq!(name, "t1");
            assert_eq!(config.peer_tunnel_id, ControlConnId(90));
        }
        other => panic!("unexpected event {other:?}"),
    }

    ctx.close();
}

/// Closing an established tunnel sends exactly one StopCCN (plus
/// retransmits while unacknowledged); on the ack the FSM dies, fires
/// TunnelDown, and kills sessions without per-session CDNs.
#[test]
fn test_stopccn_on_close() {
    let mut peer = TestPeer::bind();

    let ctx = Context::new(DataPlaneKind::Null).unwrap();
    let events = event_tap(&ctx);

    let config = TunnelConfig {
        peer: peer.addr().to_string(),
        version: ProtocolVersion::V2,
        tunnel_id: ControlConnId(43),
        retry_timeout: Duration::from_millis(200),
        stopccn_timeout: Duration::from_secs(3),
        ..TunnelConfig::default()
    };
    let tunnel = ctx.new_dynamic_tunnel("t1", &config).unwrap();

    let sccrq = peer.recv();
    peer.lac_tid = sccrq
        .find_avp(AvpType::AssignedTunnelId)
        .and_then(|avp| avp.as_u32())
        .unwrap() as u16;
    peer.send(
        0,
        vec![
            Avp::message_type(MessageType::Sccrp),
            Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(90)),
            Avp::new(AvpType::FramingCapabilities, AvpValue::U32(3)),
        ],
    );
    let scccn = peer.recv();
    assert_eq!(scccn.msg_type(), Some(MessageType::Scccn));
    peer.ack();
    wait_event(&events, |event| matches!(event, Event::TunnelUp { .. }));

    // A session left waiting for ICRP: its ICRQ reaches the peer but is
    // never answered.
    let _session = tunnel.new_session("s1", &SessionConfig::default()).unwrap();
    let icrq = peer.recv();
    assert_eq!(icrq.msg_type(), Some(MessageType::Icrq));
    peer.ack();

    // Close the tunnel.  The close blocks until the FSM dies, so the
    // peer script runs on its own thread, acking the StopCCN promptly.
    // StopCCN implicitly terminates the session: no CDN may appear, and
    // once the StopCCN is acked nothing further may arrive.
    let peer_thread = std::thread::spawn(move || {
        let stop = peer.recv();
        assert_ne!(stop.msg_type(), Some(MessageType::Cdn), "unexpected CDN");
        assert_eq!(stop.msg_type(), Some(MessageType::StopCcn));
        let stop_ns = stop.ns();
        peer.ack();

        peer.sock
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        while let Some(extra) = peer.try_recv() {
            // Only a retransmit of the same StopCCN is tolerable here.
            assert_eq!(extra.msg_type(), Some(MessageType::StopCcn));
            assert_eq!(extra.ns(), stop_ns);
        }
    });
    tunnel.close();
    peer_thread.join().unwrap();

    // The session dies with the tunnel, before TunnelDown fires.
    wait_event(&events, |event| {
        matches!(event, Event::SessionDown { name, .. } if name == "s1")
    });
    let down = wait_event(&events, |event| matches!(event, Event::TunnelDown { .. }));
    match down {
        Event::TunnelDown { name, .. } => assert_eq!(name, "t1"),
        other => panic!("unexpected event {other:?}"),
    }

    ctx.close();
}

/// A dynamic session establishes via ICRQ/ICRP/ICCN once the tunnel is
/// up, and the peer session ID is recorded.
#[test]
fn test_session_establishment() {
    let mut peer = TestPeer::bind();

    let ctx = Context::new(DataPlaneKind::Null).unwrap();
    let events = event_tap(&ctx);

    let config = TunnelConfig {
        peer: peer.addr().to_string(),
        version: ProtocolVersion::V2,
        tunnel_id: ControlConnId(44),
        retry_timeout: Duration::from_millis(200),
        ..TunnelConfig::default()
    };
    let tunnel = ctx.new_dynamic_tunnel("t1", &config).unwrap();
    let session = tunnel.new_session("s1", &SessionConfig::default()).unwrap();

    let sccrq = peer.recv();
    peer.lac_tid = sccrq
        .find_avp(AvpType::AssignedTunnelId)
        .and_then(|avp| avp.as_u32())
        .unwrap() as u16;
    peer.send(
        0,
        vec![
            Avp::message_type(MessageType::Sccrp),
            Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(90)),
            Avp::new(AvpType::FramingCapabilities, AvpValue::U32(3)),
        ],
    );
    peer.recv(); // SCCCN
    peer.ack();

    // The queued session starts once the tunnel establishes.
    let icrq = peer.recv();
    assert_eq!(icrq.msg_type(), Some(MessageType::Icrq));
    let lac_sid = icrq
        .find_avp(AvpType::AssignedSessionId)
        .and_then(|avp| avp.as_u32())
        .expect("ICRQ must carry an assigned session ID");
    assert_ne!(lac_sid, 0);
    assert!(icrq.find_avp(AvpType::CallSerialNumber).is_some());

    peer.send(
        lac_sid as u16,
        vec![
            Avp::message_type(MessageType::Icrp),
            Avp::new(AvpType::AssignedSessionId, AvpValue::U16(77)),
        ],
    );

    let iccn = peer.recv();
    assert_eq!(iccn.msg_type(), Some(MessageType::Iccn));
    assert_eq!(iccn.session_id(), 77);
    peer.ack();

    wait_event(&events, |event| {
        matches!(event, Event::SessionUp { name, .. } if name == "s1")
    });
    assert_eq!(session.config().peer_session_id, ControlConnId(77));

    // Closing the session sends a CDN for it.
    session.close();
    let cdn = peer.recv();
    assert_eq!(cdn.msg_type(), Some(MessageType::Cdn));
    assert!(cdn.find_avp(AvpType::ResultCode).is_some());
    assert!(cdn.find_avp(AvpType::Q931CauseCode).is_some());
    peer.ack();
    wait_event(&events, |event| {
        matches!(event, Event::SessionDown { name, .. } if name == "s1")
    });

    ctx.close();
    // The context close stops the tunnel.
    let stop = peer.recv();
    assert_eq!(stop.msg_type(), Some(MessageType::StopCcn));
    peer.ack();
}

/// A peer-initiated StopCCN tears the tunnel down and fires TunnelDown
/// with the peer's result as the cause.
#[test]
fn test_peer_initiated_stopccn() {
    let mut peer = TestPeer::bind();

    let ctx = Context::new(DataPlaneKind::Null).unwrap();
    let events = event_tap(&ctx);

    let config = TunnelConfig {
        peer: peer.addr().to_string(),
        version: ProtocolVersion::V2,
        tunnel_id: ControlConnId(45),
        retry_timeout: Duration::from_millis(200),
        ..TunnelConfig::default()
    };
    let _tunnel = ctx.new_dynamic_tunnel("t1", &config).unwrap();

    let sccrq = peer.recv();
    peer.lac_tid = sccrq
        .find_avp(AvpType::AssignedTunnelId)
        .and_then(|avp| avp.as_u32())
        .unwrap() as u16;
    peer.send(
        0,
        vec![
            Avp::message_type(MessageType::Sccrp),
            Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(90)),
            Avp::new(AvpType::FramingCapabilities, AvpValue::U32(3)),
        ],
    );
    peer.recv(); // SCCCN
    peer.ack();
    wait_event(&events, |event| matches!(event, Event::TunnelUp { .. }));

    peer.send(
        0,
        vec![
            Avp::message_type(MessageType::StopCcn),
            Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(90)),
            Avp::new(
                AvpType::ResultCode,
                AvpValue::ResultCode(l2tp::proto::avp::ResultCode::new(1)),
            ),
        ],
    );

    let down = wait_event(&events, |event| matches!(event, Event::TunnelDown { .. }));
    match down {
        Event::TunnelDown { cause, .. } => {
            let cause = cause.expect("peer-initiated teardown carries a cause");
            assert!(cause.contains("StopCCN"), "{cause}");
        }
        other => panic!("unexpected event {other:?}"),
    }

    ctx.close();
}
