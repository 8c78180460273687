//! The reliable control message transport, RFC 2661 section 5.8 /
//! RFC 3931 section 4.2.
//!
//! The transport layers in-order, acknowledged delivery on top of a
//! [`ControlPlane`] datagram socket.  Two threads serve each instance: a
//! reader blocked on the socket, and an engine multiplexing user sends,
//! received frames and timer deadlines through a `select!` loop.
//!
//! Sequencing rules:
//! - every message carrying a body consumes one Ns; ZLB acks do not
//! - a message's Nr acknowledges all in-flight messages with Ns < Nr
//! - in-order bodies are delivered and schedule a deferred ZLB unless a
//!   body message piggybacks the ack first
//! - duplicates trigger an immediate ZLB; out-of-window messages are
//!   dropped but still acknowledged

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use l2tp_core::config::TransportConfig;
use l2tp_core::error::{Error, ProtocolError, Result, TransportError};
use l2tp_core::types::ControlConnId;
use l2tp_proto::message::ControlMessage;
use l2tp_proto::seq::{seq_compare, seq_increment};
use l2tp_proto::window::TxWindow;

use crate::controlplane::ControlPlane;

const RECV_BUF_LEN: usize = 4096;

/// A deliverable from the transport to its consumer: an in-order control
/// message, or a non-fatal protocol error the FSM must react to.
pub type TransportItem = std::result::Result<ControlMessage, Error>;

struct Pending {
    msg: ControlMessage,
    retries: usize,
}

/// Reliable, in-order control message transport for one tunnel.
pub struct Transport {
    config: TransportConfig,
    cp: Arc<ControlPlane>,
    peer_conn_id: Arc<AtomicU32>,
    closing: Arc<AtomicBool>,
    send_tx: Option<Sender<ControlMessage>>,
    recv_rx: Receiver<TransportItem>,
    drained_rx: Receiver<()>,
    reader: Option<JoinHandle<()>>,
    engine: Option<JoinHandle<()>>,
}

impl Transport {
    /// Creates a transport over a bound and connected control-plane
    /// socket and starts its worker threads.
    pub fn new(cp: ControlPlane, config: TransportConfig) -> Result<Self> {
        if config.tx_window_size == 0 {
            return Err(Error::Validation(
                "transport window size must be nonzero".to_string(),
            ));
        }

        let cp = Arc::new(cp);
        let peer_conn_id = Arc::new(AtomicU32::new(config.peer_conn_id.0));
        let closing = Arc::new(AtomicBool::new(false));

        let (send_tx, send_rx) = unbounded::<ControlMessage>();
        let (wire_tx, wire_rx) = unbounded::<std::io::Result<Vec<u8>>>();
        let (recv_tx, recv_rx) = unbounded::<TransportItem>();
        // Drain notifications are advisory; a small bound with lossy sends
        // keeps a disinterested consumer from backing the engine up.
        let (drained_tx, drained_rx) = bounded::<()>(16);

        let reader = {
            let cp = Arc::clone(&cp);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("l2tp-xport-rx".to_string())
                .spawn(move || run_reader(cp, closing, wire_tx))
                .map_err(Error::Io)?
        };

        let engine = {
            let engine = Engine::new(
                Arc::clone(&cp),
                config.clone(),
                Arc::clone(&peer_conn_id),
                send_rx,
                wire_rx,
                recv_tx,
                drained_tx,
            );
            thread::Builder::new()
                .name("l2tp-xport".to_string())
                .spawn(move || engine.run())
                .map_err(Error::Io)?
        };

        Ok(Transport {
            config,
            cp,
            peer_conn_id,
            closing,
            send_tx: Some(send_tx),
            recv_rx,
            drained_rx,
            reader: Some(reader),
            engine: Some(engine),
        })
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The underlying socket fd, for kernel-managed data planes.
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.cp.raw_fd()
    }

    /// Updates the peer connection ID once it is learned from SCCRP.
    /// Subsequent ZLB acks and Hellos are addressed to it.
    pub fn set_peer_conn_id(&self, conn_id: ControlConnId) {
        self.peer_conn_id.store(conn_id.0, AtomicOrdering::Relaxed);
    }

    /// Queues a control message for reliable transmission.
    ///
    /// The message is stamped with the next Ns and goes to the wire as
    /// soon as the congestion window allows.
    pub fn send(&self, msg: ControlMessage) -> Result<()> {
        let tx = self
            .send_tx
            .as_ref()
            .ok_or(Error::Transport(TransportError::Closed))?;
        tx.send(msg)
            .map_err(|_| Error::Transport(TransportError::Closed))
    }

    /// Receives the next in-order control message, blocking until one
    /// arrives, a protocol error needs the FSM's attention, or the
    /// transport dies.
    pub fn recv(&self) -> Result<ControlMessage> {
        match self.recv_rx.recv() {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Transport(TransportError::Closed)),
        }
    }

    /// The receive channel, for callers selecting over several sources.
    pub fn receiver(&self) -> &Receiver<TransportItem> {
        &self.recv_rx
    }

    /// Notifications that every in-flight message has been acknowledged.
    ///
    /// The tunnel FSM uses this to observe the StopCCN acknowledgement
    /// during shutdown: StopCCN is the last message it sends, so a drained
    /// queue means the peer acked it.
    pub fn drained(&self) -> &Receiver<()> {
        &self.drained_rx
    }

    /// Shuts the transport down.  Pending messages are abandoned, timers
    /// cancelled, and any blocked send or receive fails with
    /// [`TransportError::Closed`].
    pub fn close(&mut self) {
        // Dropping the send channel stops the engine, which flushes any
        // pending acknowledgement on its way out; only then may the
        // socket go away, which unblocks the reader.
        self.send_tx.take();
        if let Some(handle) = self.engine.take() {
            let _ = handle.join();
        }
        self.closing.store(true, AtomicOrdering::Relaxed);
        self.cp.shutdown();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_reader(
    cp: Arc<ControlPlane>,
    closing: Arc<AtomicBool>,
    wire_tx: Sender<std::io::Result<Vec<u8>>>,
) {
    let mut buf = [0u8; RECV_BUF_LEN];
    loop {
        match cp.recv(&mut buf) {
            Ok(0) => {
                if closing.load(AtomicOrdering::Relaxed) {
                    return;
                }
                // Empty datagrams carry nothing useful.
                continue;
            }
            Ok(n) => {
                if wire_tx.send(Ok(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(err) => {
                if closing.load(AtomicOrdering::Relaxed) {
                    return;
                }
                // A connected UDP socket surfaces ICMP unreachable as
                // ECONNREFUSED; the retransmit machinery owns recovery.
                if err.kind() == std::io::ErrorKind::ConnectionRefused {
                    continue;
                }
                let _ = wire_tx.send(Err(err));
                return;
            }
        }
    }
}

struct Engine {
    cp: Arc<ControlPlane>,
    config: TransportConfig,
    peer_conn_id: Arc<AtomicU32>,
    window: TxWindow,
    ns: u16,
    nr: u16,
    tx_queue: VecDeque<Pending>,
    ack_queue: VecDeque<Pending>,
    retry_deadline: Option<Instant>,
    hello_deadline: Option<Instant>,
    ack_deadline: Option<Instant>,
    send_rx: Receiver<ControlMessage>,
    wire_rx: Receiver<std::io::Result<Vec<u8>>>,
    recv_tx: Sender<TransportItem>,
    drained_tx: Sender<()>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    fn new(
        cp: Arc<ControlPlane>,
        config: TransportConfig,
        peer_conn_id: Arc<AtomicU32>,
        send_rx: Receiver<ControlMessage>,
        wire_rx: Receiver<std::io::Result<Vec<u8>>>,
        recv_tx: Sender<TransportItem>,
        drained_tx: Sender<()>,
    ) -> Self {
        let mut window = TxWindow::default();
        window.reset(config.tx_window_size);
        let hello_deadline = hello_deadline(&config);
        Engine {
            cp,
            config,
            peer_conn_id,
            window,
            ns: 0,
            nr: 0,
            tx_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            retry_deadline: None,
            hello_deadline,
            ack_deadline: None,
            send_rx,
            wire_rx,
            recv_tx,
            drained_tx,
        }
    }

    fn run(mut self) {
        loop {
            let timeout = self.next_timeout();
            crossbeam_channel::select! {
                recv(self.send_rx) -> msg => match msg {
                    Ok(msg) => {
                        self.enqueue(msg);
                        if self.flush().is_err() {
                            return;
                        }
                    }
                    // Transport closed: flush any pending acknowledgement
                    // so the peer is not left retransmitting, then stop.
                    Err(_) => {
                        if self.ack_deadline.is_some() {
                            let _ = self.send_zlb();
                        }
                        return;
                    }
                },
                recv(self.wire_rx) -> frame => match frame {
                    Ok(Ok(bytes)) => {
                        if self.on_frame(&bytes).is_err() {
                            return;
                        }
                    }
                    Ok(Err(err)) => {
                        self.fatal(TransportError::Io(err));
                        return;
                    }
                    Err(_) => return,
                },
                recv(after(timeout)) -> _ => {
                    if self.on_deadline().is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        [self.retry_deadline, self.hello_deadline, self.ack_deadline]
            .iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::from_secs(3600))
    }

    /// Assigns the next Ns and queues the message for transmission.
    fn enqueue(&mut self, mut msg: ControlMessage) {
        msg.set_ns(self.ns);
        self.ns = seq_increment(self.ns);
        self.tx_queue.push_back(Pending { msg, retries: 0 });
    }

    /// Transmits queued messages while the window allows.
    fn flush(&mut self) -> std::result::Result<(), ()> {
        while self.window.can_send() {
            let Some(mut pending) = self.tx_queue.pop_front() else {
                break;
            };
            // The body message piggybacks the ack; any deferred ZLB is
            // redundant now.
            pending.msg.set_nr(self.nr);
            self.ack_deadline = None;
            self.transmit(&pending.msg)?;
            self.window.on_send();
            if self.retry_deadline.is_none() {
                self.retry_deadline = Some(Instant::now() + self.config.retry_timeout);
            }
            self.ack_queue.push_back(pending);
            self.bump_hello();
        }
        Ok(())
    }

    fn transmit(&mut self, msg: &ControlMessage) -> std::result::Result<(), ()> {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fatal_protocol(err);
                return Err(());
            }
        };
        debug!(%msg, "tx");
        if let Err(err) = self.cp.send(&bytes) {
            self.fatal(TransportError::Io(err));
            return Err(());
        }
        Ok(())
    }

    fn on_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), ()> {
        let messages = match ControlMessage::parse(bytes, self.config.version) {
            Ok(messages) => messages,
            Err(err @ ProtocolError::UnknownMandatoryAvp { .. }) => {
                // The FSM must answer this with StopCCN/CDN; the
                // transport itself stays up.
                let _ = self.recv_tx.send(Err(Error::Protocol(err)));
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "dropping undecodable datagram");
                return Ok(());
            }
        };

        for mut msg in messages {
            debug!(%msg, "rx");
            self.process_acks(msg.nr())?;

            if msg.is_zlb() {
                continue;
            }

            match seq_compare(msg.ns(), self.nr) {
                std::cmp::Ordering::Equal => {
                    self.nr = seq_increment(self.nr);
                    if self.ack_deadline.is_none() {
                        self.ack_deadline = Some(Instant::now() + self.config.ack_timeout);
                    }
                    if msg.avps().iter().any(|avp| avp.hidden) {
                        if let Err(err) = msg.unhide_avps(&self.config.secret) {
                            let _ = self.recv_tx.send(Err(Error::Protocol(err)));
                            continue;
                        }
                    }
                    if self.recv_tx.send(Ok(msg)).is_err() {
                        return Err(());
                    }
                }
                std::cmp::Ordering::Less => {
                    // Duplicate: the peer missed our ack, resend it now.
                    debug!(ns = msg.ns(), nr = self.nr, "duplicate message");
                    self.send_zlb()?;
                }
                std::cmp::Ordering::Greater => {
                    // Out of order beyond the reorder horizon: drop, but
                    // still tell the peer where we are.
                    debug!(ns = msg.ns(), nr = self.nr, "out-of-window message");
                    if self.ack_deadline.is_none() {
                        self.ack_deadline = Some(Instant::now() + self.config.ack_timeout);
                    }
                }
            }
        }
        Ok(())
    }

    /// Dequeues every in-flight message acknowledged by `nr`.
    fn process_acks(&mut self, nr: u16) -> std::result::Result<(), ()> {
        let mut progressed = false;
        while let Some(head) = self.ack_queue.front() {
            if seq_compare(head.msg.ns(), nr) == std::cmp::Ordering::Less {
                self.ack_queue.pop_front();
                self.window.on_ack();
                progressed = true;
            } else {
                break;
            }
        }
        if progressed {
            if self.ack_queue.is_empty() && self.tx_queue.is_empty() {
                let _ = self.drained_tx.try_send(());
            }
            self.retry_deadline = if self.ack_queue.is_empty() {
                None
            } else {
                Some(Instant::now() + self.config.retry_timeout)
            };
            // Acks may have opened the window.
            self.flush()?;
        }
        Ok(())
    }

    fn on_deadline(&mut self) -> std::result::Result<(), ()> {
        let now = Instant::now();

        if due(self.ack_deadline, now) {
            self.ack_deadline = None;
            self.send_zlb()?;
        }

        if due(self.retry_deadline, now) {
            self.retransmit(now)?;
        }

        if due(self.hello_deadline, now) {
            self.hello_deadline = None;
            if self.tx_queue.is_empty() && self.ack_queue.is_empty() {
                debug!("transport idle, sending HELLO");
                self.enqueue(self.hello_message());
                self.flush()?;
            } else {
                self.bump_hello();
            }
        }
        Ok(())
    }

    fn retransmit(&mut self, now: Instant) -> std::result::Result<(), ()> {
        let Some(head) = self.ack_queue.front_mut() else {
            self.retry_deadline = None;
            return Ok(());
        };
        head.retries += 1;
        if head.retries > self.config.max_retries {
            self.fatal(TransportError::PeerNotResponding);
            return Err(());
        }
        let mut msg = head.msg.clone();
        let retries = head.retries;
        msg.set_nr(self.nr);
        debug!(ns = msg.ns(), retries, "retransmit");
        self.window.on_retransmit();
        self.transmit(&msg)?;
        self.retry_deadline = Some(now + self.config.retry_timeout);
        Ok(())
    }

    fn send_zlb(&mut self) -> std::result::Result<(), ()> {
        let peer = ControlConnId(self.peer_conn_id.load(AtomicOrdering::Relaxed));
        let mut zlb = ControlMessage::zlb(self.config.version, peer);
        zlb.set_ns(self.ns);
        zlb.set_nr(self.nr);
        self.ack_deadline = None;
        self.transmit(&zlb)
    }

    fn hello_message(&self) -> ControlMessage {
        let peer = ControlConnId(self.peer_conn_id.load(AtomicOrdering::Relaxed));
        let avps = vec![l2tp_proto::avp::Avp::message_type(
            l2tp_proto::avp::MessageType::Hello,
        )];
        match self.config.version {
            l2tp_core::types::ProtocolVersion::V2 => {
                ControlMessage::new_v2(peer.0 as u16, 0, avps)
            }
            l2tp_core::types::ProtocolVersion::V3 => ControlMessage::new_v3(peer.0, avps),
        }
    }

    fn bump_hello(&mut self) {
        self.hello_deadline = hello_deadline(&self.config);
    }

    fn fatal(&mut self, err: TransportError) {
        warn!(error = %err, "transport failure");
        let _ = self.recv_tx.send(Err(Error::Transport(err)));
    }

    fn fatal_protocol(&mut self, err: ProtocolError) {
        warn!(error = %err, "transport failure");
        let _ = self.recv_tx.send(Err(Error::Protocol(err)));
    }
}

fn hello_deadline(config: &TransportConfig) -> Option<Instant> {
    if config.hello_timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + config.hello_timeout)
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| d <= now)
}
