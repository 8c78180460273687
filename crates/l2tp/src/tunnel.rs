//! Tunnels and the LAC-side tunnel state machine.
//!
//! Three tunnel flavours share the registry but differ in control-plane
//! depth:
//!
//! - *Dynamic* tunnels run the full control protocol on a dedicated
//!   thread: `idle → wait-ctl-reply → established → wait-stop-reply →
//!   dead`.
//! - *Quiescent* tunnels open the control socket but suppress the
//!   protocol beyond acknowledgements and Hello keepalives.
//! - *Static* tunnels have no userspace socket at all; the kernel owns
//!   tunnel and sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, unbounded, Receiver, Sender};
use rand::Rng;
use tracing::{debug, info, warn};

use l2tp_core::config::{SessionConfig, TransportConfig, TunnelConfig};
use l2tp_core::error::{Error, Result, TransportError};
use l2tp_core::types::{ControlConnId, EncapType, ProtocolVersion, PseudowireType};
use l2tp_proto::avp::{Avp, AvpType, AvpValue, MessageType, ResultCode};
use l2tp_proto::message::ControlMessage;

use crate::context::ContextInner;
use crate::controlplane::{address_pair, ControlPlane};
use crate::dataplane::TunnelDataPlane;
use crate::event::Event;
use crate::session::{Session, SessionCtl, SessionFsm, SessionInner};
use crate::transport::Transport;

/// State of a dynamic tunnel's FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TunnelState {
    /// Created, SCCRQ not yet sent.
    #[default]
    Idle,
    /// SCCRQ sent, waiting for SCCRP.
    WaitCtlReply,
    /// Control connection up; sessions may establish.
    Established,
    /// StopCCN sent, waiting for its acknowledgement.
    WaitStopReply,
    /// Terminal.
    Dead,
}

impl TunnelState {
    fn name(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::WaitCtlReply => "wait-ctl-reply",
            TunnelState::Established => "established",
            TunnelState::WaitStopReply => "wait-stop-reply",
            TunnelState::Dead => "dead",
        }
    }
}

/// Commands from tunnel and session handles to the tunnel thread.
pub(crate) enum TunnelCmd {
    /// Graceful close: StopCCN exchange, then teardown.
    Close,
    /// A new dynamic session wants establishing.
    StartSession(Arc<SessionInner>),
    /// Close one session by name, with a CDN.
    CloseSession(String),
}

/// Everything a session FSM needs from its surroundings for one step.
pub(crate) struct TunnelEnv<'a> {
    pub(crate) xport: &'a Transport,
    pub(crate) ctx: &'a ContextInner,
    pub(crate) tunnel: &'a TunnelInner,
    pub(crate) version: ProtocolVersion,
    pub(crate) tunnel_id: ControlConnId,
    pub(crate) peer_tunnel_id: ControlConnId,
}

enum TunnelKind {
    Dynamic {
        cmd_tx: Sender<TunnelCmd>,
        thread: Mutex<Option<JoinHandle<()>>>,
    },
    Quiescent {
        cmd_tx: Sender<TunnelCmd>,
        thread: Mutex<Option<JoinHandle<()>>>,
    },
    Static {
        dp: Mutex<Option<Box<dyn TunnelDataPlane>>>,
    },
}

struct SessionRegistry {
    by_name: HashMap<String, Arc<SessionInner>>,
    ids: HashMap<u32, String>,
}

/// Shared tunnel state: the user handle, the registry and the tunnel
/// thread all point here.
pub(crate) struct TunnelInner {
    pub(crate) name: String,
    pub(crate) config: Mutex<TunnelConfig>,
    ctx: Weak<ContextInner>,
    kind: TunnelKind,
    sessions: Mutex<SessionRegistry>,
}

/// A handle to an L2TP tunnel.
pub struct Tunnel {
    pub(crate) inner: Arc<TunnelInner>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Tunnel {
    /// The tunnel's name, unique within its context.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A snapshot of the tunnel configuration, including identifiers
    /// assigned during establishment.
    ///
    /// A dynamic tunnel's peer tunnel ID is unknown (zero) until the
    /// tunnel reaches the established state.
    pub fn config(&self) -> TunnelConfig {
        self.inner.config_snapshot()
    }

    /// Adds a session to the tunnel.  The name must be unique within the
    /// tunnel.
    pub fn new_session(&self, name: &str, config: &SessionConfig) -> Result<Session> {
        TunnelInner::new_session(&self.inner, name, config)
    }

    /// Closes the tunnel, releasing allocated resources.  Any sessions
    /// running inside the tunnel are closed with it.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl TunnelInner {
    pub(crate) fn config_snapshot(&self) -> TunnelConfig {
        self.config.lock().expect("tunnel config lock").clone()
    }

    pub(crate) fn tunnel_id(&self) -> ControlConnId {
        self.config.lock().expect("tunnel config lock").tunnel_id
    }

    pub(crate) fn close(&self) {
        match &self.kind {
            TunnelKind::Dynamic { cmd_tx, thread } | TunnelKind::Quiescent { cmd_tx, thread } => {
                let _ = cmd_tx.send(TunnelCmd::Close);
                if let Some(handle) = thread.lock().expect("tunnel thread lock").take() {
                    let _ = handle.join();
                }
            }
            TunnelKind::Static { dp } => {
                let Some(ctx) = self.ctx.upgrade() else {
                    return;
                };
                self.kill_sessions_direct(&ctx);
                if let Some(dp) = dp.lock().expect("tunnel dp lock").take() {
                    if let Err(err) = dp.down() {
                        warn!(tunnel = %self.name, error = %err, "tunnel data plane teardown failed");
                    }
                    ctx.unlink_tunnel(&self.name, self.tunnel_id());
                    ctx.dispatch(Event::TunnelDown {
                        name: self.name.clone(),
                        config: self.config_snapshot(),
                        cause: None,
                    });
                }
            }
        }
    }

    /// Creates a session according to the tunnel flavour.
    fn new_session(self: &Arc<Self>, name: &str, config: &SessionConfig) -> Result<Session> {
        let ctx = self
            .ctx
            .upgrade()
            .ok_or(Error::Transport(TransportError::Closed))?;
        let tunnel_config = self.config_snapshot();
        let mut session_config = config.clone();

        validate_session_config(&tunnel_config, &session_config, &self.kind)?;

        // Allocate and link atomically so concurrent callers cannot race
        // an ID between check and use.
        let inner = {
            let mut sessions = self.sessions.lock().expect("session registry lock");
            if sessions.by_name.contains_key(name) {
                return Err(Error::Validation(format!("already have session {name:?}")));
            }
            if session_config.session_id.is_unset() {
                session_config.session_id = alloc_id(tunnel_config.version, |id| {
                    sessions.ids.contains_key(&id)
                })?;
            } else if sessions.ids.contains_key(&session_config.session_id.0) {
                return Err(Error::Validation(format!(
                    "already have session with SID {}",
                    session_config.session_id
                )));
            }
            let inner = SessionInner::new(
                name.to_string(),
                self.name.clone(),
                session_config.clone(),
            );
            sessions
                .by_name
                .insert(name.to_string(), Arc::clone(&inner));
            sessions
                .ids
                .insert(session_config.session_id.0, name.to_string());
            inner
        };

        match &self.kind {
            TunnelKind::Dynamic { cmd_tx, .. } => {
                if cmd_tx
                    .send(TunnelCmd::StartSession(Arc::clone(&inner)))
                    .is_err()
                {
                    self.unlink_session(name);
                    return Err(Error::Transport(TransportError::Closed));
                }
                Ok(Session {
                    inner,
                    ctl: SessionCtl::Fsm(cmd_tx.clone()),
                })
            }
            TunnelKind::Quiescent { .. } | TunnelKind::Static { .. } => {
                // No session FSM: bring the data plane up now.
                match ctx.dp().new_session(
                    tunnel_config.tunnel_id,
                    tunnel_config.peer_tunnel_id,
                    &session_config,
                ) {
                    Ok(dp) => {
                        *inner.dp.lock().expect("session dp lock") = Some(dp);
                    }
                    Err(err) => {
                        self.unlink_session(name);
                        return Err(err);
                    }
                }
                ctx.dispatch(Event::SessionUp {
                    tunnel_name: self.name.clone(),
                    name: name.to_string(),
                    config: session_config,
                });
                Ok(Session {
                    inner,
                    ctl: SessionCtl::Direct(Arc::downgrade(self)),
                })
            }
        }
    }

    fn find_session(&self, name: &str) -> Option<Arc<SessionInner>> {
        self.sessions
            .lock()
            .expect("session registry lock")
            .by_name
            .get(name)
            .cloned()
    }

    pub(crate) fn unlink_session(&self, name: &str) {
        let mut sessions = self.sessions.lock().expect("session registry lock");
        if let Some(inner) = sessions.by_name.remove(name) {
            let sid = inner.config_snapshot().session_id;
            sessions.ids.remove(&sid.0);
        }
    }

    /// Tears down a quiescent or static tunnel's session without an FSM.
    pub(crate) fn close_session_direct(&self, name: &str) {
        let Some(inner) = self.find_session(name) else {
            return;
        };
        self.unlink_session(name);
        if let Some(ctx) = self.ctx.upgrade() {
            inner.kill(|event| ctx.dispatch(event));
        }
    }

    /// Kills every session without per-session control messages.
    fn kill_sessions_direct(&self, ctx: &ContextInner) {
        let sessions: Vec<Arc<SessionInner>> = {
            let mut registry = self.sessions.lock().expect("session registry lock");
            registry.ids.clear();
            registry.by_name.drain().map(|(_, inner)| inner).collect()
        };
        for inner in sessions {
            inner.kill(|event| ctx.dispatch(event));
        }
    }
}

/// Generates a random identifier in the version's space, rejecting
/// collisions reported by `in_use`.  Ten failed candidates means the
/// space is effectively exhausted.
pub(crate) fn alloc_id(
    version: ProtocolVersion,
    in_use: impl Fn(u32) -> bool,
) -> Result<ControlConnId> {
    let mut rng = rand::rng();
    alloc_id_with(version, in_use, || rng.random())
}

pub(crate) fn alloc_id_with(
    version: ProtocolVersion,
    in_use: impl Fn(u32) -> bool,
    mut generate: impl FnMut() -> u32,
) -> Result<ControlConnId> {
    for _ in 0..10 {
        let candidate = match version {
            ProtocolVersion::V2 => generate() & 0xffff,
            ProtocolVersion::V3 => generate(),
        };
        if candidate != 0 && !in_use(candidate) {
            return Ok(ControlConnId(candidate));
        }
    }
    Err(Error::Validation("ID space exhausted".to_string()))
}

fn validate_session_config(
    tunnel: &TunnelConfig,
    session: &SessionConfig,
    kind: &TunnelKind,
) -> Result<()> {
    if tunnel.version == ProtocolVersion::V2 {
        if !session.session_id.fits_v2() || !session.peer_session_id.fits_v2() {
            return Err(Error::Validation(format!(
                "L2TPv2 session IDs {} and {} must fit 16 bits",
                session.session_id, session.peer_session_id
            )));
        }
        if session.pseudowire == PseudowireType::Eth {
            return Err(Error::Validation(
                "Ethernet pseudowires require L2TPv3".to_string(),
            ));
        }
        if !session.cookie.is_empty() || !session.peer_cookie.is_empty() {
            return Err(Error::Validation(
                "session cookies require L2TPv3".to_string(),
            ));
        }
    }
    for cookie in [&session.cookie, &session.peer_cookie] {
        if !matches!(cookie.len(), 0 | 4 | 8) {
            return Err(Error::Validation(format!(
                "session cookie must be 0, 4 or 8 bytes, not {}",
                cookie.len()
            )));
        }
    }
    match kind {
        TunnelKind::Dynamic { .. } => {
            if !session.peer_session_id.is_unset() {
                return Err(Error::Validation(
                    "peer session ID cannot be specified for dynamic sessions".to_string(),
                ));
            }
        }
        TunnelKind::Quiescent { .. } | TunnelKind::Static { .. } => {
            if session.session_id.is_unset() || session.peer_session_id.is_unset() {
                return Err(Error::Validation(
                    "session IDs must be fully specified for this tunnel type".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn transport_config(config: &TunnelConfig) -> TransportConfig {
    TransportConfig {
        version: config.version,
        peer_conn_id: config.peer_tunnel_id,
        tx_window_size: config.tx_window_size,
        max_retries: config.max_retries,
        retry_timeout: config.retry_timeout,
        hello_timeout: config.hello_timeout,
        secret: config.secret.clone(),
        ..TransportConfig::default()
    }
}

fn open_control_plane(config: &TunnelConfig) -> Result<(ControlPlane, SocketAddr, SocketAddr)> {
    let (local, peer) = address_pair(&config.local, &config.peer)?;
    let cp = match config.encap {
        EncapType::Udp => ControlPlane::new_udp(local, peer)?,
        EncapType::Ip => {
            ControlPlane::new_ip(local, config.tunnel_id, peer, config.peer_tunnel_id)?
        }
    };
    let local = cp.local_addr();
    Ok((cp, local, peer))
}

/// Builds a dynamic tunnel and starts its FSM thread.
pub(crate) fn spawn_dynamic(
    name: &str,
    ctx: &Arc<ContextInner>,
    config: TunnelConfig,
) -> Result<Arc<TunnelInner>> {
    let (cp, local_addr, peer_addr) = open_control_plane(&config)?;
    let xport = Transport::new(cp, transport_config(&config))?;

    let (cmd_tx, cmd_rx) = unbounded();
    let inner = Arc::new(TunnelInner {
        name: name.to_string(),
        config: Mutex::new(config),
        ctx: Arc::downgrade(ctx),
        kind: TunnelKind::Dynamic {
            cmd_tx,
            thread: Mutex::new(None),
        },
        sessions: Mutex::new(SessionRegistry {
            by_name: HashMap::new(),
            ids: HashMap::new(),
        }),
    });

    let fsm = DynamicTunnel {
        inner: Arc::clone(&inner),
        ctx: Arc::downgrade(ctx),
        xport,
        dp: None,
        state: TunnelState::Idle,
        cmd_rx,
        session_fsms: HashMap::new(),
        establish_deadline: None,
        stop_deadline: None,
        down_cause: None,
        tie_breaker: 0,
        local_addr,
        peer_addr,
    };
    let handle = thread::Builder::new()
        .name(format!("l2tp-tunl-{name}"))
        .spawn(move || fsm.run())
        .map_err(Error::Io)?;

    match &inner.kind {
        TunnelKind::Dynamic { thread, .. } => {
            *thread.lock().expect("tunnel thread lock") = Some(handle);
        }
        _ => unreachable!(),
    }
    Ok(inner)
}

/// Builds a quiescent tunnel: socket and transport for acks and Hellos,
/// data plane up immediately, no further protocol.
pub(crate) fn spawn_quiescent(
    name: &str,
    ctx: &Arc<ContextInner>,
    config: TunnelConfig,
) -> Result<Arc<TunnelInner>> {
    let (cp, local_addr, peer_addr) = open_control_plane(&config)?;
    let fd = cp.raw_fd();
    let xport = Transport::new(cp, transport_config(&config))?;
    let dp = ctx
        .dp()
        .new_tunnel(&config, &local_addr, &peer_addr, Some(fd))?;

    let (cmd_tx, cmd_rx) = unbounded();
    let inner = Arc::new(TunnelInner {
        name: name.to_string(),
        config: Mutex::new(config),
        ctx: Arc::downgrade(ctx),
        kind: TunnelKind::Quiescent {
            cmd_tx,
            thread: Mutex::new(None),
        },
        sessions: Mutex::new(SessionRegistry {
            by_name: HashMap::new(),
            ids: HashMap::new(),
        }),
    });

    let task = QuiescentTunnel {
        inner: Arc::clone(&inner),
        ctx: Arc::downgrade(ctx),
        xport,
        dp: Some(dp),
        cmd_rx,
    };
    let handle = thread::Builder::new()
        .name(format!("l2tp-tunl-{name}"))
        .spawn(move || task.run())
        .map_err(Error::Io)?;
    match &inner.kind {
        TunnelKind::Quiescent { thread, .. } => {
            *thread.lock().expect("tunnel thread lock") = Some(handle);
        }
        _ => unreachable!(),
    }

    ctx.dispatch(Event::TunnelUp {
        name: inner.name.clone(),
        config: inner.config_snapshot(),
        local_addr: Some(local_addr),
        peer_addr: Some(peer_addr),
    });
    Ok(inner)
}

/// Builds a static tunnel: kernel data plane only, no socket.
pub(crate) fn spawn_static(
    name: &str,
    ctx: &Arc<ContextInner>,
    config: TunnelConfig,
) -> Result<Arc<TunnelInner>> {
    let (local_addr, peer_addr) = address_pair(&config.local, &config.peer)?;
    let dp = ctx.dp().new_tunnel(&config, &local_addr, &peer_addr, None)?;

    let inner = Arc::new(TunnelInner {
        name: name.to_string(),
        config: Mutex::new(config),
        ctx: Arc::downgrade(ctx),
        kind: TunnelKind::Static {
            dp: Mutex::new(Some(dp)),
        },
        sessions: Mutex::new(SessionRegistry {
            by_name: HashMap::new(),
            ids: HashMap::new(),
        }),
    });

    ctx.dispatch(Event::TunnelUp {
        name: inner.name.clone(),
        config: inner.config_snapshot(),
        local_addr: Some(local_addr),
        peer_addr: Some(peer_addr),
    });
    Ok(inner)
}

/// The dynamic tunnel FSM, running on its own thread.
struct DynamicTunnel {
    inner: Arc<TunnelInner>,
    ctx: Weak<ContextInner>,
    xport: Transport,
    dp: Option<Box<dyn TunnelDataPlane>>,
    state: TunnelState,
    cmd_rx: Receiver<TunnelCmd>,
    session_fsms: HashMap<String, SessionFsm>,
    establish_deadline: Option<Instant>,
    stop_deadline: Option<Instant>,
    down_cause: Option<String>,
    tie_breaker: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl DynamicTunnel {
    fn run(mut self) {
        let mut msg_rx = self.xport.receiver().clone();
        let mut drained_rx = self.xport.drained().clone();
        self.establish();
        while self.state != TunnelState::Dead {
            let timeout = self.next_timeout();
            crossbeam_channel::select! {
                recv(self.cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => self.on_cmd(cmd),
                    // Every handle dropped without Close: tear down.
                    Err(_) => {
                        self.cmd_rx = never();
                        self.begin_stop(ResultCode::STOPCCN_CLEAR_CONNECTION, None);
                    }
                },
                recv(msg_rx) -> item => match item {
                    Ok(Ok(msg)) => self.on_message(msg),
                    Ok(Err(err)) => self.on_transport_error(err),
                    Err(_) => {
                        msg_rx = never();
                        self.enter_dead(Some("transport closed".to_string()));
                    }
                },
                recv(drained_rx) -> item => match item {
                    Ok(()) => {
                        if self.state == TunnelState::WaitStopReply {
                            debug!(tunnel = %self.inner.name, "StopCCN acknowledged");
                            let __cause = self.down_cause.take();
                            self.enter_dead(__cause);
                        }
                    }
                    Err(_) => drained_rx = never(),
                },
                recv(after(timeout)) -> _ => self.on_deadline(),
            }
        }
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        [self.establish_deadline, self.stop_deadline]
            .iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::from_secs(3600))
    }

    fn config(&self) -> TunnelConfig {
        self.inner.config_snapshot()
    }

    /// idle: send SCCRQ and wait for the reply.
    fn establish(&mut self) {
        let config = self.config();
        let tid = config.tunnel_id;
        self.tie_breaker = rand::rng().random();
        let tie_breaker = self.tie_breaker;

        let mut avps = vec![
            Avp::message_type(MessageType::Sccrq),
            Avp::new(AvpType::ProtocolVersion, AvpValue::U16(0x0100)),
            Avp::new(
                AvpType::HostName,
                AvpValue::String(config.host_name.clone()),
            ),
            Avp::new(
                AvpType::FramingCapabilities,
                AvpValue::U32(config.framing_caps.0),
            ),
            Avp::new(
                AvpType::ReceiveWindowSize,
                AvpValue::U16(config.tx_window_size),
            ),
            Avp::new(AvpType::TieBreaker, AvpValue::U64(tie_breaker)),
        ];
        match config.version {
            ProtocolVersion::V2 => {
                avps.insert(
                    1,
                    Avp::new(AvpType::AssignedTunnelId, AvpValue::U16(tid.0 as u16)),
                );
            }
            ProtocolVersion::V3 => {
                avps.insert(1, Avp::new(AvpType::AssignedConnId, AvpValue::U32(tid.0)));
                avps.push(Avp::new(
                    AvpType::PseudowireCaps,
                    AvpValue::U16Array(vec![
                        PseudowireType::Eth.wire_value(),
                        PseudowireType::Ppp.wire_value(),
                    ]),
                ));
            }
        }

        // The peer's ID is unknown, so the header carries zero.
        let msg = match config.version {
            ProtocolVersion::V2 => ControlMessage::new_v2(0, 0, avps),
            ProtocolVersion::V3 => ControlMessage::new_v3(0, avps),
        };
        info!(tunnel = %self.inner.name, tid = tid.0, "establishing");
        if self.xport.send(msg).is_err() {
            self.enter_dead(Some("transport closed".to_string()));
            return;
        }
        self.state = TunnelState::WaitCtlReply;
        // The transport's retransmit budget bounds the SCCRQ itself; this
        // bounds a peer that acks but never replies.
        let budget = config.retry_timeout * (config.max_retries as u32 + 1);
        self.establish_deadline = Some(Instant::now() + budget * 2);
    }

    fn on_cmd(&mut self, cmd: TunnelCmd) {
        match cmd {
            TunnelCmd::Close => match self.state {
                TunnelState::Established | TunnelState::WaitCtlReply => {
                    self.begin_stop(ResultCode::STOPCCN_CLEAR_CONNECTION, None)
                }
                TunnelState::Idle => self.enter_dead(None),
                TunnelState::WaitStopReply | TunnelState::Dead => {}
            },
            TunnelCmd::StartSession(inner) => {
                let serial = match self.ctx.upgrade() {
                    Some(ctx) => ctx.alloc_call_serial(),
                    None => return,
                };
                let name = inner.name.clone();
                let mut fsm = SessionFsm::new(inner, serial);
                if self.state == TunnelState::Established {
                    self.with_env(|env| fsm.start(env));
                }
                if !fsm.is_dead() {
                    self.session_fsms.insert(name, fsm);
                }
            }
            TunnelCmd::CloseSession(name) => {
                if let Some(mut fsm) = self.session_fsms.remove(&name) {
                    self.with_env(|env| fsm.close(env));
                }
            }
        }
    }

    fn on_message(&mut self, msg: ControlMessage) {
        let Some(msg_type) = msg.msg_type() else {
            return;
        };
        match self.state {
            TunnelState::WaitCtlReply => match msg_type {
                MessageType::Sccrp => self.on_sccrp(&msg),
                MessageType::Sccrq => self.on_simultaneous_sccrq(&msg),
                MessageType::StopCcn => {
                    self.on_peer_stopccn(&msg);
                }
                other => {
                    warn!(tunnel = %self.inner.name, state = self.state.name(), %other,
                          "unexpected message, stopping");
                    self.begin_stop(
                        ResultCode::STOPCCN_GENERAL_ERROR,
                        Some(format!("unexpected {other} in {}", self.state.name())),
                    );
                }
            },
            TunnelState::Established => match msg_type {
                MessageType::Hello => {}
                MessageType::StopCcn => self.on_peer_stopccn(&msg),
                MessageType::Icrp | MessageType::Iccn | MessageType::Cdn => {
                    self.dispatch_session(&msg)
                }
                MessageType::Icrq | MessageType::Ocrq => {
                    // LNS duties are out of scope; leave incoming calls
                    // unanswered.
                    warn!(tunnel = %self.inner.name, %msg_type, "ignoring incoming call request");
                }
                other => {
                    warn!(tunnel = %self.inner.name, state = self.state.name(), %other,
                          "unexpected message, stopping");
                    self.begin_stop(
                        ResultCode::STOPCCN_GENERAL_ERROR,
                        Some(format!("unexpected {other} in {}", self.state.name())),
                    );
                }
            },
            TunnelState::WaitStopReply => {
                if msg_type == MessageType::StopCcn {
                    // Both ends stopping at once; that will do as a reply.
                    let __cause = self.down_cause.take();
                    self.enter_dead(__cause);
                }
            }
            TunnelState::Idle | TunnelState::Dead => {}
        }
    }

    fn on_sccrp(&mut self, msg: &ControlMessage) {
        let config = self.config();
        let assigned = match config.version {
            ProtocolVersion::V2 => msg
                .find_avp(AvpType::AssignedTunnelId)
                .and_then(|avp| avp.as_u32()),
            ProtocolVersion::V3 => msg
                .find_avp(AvpType::AssignedConnId)
                .and_then(|avp| avp.as_u32()),
        };
        let peer_tid = match assigned {
            Some(id) if id != 0 => ControlConnId(id),
            _ => {
                warn!(tunnel = %self.inner.name, "SCCRP with missing or zero assigned ID");
                self.begin_stop(
                    ResultCode::STOPCCN_GENERAL_ERROR,
                    Some("invalid peer-assigned tunnel ID".to_string()),
                );
                return;
            }
        };

        {
            let mut config = self.inner.config.lock().expect("tunnel config lock");
            config.peer_tunnel_id = peer_tid;
        }
        self.xport.set_peer_conn_id(peer_tid);

        // Bring the data plane up before confirming the connection.
        let config = self.config();
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => {
                self.enter_dead(Some("context closed".to_string()));
                return;
            }
        };
        match ctx.dp().new_tunnel(
            &config,
            &self.local_addr,
            &self.peer_addr,
            Some(self.xport.raw_fd()),
        ) {
            Ok(dp) => self.dp = Some(dp),
            Err(err) => {
                warn!(tunnel = %self.inner.name, error = %err, "tunnel data plane failed");
                self.begin_stop(ResultCode::STOPCCN_GENERAL_ERROR, Some(err.to_string()));
                return;
            }
        }

        let scccn = match config.version {
            ProtocolVersion::V2 => ControlMessage::new_v2(
                peer_tid.0 as u16,
                0,
                vec![Avp::message_type(MessageType::Scccn)],
            ),
            ProtocolVersion::V3 => ControlMessage::new_v3(
                peer_tid.0,
                vec![Avp::message_type(MessageType::Scccn)],
            ),
        };
        if self.xport.send(scccn).is_err() {
            self.enter_dead(Some("transport closed".to_string()));
            return;
        }

        self.state = TunnelState::Established;
        self.establish_deadline = None;
        info!(tunnel = %self.inner.name, peer_tid = peer_tid.0, "established");
        ctx.dispatch(Event::TunnelUp {
            name: self.inner.name.clone(),
            config,
            local_addr: Some(self.local_addr),
            peer_addr: Some(self.peer_addr),
        });

        // Sessions created while we were establishing can go ahead now.
        let names: Vec<String> = self.session_fsms.keys().cloned().collect();
        for name in names {
            if let Some(mut fsm) = self.session_fsms.remove(&name) {
                self.with_env(|env| fsm.start(env));
                if !fsm.is_dead() {
                    self.session_fsms.insert(name, fsm);
                }
            }
        }
    }

    /// Both ends sent SCCRQ at once.  The Tie Breaker AVP settles it:
    /// the lower value wins and keeps its connection attempt.
    fn on_simultaneous_sccrq(&mut self, msg: &ControlMessage) {
        let theirs = msg
            .find_avp(AvpType::TieBreaker)
            .and_then(|avp| match avp.value {
                AvpValue::U64(v) => Some(v),
                _ => None,
            });
        match theirs {
            Some(theirs) if self.tie_breaker < theirs => {
                // We win: the peer abandons its attempt and answers ours.
                debug!(tunnel = %self.inner.name, "won SCCRQ tie break, ignoring peer request");
            }
            Some(_) => {
                // The losing side would have to answer as an LNS, which
                // is out of scope, so concede the connection entirely.
                warn!(tunnel = %self.inner.name, "lost SCCRQ tie break, stopping");
                self.begin_stop(
                    ResultCode::STOPCCN_CHANNEL_EXISTS,
                    Some("simultaneous SCCRQ".to_string()),
                );
            }
            None => {
                debug!(tunnel = %self.inner.name, "peer SCCRQ without tie breaker, ignoring");
            }
        }
    }

    fn on_peer_stopccn(&mut self, msg: &ControlMessage) {
        let cause = msg
            .find_avp(AvpType::ResultCode)
            .and_then(|avp| match &avp.value {
                AvpValue::ResultCode(rc) => Some(format!(
                    "peer StopCCN: result {}{}",
                    rc.result,
                    if rc.message.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", rc.message)
                    }
                )),
                _ => None,
            })
            .unwrap_or_else(|| "peer StopCCN".to_string());
        info!(tunnel = %self.inner.name, cause, "peer stopped tunnel");
        // The transport flushes the pending acknowledgement of the
        // StopCCN as it shuts down.
        self.enter_dead(Some(cause));
    }

    fn on_transport_error(&mut self, err: Error) {
        match err {
            Error::Protocol(perr) => {
                warn!(tunnel = %self.inner.name, error = %perr, "protocol failure, stopping");
                self.begin_stop(ResultCode::STOPCCN_GENERAL_ERROR, Some(perr.to_string()));
            }
            err => {
                warn!(tunnel = %self.inner.name, error = %err, "transport failure");
                self.enter_dead(Some(err.to_string()));
            }
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        if self
            .establish_deadline
            .is_some_and(|deadline| deadline <= now)
        {
            self.establish_deadline = None;
            if self.state == TunnelState::WaitCtlReply {
                self.enter_dead(Some("peer not responding".to_string()));
            }
        }
        if self.stop_deadline.is_some_and(|deadline| deadline <= now) {
            self.stop_deadline = None;
            if self.state == TunnelState::WaitStopReply {
                debug!(tunnel = %self.inner.name, "StopCCN unacknowledged, giving up");
                let __cause = self.down_cause.take();
                self.enter_dead(__cause);
            }
        }
    }

    /// Sends StopCCN and waits for its acknowledgement.  StopCCN
    /// implicitly terminates every session, so they are killed here
    /// without CDNs.
    fn begin_stop(&mut self, result: u16, cause: Option<String>) {
        if matches!(self.state, TunnelState::WaitStopReply | TunnelState::Dead) {
            return;
        }
        self.kill_sessions();
        self.down_cause = cause;

        let config = self.config();
        let avps = vec![
            Avp::message_type(MessageType::StopCcn),
            match config.version {
                ProtocolVersion::V2 => Avp::new(
                    AvpType::AssignedTunnelId,
                    AvpValue::U16(config.tunnel_id.0 as u16),
                ),
                ProtocolVersion::V3 => {
                    Avp::new(AvpType::AssignedConnId, AvpValue::U32(config.tunnel_id.0))
                }
            },
            Avp::new(
                AvpType::ResultCode,
                AvpValue::ResultCode(ResultCode::new(result)),
            ),
        ];
        let msg = match config.version {
            ProtocolVersion::V2 => {
                ControlMessage::new_v2(config.peer_tunnel_id.0 as u16, 0, avps)
            }
            ProtocolVersion::V3 => ControlMessage::new_v3(config.peer_tunnel_id.0, avps),
        };
        info!(tunnel = %self.inner.name, "sending StopCCN");
        if self.xport.send(msg).is_err() {
            let __cause = self.down_cause.take();
            self.enter_dead(__cause);
            return;
        }
        self.state = TunnelState::WaitStopReply;
        self.stop_deadline = Some(Instant::now() + stopccn_timeout(&config));
    }

    /// The terminal state: release everything in reverse acquisition
    /// order and unlink from the context.
    fn enter_dead(&mut self, cause: Option<String>) {
        if self.state == TunnelState::Dead {
            return;
        }
        self.state = TunnelState::Dead;
        self.kill_sessions();

        if let Some(dp) = self.dp.take() {
            if let Err(err) = dp.down() {
                warn!(tunnel = %self.inner.name, error = %err, "tunnel data plane teardown failed");
            }
        }

        if let Some(ctx) = self.ctx.upgrade() {
            ctx.unlink_tunnel(&self.inner.name, self.inner.tunnel_id());
            ctx.dispatch(Event::TunnelDown {
                name: self.inner.name.clone(),
                config: self.config(),
                cause: cause.clone(),
            });
        }
        match cause {
            Some(cause) => info!(tunnel = %self.inner.name, cause, "tunnel down"),
            None => info!(tunnel = %self.inner.name, "tunnel down"),
        }
        self.xport.close();
    }

    fn kill_sessions(&mut self) {
        let mut fsms = std::mem::take(&mut self.session_fsms);
        for fsm in fsms.values_mut() {
            self.with_env(|env| fsm.kill(env));
        }
    }

    fn dispatch_session(&mut self, msg: &ControlMessage) {
        let config = self.config();
        let target = match config.version {
            ProtocolVersion::V2 => msg.session_id() as u32,
            ProtocolVersion::V3 => msg
                .find_avp(AvpType::RemoteSessionId)
                .and_then(|avp| avp.as_u32())
                .unwrap_or(0),
        };
        if target == 0 {
            warn!(tunnel = %self.inner.name, "session message without a target session ID");
            return;
        }
        let name = {
            let sessions = self.inner.sessions.lock().expect("session registry lock");
            sessions.ids.get(&target).cloned()
        };
        let Some(name) = name else {
            warn!(tunnel = %self.inner.name, sid = target, "message for unknown session");
            return;
        };
        if let Some(mut fsm) = self.session_fsms.remove(&name) {
            self.with_env(|env| fsm.on_message(env, msg));
            if !fsm.is_dead() {
                self.session_fsms.insert(name, fsm);
            }
        }
    }

    /// Runs a session FSM step with borrowed surroundings.
    fn with_env(&self, step: impl FnOnce(&TunnelEnv<'_>)) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let config = self.config();
        let env = TunnelEnv {
            xport: &self.xport,
            ctx: &ctx,
            tunnel: &self.inner,
            version: config.version,
            tunnel_id: config.tunnel_id,
            peer_tunnel_id: config.peer_tunnel_id,
        };
        step(&env);
    }
}

/// The quiescent tunnel task: keep the transport acknowledging (and
/// optionally sending Hellos) until closed.
struct QuiescentTunnel {
    inner: Arc<TunnelInner>,
    ctx: Weak<ContextInner>,
    xport: Transport,
    dp: Option<Box<dyn TunnelDataPlane>>,
    cmd_rx: Receiver<TunnelCmd>,
}

impl QuiescentTunnel {
    fn run(mut self) {
        let msg_rx = self.xport.receiver().clone();
        loop {
            crossbeam_channel::select! {
                recv(self.cmd_rx) -> cmd => match cmd {
                    Ok(TunnelCmd::Close) | Err(_) => {
                        self.teardown(None);
                        return;
                    }
                    // Quiescent sessions have no FSM; creation happens on
                    // the caller's thread.
                    Ok(_) => {}
                },
                recv(msg_rx) -> item => match item {
                    Ok(Ok(msg)) => {
                        // Acks flow inside the transport; the body is of
                        // no further interest.
                        debug!(tunnel = %self.inner.name, %msg, "ignoring control message");
                    }
                    Ok(Err(err)) => {
                        self.teardown(Some(err.to_string()));
                        return;
                    }
                    Err(_) => {
                        self.teardown(Some("transport closed".to_string()));
                        return;
                    }
                },
            }
        }
    }

    fn teardown(&mut self, cause: Option<String>) {
        let Some(ctx) = self.ctx.upgrade() else {
            self.xport.close();
            return;
        };
        let sessions: Vec<Arc<SessionInner>> = {
            let mut registry = self.inner.sessions.lock().expect("session registry lock");
            registry.ids.clear();
            registry.by_name.drain().map(|(_, inner)| inner).collect()
        };
        for session in sessions {
            session.kill(|event| ctx.dispatch(event));
        }
        if let Some(dp) = self.dp.take() {
            if let Err(err) = dp.down() {
                warn!(tunnel = %self.inner.name, error = %err, "tunnel data plane teardown failed");
            }
        }
        ctx.unlink_tunnel(&self.inner.name, self.inner.tunnel_id());
        ctx.dispatch(Event::TunnelDown {
            name: self.inner.name.clone(),
            config: self.inner.config_snapshot(),
            cause,
        });
        self.xport.close();
    }
}

fn stopccn_timeout(config: &TunnelConfig) -> Duration {
    if config.stopccn_timeout.is_zero() {
        // RFC 2661 section 5.7 recommends 31 seconds.
        Duration::from_secs(31)
    } else {
        config.stopccn_timeout
    }
}
