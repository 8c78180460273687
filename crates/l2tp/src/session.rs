//! Sessions and the LAC-side session state machine.
//!
//! A session is a child of exactly one tunnel.  Dynamic sessions run a
//! small FSM multiplexed onto the parent tunnel's thread and transport:
//! `idle → wait-reply → established → dead`.  Quiescent and static
//! tunnel sessions have no FSM; their data plane is instantiated
//! directly.

use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use l2tp_core::config::SessionConfig;
use l2tp_core::error::Result;
use l2tp_core::types::{ControlConnId, ProtocolVersion};
use l2tp_proto::avp::{Avp, AvpType, AvpValue, MessageType, Q931Cause, ResultCode};
use l2tp_proto::message::ControlMessage;

use crate::dataplane::SessionDataPlane;
use crate::event::Event;
use crate::tunnel::{TunnelCmd, TunnelEnv, TunnelInner};

/// State of a dynamic session's FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SessionState {
    /// Created, waiting for the parent tunnel to establish.
    #[default]
    Idle,
    /// ICRQ sent, waiting for ICRP.
    WaitReply,
    /// ICCN sent, data plane up.
    Established,
    /// Terminal.
    Dead,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::WaitReply => "wait-reply",
            SessionState::Established => "established",
            SessionState::Dead => "dead",
        }
    }
}

/// Shared session state: the handle and the registry both point here.
pub(crate) struct SessionInner {
    pub(crate) name: String,
    pub(crate) tunnel_name: String,
    pub(crate) config: Mutex<SessionConfig>,
    pub(crate) dp: Mutex<Option<Box<dyn SessionDataPlane>>>,
}

impl SessionInner {
    pub(crate) fn new(name: String, tunnel_name: String, config: SessionConfig) -> Arc<Self> {
        Arc::new(SessionInner {
            name,
            tunnel_name,
            config: Mutex::new(config),
            dp: Mutex::new(None),
        })
    }

    pub(crate) fn config_snapshot(&self) -> SessionConfig {
        self.config.lock().expect("session config lock").clone()
    }

    /// Tears down the data plane, if any, and emits SessionDown.
    pub(crate) fn kill(&self, dispatch: impl FnOnce(Event)) {
        if let Some(dp) = self.dp.lock().expect("session dp lock").take() {
            if let Err(err) = dp.down() {
                warn!(session = %self.name, error = %err, "session data plane teardown failed");
            }
        }
        dispatch(Event::SessionDown {
            tunnel_name: self.tunnel_name.clone(),
            name: self.name.clone(),
            config: self.config_snapshot(),
        });
    }
}

/// How a session handle reaches its parent's control path.
pub(crate) enum SessionCtl {
    /// Dynamic tunnel: commands go to the tunnel thread.
    Fsm(Sender<TunnelCmd>),
    /// Quiescent or static tunnel: operate on the parent directly.
    Direct(Weak<TunnelInner>),
}

/// A handle to an L2TP session.
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
    pub(crate) ctl: SessionCtl,
}

impl Session {
    /// The session's name, unique within its tunnel.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A snapshot of the session configuration, including the peer
    /// session ID once it has been learned.
    pub fn config(&self) -> SessionConfig {
        self.inner.config_snapshot()
    }

    /// Closes the session, releasing its resources.
    ///
    /// For a dynamic session this runs the CDN exchange; for others the
    /// data plane is torn down directly.
    pub fn close(&self) {
        match &self.ctl {
            SessionCtl::Fsm(cmd_tx) => {
                let _ = cmd_tx.send(TunnelCmd::CloseSession(self.inner.name.clone()));
            }
            SessionCtl::Direct(tunnel) => {
                if let Some(tunnel) = tunnel.upgrade() {
                    tunnel.close_session_direct(&self.inner.name);
                }
            }
        }
    }
}

/// The per-session FSM run on the parent tunnel's thread.
pub(crate) struct SessionFsm {
    pub(crate) inner: Arc<SessionInner>,
    state: SessionState,
    serial: u32,
}

impl SessionFsm {
    pub(crate) fn new(inner: Arc<SessionInner>, serial: u32) -> Self {
        SessionFsm {
            inner,
            state: SessionState::Idle,
            serial,
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state == SessionState::Dead
    }

    fn local_id(&self) -> ControlConnId {
        self.inner.config.lock().expect("session config lock").session_id
    }

    fn peer_id(&self) -> ControlConnId {
        self.inner
            .config
            .lock()
            .expect("session config lock")
            .peer_session_id
    }

    /// Kicks off establishment once the parent tunnel is up.
    pub(crate) fn start(&mut self, env: &TunnelEnv<'_>) {
        if self.state != SessionState::Idle {
            return;
        }
        let config = self.inner.config_snapshot();
        let sid = config.session_id;

        let mut avps = vec![
            Avp::message_type(MessageType::Icrq),
            Avp::new(
                AvpType::CallSerialNumber,
                AvpValue::U32(self.serial),
            ),
        ];
        match env.version {
            ProtocolVersion::V2 => {
                avps.insert(
                    1,
                    Avp::new(AvpType::AssignedSessionId, AvpValue::U16(sid.0 as u16)),
                );
            }
            ProtocolVersion::V3 => {
                avps.insert(1, Avp::new(AvpType::LocalSessionId, AvpValue::U32(sid.0)));
                avps.push(Avp::new(
                    AvpType::PseudowireType,
                    AvpValue::U16(config.pseudowire.wire_value()),
                ));
                if !config.cookie.is_empty() {
                    avps.push(Avp::new(
                        AvpType::AssignedCookie,
                        AvpValue::Bytes(config.cookie.clone()),
                    ));
                }
            }
        }

        debug!(session = %self.inner.name, serial = self.serial, "sending ICRQ");
        if self.send(env, 0, avps).is_ok() {
            self.state = SessionState::WaitReply;
        } else {
            self.die(env);
        }
    }

    /// Feeds a session-directed control message to the FSM.
    pub(crate) fn on_message(&mut self, env: &TunnelEnv<'_>, msg: &ControlMessage) {
        let Some(msg_type) = msg.msg_type() else {
            return;
        };
        match (self.state, msg_type) {
            (SessionState::WaitReply, MessageType::Icrp) => self.on_icrp(env, msg),
            (_, MessageType::Cdn) => {
                debug!(session = %self.inner.name, "peer disconnected session");
                self.die(env);
            }
            (state, msg_type) => {
                warn!(
                    session = %self.inner.name,
                    state = state.name(),
                    %msg_type,
                    "ignoring unexpected session message"
                );
            }
        }
    }

    fn on_icrp(&mut self, env: &TunnelEnv<'_>, msg: &ControlMessage) {
        let peer_sid = match env.version {
            ProtocolVersion::V2 => msg
                .find_avp(AvpType::AssignedSessionId)
                .and_then(|avp| avp.as_u32()),
            ProtocolVersion::V3 => msg
                .find_avp(AvpType::LocalSessionId)
                .and_then(|avp| avp.as_u32()),
        };
        let peer_sid = match peer_sid {
            Some(id) if id != 0 => ControlConnId(id),
            _ => {
                warn!(session = %self.inner.name, "ICRP with missing or zero session ID");
                self.send_cdn(env, ResultCode::STOPCCN_GENERAL_ERROR);
                self.die(env);
                return;
            }
        };

        {
            let mut config = self.inner.config.lock().expect("session config lock");
            config.peer_session_id = peer_sid;
        }

        // ICCN confirms the call; the data plane comes up alongside it.
        let config = self.inner.config_snapshot();
        let mut avps = vec![Avp::message_type(MessageType::Iccn)];
        if env.version == ProtocolVersion::V3 {
            avps.push(Avp::new(
                AvpType::LocalSessionId,
                AvpValue::U32(config.session_id.0),
            ));
            avps.push(Avp::new(
                AvpType::RemoteSessionId,
                AvpValue::U32(peer_sid.0),
            ));
            if config.seqnum {
                avps.push(Avp::new(AvpType::DataSequencing, AvpValue::U16(2)));
            }
        }
        if self.send(env, peer_sid.0 as u16, avps).is_err() {
            self.die(env);
            return;
        }

        match env
            .ctx
            .dp()
            .new_session(env.tunnel_id, env.peer_tunnel_id, &config)
        {
            Ok(dp) => {
                *self.inner.dp.lock().expect("session dp lock") = Some(dp);
            }
            Err(err) => {
                warn!(session = %self.inner.name, error = %err, "session data plane failed");
                self.send_cdn(env, ResultCode::STOPCCN_GENERAL_ERROR);
                self.die(env);
                return;
            }
        }

        self.state = SessionState::Established;
        env.ctx.dispatch(Event::SessionUp {
            tunnel_name: self.inner.tunnel_name.clone(),
            name: self.inner.name.clone(),
            config: self.inner.config_snapshot(),
        });
        debug!(session = %self.inner.name, peer_sid = peer_sid.0, "session established");
    }

    /// Administrative close: CDN exchange, then teardown.
    pub(crate) fn close(&mut self, env: &TunnelEnv<'_>) {
        if self.state == SessionState::Dead {
            return;
        }
        self.send_cdn(env, ResultCode::CDN_ADMINISTRATIVE);
        self.die(env);
    }

    /// Kills the session without a CDN, as when the parent tunnel's
    /// StopCCN implicitly terminates it.
    pub(crate) fn kill(&mut self, env: &TunnelEnv<'_>) {
        if self.state == SessionState::Dead {
            return;
        }
        self.die(env);
    }

    fn die(&mut self, env: &TunnelEnv<'_>) {
        self.state = SessionState::Dead;
        env.tunnel.unlink_session(&self.inner.name);
        self.inner.kill(|event| env.ctx.dispatch(event));
    }

    fn send_cdn(&mut self, env: &TunnelEnv<'_>, result: u16) {
        let sid = self.local_id();
        let peer_sid = self.peer_id();
        let mut avps = vec![
            Avp::message_type(MessageType::Cdn),
            Avp::new(
                AvpType::ResultCode,
                AvpValue::ResultCode(ResultCode::new(result)),
            ),
        ];
        match env.version {
            ProtocolVersion::V2 => {
                avps.push(Avp::new(
                    AvpType::AssignedSessionId,
                    AvpValue::U16(sid.0 as u16),
                ));
            }
            ProtocolVersion::V3 => {
                avps.push(Avp::new(AvpType::LocalSessionId, AvpValue::U32(sid.0)));
                if !peer_sid.is_unset() {
                    avps.push(Avp::new(
                        AvpType::RemoteSessionId,
                        AvpValue::U32(peer_sid.0),
                    ));
                }
            }
        }
        avps.push(Avp::new(
            AvpType::Q931CauseCode,
            AvpValue::Q931Cause(Q931Cause::default()),
        ));
        let _ = self.send(env, peer_sid.0 as u16, avps);
    }

    fn send(&self, env: &TunnelEnv<'_>, peer_sid: u16, avps: Vec<Avp>) -> Result<()> {
        let msg = match env.version {
            ProtocolVersion::V2 => {
                ControlMessage::new_v2(env.peer_tunnel_id.0 as u16, peer_sid, avps)
            }
            ProtocolVersion::V3 => ControlMessage::new_v3(env.peer_tunnel_id.0, avps),
        };
        env.xport.send(msg).map_err(|err| {
            warn!(session = %self.inner.name, error = %err, "session send failed");
            err
        })
    }
}
