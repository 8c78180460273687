//! The L2TP context: a container for a collection of tunnels and their
//! sessions.
//!
//! The registry is the only significant shared state: tunnels are held
//! by name and by tunnel ID under a reader-writer lock, write-locked for
//! link/unlink and read-locked for lookups.  Identifier allocation and
//! linking happen inside one critical section, so concurrently created
//! tunnels cannot race an ID between check and use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;
use tracing::debug;

use l2tp_core::config::{SessionConfig, TunnelConfig};
use l2tp_core::error::{Error, Result};
use l2tp_core::types::{ControlConnId, EncapType, ProtocolVersion};

use crate::dataplane::{DataPlane, DataPlaneKind};
use crate::event::{Event, EventHandler};
use crate::netlink::NetlinkDataPlane;
use crate::tunnel::{self, alloc_id_with, Tunnel, TunnelInner};

enum Slot {
    /// ID and name reserved while the tunnel is being built.
    Reserved(ControlConnId),
    /// Live tunnel.
    Active(Arc<TunnelInner>),
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Slot>,
    ids: HashMap<u32, String>,
}

impl Registry {
    /// Reserves a name and tunnel ID, allocating the ID when the
    /// configuration left it zero.
    fn reserve(
        &mut self,
        name: &str,
        version: ProtocolVersion,
        desired: ControlConnId,
    ) -> Result<ControlConnId> {
        if self.by_name.contains_key(name) {
            return Err(Error::Validation(format!("already have tunnel {name:?}")));
        }
        let id = if desired.is_unset() {
            let mut rng = rand::rng();
            alloc_id_with(version, |id| self.ids.contains_key(&id), || rng.random())?
        } else {
            if self.ids.contains_key(&desired.0) {
                return Err(Error::Validation(format!(
                    "already have tunnel with TID {desired}"
                )));
            }
            desired
        };
        self.by_name.insert(name.to_string(), Slot::Reserved(id));
        self.ids.insert(id.0, name.to_string());
        Ok(id)
    }

    fn commit(&mut self, name: &str, tunnel: Arc<TunnelInner>) {
        self.by_name.insert(name.to_string(), Slot::Active(tunnel));
    }

    fn release(&mut self, name: &str, id: ControlConnId) {
        self.by_name.remove(name);
        self.ids.remove(&id.0);
    }

    fn snapshot(&self) -> Vec<Arc<TunnelInner>> {
        self.by_name
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(tunnel) => Some(Arc::clone(tunnel)),
                Slot::Reserved(_) => None,
            })
            .collect()
    }
}

/// Context-internal state shared with tunnel threads.
pub(crate) struct ContextInner {
    dp: Box<dyn DataPlane>,
    registry: RwLock<Registry>,
    call_serial: Mutex<u32>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl ContextInner {
    pub(crate) fn dp(&self) -> &dyn DataPlane {
        self.dp.as_ref()
    }

    /// Allocates the next call serial number.  Serials are unique for
    /// the life of the context until the 32-bit counter wraps.
    pub(crate) fn alloc_call_serial(&self) -> u32 {
        let mut serial = self.call_serial.lock().expect("call serial lock");
        *serial = serial.wrapping_add(1);
        *serial
    }

    /// Calls every registered handler with the event.  The handler list
    /// is copied out first so no handler runs under the lock.
    pub(crate) fn dispatch(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .expect("event handler lock")
            .iter()
            .map(Arc::clone)
            .collect();
        for handler in handlers {
            handler.handle_event(&event);
        }
    }

    pub(crate) fn unlink_tunnel(&self, name: &str, id: ControlConnId) {
        let mut registry = self.registry.write().expect("registry lock");
        registry.release(name, id);
        debug!(tunnel = name, tid = id.0, "unlinked tunnel");
    }

    fn find_tunnel(&self, name: &str) -> Option<Arc<TunnelInner>> {
        let registry = self.registry.read().expect("registry lock");
        match registry.by_name.get(name) {
            Some(Slot::Active(tunnel)) => Some(Arc::clone(tunnel)),
            _ => None,
        }
    }
}

/// A container for a collection of L2TP tunnels and their sessions.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a new L2TP context using the given data plane.
    ///
    /// [`DataPlaneKind::LinuxKernel`] connects to the kernel L2TP
    /// subsystem and fails when the modules are missing or permissions
    /// are lacking; [`DataPlaneKind::Null`] performs no kernel calls and
    /// is useful for working with the control protocol without root.
    pub fn new(dataplane: DataPlaneKind) -> Result<Self> {
        let dp: Box<dyn DataPlane> = match dataplane {
            DataPlaneKind::Null => Box::new(crate::dataplane::NullDataPlane),
            DataPlaneKind::LinuxKernel => Box::new(NetlinkDataPlane::dial()?),
        };
        Ok(Context {
            inner: Arc::new(ContextInner {
                dp,
                registry: RwLock::new(Registry::default()),
                call_serial: Mutex::new(rand::rng().random()),
                handlers: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Creates a context around a caller-supplied data plane, for
    /// data-plane implementations beyond the built-in null and Linux
    /// kernel ones.
    pub fn with_data_plane(dp: Box<dyn DataPlane>) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                dp,
                registry: RwLock::new(Registry::default()),
                call_serial: Mutex::new(rand::rng().random()),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Creates a new dynamic tunnel, which runs the full RFC 2661 /
    /// RFC 3931 control protocol for tunnel instantiation and
    /// management.  The name must be unique in the context.
    pub fn new_dynamic_tunnel(&self, name: &str, config: &TunnelConfig) -> Result<Tunnel> {
        let mut config = config.clone();

        if config.host_name.is_empty() {
            config.host_name = os_hostname()?;
        }
        if config.peer.is_empty() {
            return Err(Error::Validation(
                "must specify peer address for dynamic tunnel".to_string(),
            ));
        }
        validate_version_encap(&config)?;
        if config.version == ProtocolVersion::V2 && !config.tunnel_id.fits_v2() {
            return Err(Error::Validation(format!(
                "L2TPv2 connection ID {} out of range",
                config.tunnel_id
            )));
        }
        if !config.peer_tunnel_id.is_unset() {
            return Err(Error::Validation(
                "peer connection ID cannot be specified for dynamic tunnels".to_string(),
            ));
        }

        self.build_tunnel(name, config, tunnel::spawn_dynamic)
    }

    /// Creates a new quiescent tunnel: the control socket opens and
    /// acknowledges (and optionally sends Hellos), but the protocol
    /// proper never runs.  Both tunnel IDs must be specified, and the
    /// data plane comes up on creation.
    pub fn new_quiescent_tunnel(&self, name: &str, config: &TunnelConfig) -> Result<Tunnel> {
        let config = config.clone();

        validate_version_encap(&config)?;
        validate_static_ids(&config)?;
        if config.local.is_empty() {
            return Err(Error::Validation(
                "must specify local address for quiescent tunnel".to_string(),
            ));
        }
        if config.peer.is_empty() {
            return Err(Error::Validation(
                "must specify peer address for quiescent tunnel".to_string(),
            ));
        }

        self.build_tunnel(name, config, tunnel::spawn_quiescent)
    }

    /// Creates a new static (unmanaged) tunnel: no control protocol at
    /// all, the kernel owns tunnel and sessions.  Only L2TPv3 static
    /// tunnels are supported, static L2TPv2 tunnels being of no
    /// practical use.
    pub fn new_static_tunnel(&self, name: &str, config: &TunnelConfig) -> Result<Tunnel> {
        let config = config.clone();

        if config.version != ProtocolVersion::V3 {
            return Err(Error::Validation(
                "static tunnels can be L2TPv3 only".to_string(),
            ));
        }
        validate_static_ids(&config)?;
        if config.local.is_empty() {
            return Err(Error::Validation(
                "must specify local address for static tunnel".to_string(),
            ));
        }
        if config.peer.is_empty() {
            return Err(Error::Validation(
                "must specify peer address for static tunnel".to_string(),
            ));
        }

        self.build_tunnel(name, config, tunnel::spawn_static)
    }

    fn build_tunnel(
        &self,
        name: &str,
        mut config: TunnelConfig,
        spawn: impl FnOnce(&str, &Arc<ContextInner>, TunnelConfig) -> Result<Arc<TunnelInner>>,
    ) -> Result<Tunnel> {
        // Reserve the name and ID first: nothing else can claim them
        // while the sockets and threads are being set up.
        let id = {
            let mut registry = self.inner.registry.write().expect("registry lock");
            registry.reserve(name, config.version, config.tunnel_id)?
        };
        config.tunnel_id = id;

        match spawn(name, &self.inner, config) {
            Ok(inner) => {
                let mut registry = self.inner.registry.write().expect("registry lock");
                registry.commit(name, Arc::clone(&inner));
                Ok(Tunnel { inner })
            }
            Err(err) => {
                let mut registry = self.inner.registry.write().expect("registry lock");
                registry.release(name, id);
                Err(err)
            }
        }
    }

    /// Looks up a tunnel handle by name.
    pub fn find_tunnel(&self, name: &str) -> Option<Tunnel> {
        self.inner.find_tunnel(name).map(|inner| Tunnel { inner })
    }

    /// Adds an event handler.  On return the handler may be called at
    /// any time, from the threads of the tunnels generating events.
    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner
            .handlers
            .write()
            .expect("event handler lock")
            .push(handler);
    }

    /// Removes a previously registered event handler.  Must not be
    /// called from within a handler callback.
    pub fn unregister_event_handler(&self, handler: &Arc<dyn EventHandler>) {
        let mut handlers = self.inner.handlers.write().expect("event handler lock");
        handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
    }

    /// Tears down the context: every tunnel (and with it every session)
    /// is closed, then the data plane is released.
    pub fn close(&self) {
        let tunnels = {
            let registry = self.inner.registry.read().expect("registry lock");
            registry.snapshot()
        };
        for tunnel in tunnels {
            tunnel.close();
        }
        self.inner.dp.close();
    }

    /// Creates a session inside the named tunnel; a convenience wrapper
    /// over [`Tunnel::new_session`].
    pub fn new_session(
        &self,
        tunnel_name: &str,
        session_name: &str,
        config: &SessionConfig,
    ) -> Result<crate::session::Session> {
        let tunnel = self
            .find_tunnel(tunnel_name)
            .ok_or_else(|| Error::Validation(format!("no tunnel {tunnel_name:?}")))?;
        tunnel.new_session(session_name, config)
    }
}

fn validate_version_encap(config: &TunnelConfig) -> Result<()> {
    if config.version != ProtocolVersion::V3 && config.encap == EncapType::Ip {
        return Err(Error::Validation(
            "IP encapsulation only supported for L2TPv3 tunnels".to_string(),
        ));
    }
    Ok(())
}

fn validate_static_ids(config: &TunnelConfig) -> Result<()> {
    match config.version {
        ProtocolVersion::V2 => {
            if config.tunnel_id.is_unset() || !config.tunnel_id.fits_v2() {
                return Err(Error::Validation(format!(
                    "L2TPv2 connection ID {} out of range",
                    config.tunnel_id
                )));
            }
            if config.peer_tunnel_id.is_unset() || !config.peer_tunnel_id.fits_v2() {
                return Err(Error::Validation(format!(
                    "L2TPv2 peer connection ID {} out of range",
                    config.peer_tunnel_id
                )));
            }
        }
        ProtocolVersion::V3 => {
            if config.tunnel_id.is_unset() || config.peer_tunnel_id.is_unset() {
                return Err(Error::Validation(format!(
                    "L2TPv3 tunnel IDs {} and {} must both be > 0",
                    config.tunnel_id, config.peer_tunnel_id
                )));
            }
        }
    }
    Ok(())
}

/// The OS host name, used to populate the Host Name AVP when the
/// configuration leaves it empty.
fn os_hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(Error::Validation(format!(
            "failed to look up host name: {}",
            std::io::Error::last_os_error()
        )));
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn null_context() -> Context {
        Context::new(DataPlaneKind::Null).unwrap()
    }

    fn v2_config(peer: &str) -> TunnelConfig {
        TunnelConfig {
            peer: peer.to_string(),
            version: ProtocolVersion::V2,
            ..TunnelConfig::default()
        }
    }

    #[test]
    fn test_v2_tid_out_of_range_rejected() {
        let ctx = null_context();
        let config = TunnelConfig {
            tunnel_id: ControlConnId(70000),
            ..v2_config("127.0.0.1:19001")
        };
        let err = ctx.new_dynamic_tunnel("t1", &config).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err}");
        // Nothing may be linked after the rejection.
        assert!(ctx.find_tunnel("t1").is_none());
        ctx.close();
    }

    #[test]
    fn test_dynamic_rejects_peer_tid() {
        let ctx = null_context();
        let config = TunnelConfig {
            peer_tunnel_id: ControlConnId(90),
            ..v2_config("127.0.0.1:19003")
        };
        assert!(ctx.new_dynamic_tunnel("t1", &config).is_err());
        ctx.close();
    }

    #[test]
    fn test_ip_encap_needs_v3() {
        let ctx = null_context();
        let config = TunnelConfig {
            encap: EncapType::Ip,
            ..v2_config("127.0.0.1:19005")
        };
        assert!(ctx.new_dynamic_tunnel("t1", &config).is_err());
        ctx.close();
    }

    #[test]
    fn test_static_requires_v3_and_ids() {
        let ctx = null_context();
        let config = TunnelConfig {
            local: "127.0.0.1:19007".to_string(),
            version: ProtocolVersion::V2,
            tunnel_id: ControlConnId(1),
            peer_tunnel_id: ControlConnId(2),
            ..v2_config("127.0.0.1:19008")
        };
        assert!(ctx.new_static_tunnel("t1", &config).is_err());

        let config = TunnelConfig {
            local: "127.0.0.1:19007".to_string(),
            version: ProtocolVersion::V3,
            ..v2_config("127.0.0.1:19008")
        };
        // IDs unset: also rejected.
        assert!(ctx.new_static_tunnel("t1", &config).is_err());
        ctx.close();
    }

    #[test]
    fn test_static_create_lookup_close() {
        let ctx = null_context();
        let config = TunnelConfig {
            local: "127.0.0.1:19009".to_string(),
            peer: "127.0.0.1:19010".to_string(),
            version: ProtocolVersion::V3,
            tunnel_id: ControlConnId(11),
            peer_tunnel_id: ControlConnId(12),
            ..TunnelConfig::default()
        };
        let tunnel = ctx.new_static_tunnel("s1", &config).unwrap();
        assert!(ctx.find_tunnel("s1").is_some());

        // Names collide while the tunnel lives.
        assert!(ctx.new_static_tunnel("s1", &config).is_err());
        // So do IDs, under a different name.
        let mut clashing = config.clone();
        clashing.peer_tunnel_id = ControlConnId(13);
        assert!(ctx.new_static_tunnel("s2", &clashing).is_err());

        tunnel.close();
        // Closed tunnels disappear, and their identifiers recycle.
        assert!(ctx.find_tunnel("s1").is_none());
        let tunnel = ctx.new_static_tunnel("s1", &config).unwrap();
        tunnel.close();
        ctx.close();
    }

    #[test]
    fn test_static_tunnel_events() {
        struct Counter {
            ups: AtomicUsize,
            downs: AtomicUsize,
        }
        impl EventHandler for Counter {
            fn handle_event(&self, event: &Event) {
                match event {
                    Event::TunnelUp { .. } => self.ups.fetch_add(1, Ordering::SeqCst),
                    Event::TunnelDown { .. } => self.downs.fetch_add(1, Ordering::SeqCst),
                    _ => 0,
                };
            }
        }

        let ctx = null_context();
        let counter = Arc::new(Counter {
            ups: AtomicUsize::new(0),
            downs: AtomicUsize::new(0),
        });
        ctx.register_event_handler(counter.clone());

        let config = TunnelConfig {
            local: "127.0.0.1:19011".to_string(),
            peer: "127.0.0.1:19012".to_string(),
            version: ProtocolVersion::V3,
            tunnel_id: ControlConnId(21),
            peer_tunnel_id: ControlConnId(22),
            ..TunnelConfig::default()
        };
        let tunnel = ctx.new_static_tunnel("s1", &config).unwrap();
        assert_eq!(counter.ups.load(Ordering::SeqCst), 1);
        tunnel.close();
        assert_eq!(counter.downs.load(Ordering::SeqCst), 1);

        // Unregistered handlers see nothing further.
        let handler: Arc<dyn EventHandler> = counter.clone();
        ctx.unregister_event_handler(&handler);
        let tunnel = ctx.new_static_tunnel("s2", &config).unwrap();
        tunnel.close();
        assert_eq!(counter.ups.load(Ordering::SeqCst), 1);
        ctx.close();
    }

    #[test]
    fn test_static_sessions() {
        let ctx = null_context();
        let config = TunnelConfig {
            local: "127.0.0.1:19013".to_string(),
            peer: "127.0.0.1:19014".to_string(),
            version: ProtocolVersion::V3,
            tunnel_id: ControlConnId(31),
            peer_tunnel_id: ControlConnId(32),
            ..TunnelConfig::default()
        };
        let tunnel = ctx.new_static_tunnel("s1", &config).unwrap();

        let session_config = SessionConfig {
            session_id: ControlConnId(1),
            peer_session_id: ControlConnId(2),
            ..SessionConfig::default()
        };
        let session = tunnel.new_session("sess1", &session_config).unwrap();
        assert_eq!(session.name(), "sess1");

        // Session names are unique within the tunnel.
        assert!(tunnel.new_session("sess1", &session_config).is_err());
        // Session IDs too.
        let mut clashing = session_config.clone();
        clashing.peer_session_id = ControlConnId(3);
        assert!(tunnel.new_session("sess2", &clashing).is_err());

        session.close();
        // The name is free again.
        let _ = tunnel.new_session("sess1", &session_config).unwrap();
        ctx.close();
    }

    #[test]
    fn test_call_serials_increment() {
        let ctx = null_context();
        let first = ctx.inner.alloc_call_serial();
        let second = ctx.inner.alloc_call_serial();
        assert_eq!(second, first.wrapping_add(1));
        ctx.close();
    }

    #[test]
    fn test_hostname_lookup() {
        // Whatever the host is called, the lookup must produce a
        // non-empty name to put in SCCRQ.
        assert!(!os_hostname().unwrap().is_empty());
    }
}
