//! TOML configuration loader.
//!
//! The accepted shape is a table of named tunnels, each optionally
//! containing a table of named sessions:
//!
//! ```toml
//! [tunnel.t1]
//! peer = "127.0.0.1:9000"
//! version = "l2tpv2"
//! encap = "udp"
//!
//! [tunnel.t1.session.s1]
//! pseudowire = "ppp"
//! ```
//!
//! Unrecognised keys fail loading.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use l2tp_core::config::{SessionConfig, TunnelConfig};
use l2tp_core::error::{Error, Result};
use l2tp_core::types::{ControlConnId, EncapType, L2SpecType, ProtocolVersion, PseudowireType};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlRoot {
    tunnel: BTreeMap<String, TomlTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlTunnel {
    local: Option<String>,
    peer: Option<String>,
    encap: Option<TomlEncap>,
    version: Option<TomlVersion>,
    tid: Option<u32>,
    ptid: Option<u32>,
    #[serde(default)]
    session: BTreeMap<String, TomlSession>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlSession {
    sid: Option<u32>,
    psid: Option<u32>,
    pseudowire: Option<TomlPseudowire>,
    seqnum: Option<bool>,
    reorder_timeout: Option<u64>,
    cookie: Option<Vec<u8>>,
    peer_cookie: Option<Vec<u8>>,
    interface_name: Option<String>,
    l2spec_type: Option<TomlL2Spec>,
}

#[derive(Debug, Deserialize)]
enum TomlEncap {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "ip")]
    Ip,
}

#[derive(Debug, Deserialize)]
enum TomlVersion {
    #[serde(rename = "l2tpv2")]
    V2,
    #[serde(rename = "l2tpv3")]
    V3,
}

#[derive(Debug, Deserialize)]
enum TomlPseudowire {
    #[serde(rename = "ppp")]
    Ppp,
    #[serde(rename = "eth")]
    Eth,
}

#[derive(Debug, Deserialize)]
enum TomlL2Spec {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "default")]
    Default,
}

/// A tunnel from the configuration file, with its sessions.
#[derive(Debug, Clone)]
pub struct NamedTunnel {
    /// Tunnel name, from the table key.
    pub name: String,
    /// Tunnel parameters.
    pub config: TunnelConfig,
    /// Sessions to create inside the tunnel, in file order.
    pub sessions: Vec<NamedSession>,
}

/// A session from the configuration file.
#[derive(Debug, Clone)]
pub struct NamedSession {
    /// Session name, from the table key.
    pub name: String,
    /// Session parameters.
    pub config: SessionConfig,
}

/// A loaded configuration: a set of tunnels, each with its sessions.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// The configured tunnels.
    pub tunnels: Vec<NamedTunnel>,
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::Config(format!(
                "failed to read {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_str(&content)
    }

    /// Loads configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Config> {
        let root: TomlRoot = toml::from_str(content)
            .map_err(|err| Error::Config(format!("failed to parse config: {err}")))?;

        let mut tunnels = Vec::with_capacity(root.tunnel.len());
        for (name, tunnel) in root.tunnel {
            tunnels.push(convert_tunnel(name, tunnel)?);
        }
        Ok(Config { tunnels })
    }
}

fn convert_tunnel(name: String, toml: TomlTunnel) -> Result<NamedTunnel> {
    let config = TunnelConfig {
        local: toml.local.unwrap_or_default(),
        peer: toml.peer.unwrap_or_default(),
        encap: match toml.encap {
            Some(TomlEncap::Ip) => EncapType::Ip,
            Some(TomlEncap::Udp) | None => EncapType::Udp,
        },
        version: match toml.version {
            Some(TomlVersion::V3) => ProtocolVersion::V3,
            Some(TomlVersion::V2) | None => ProtocolVersion::V2,
        },
        tunnel_id: ControlConnId(toml.tid.unwrap_or(0)),
        peer_tunnel_id: ControlConnId(toml.ptid.unwrap_or(0)),
        ..TunnelConfig::default()
    };

    let mut sessions = Vec::with_capacity(toml.session.len());
    for (session_name, session) in toml.session {
        sessions.push(convert_session(&name, session_name, session)?);
    }

    Ok(NamedTunnel {
        name,
        config,
        sessions,
    })
}

fn convert_session(tunnel_name: &str, name: String, toml: TomlSession) -> Result<NamedSession> {
    for cookie in [&toml.cookie, &toml.peer_cookie].into_iter().flatten() {
        if !matches!(cookie.len(), 0 | 4 | 8) {
            return Err(Error::Config(format!(
                "tunnel {tunnel_name:?} session {name:?}: cookie must be 0, 4 or 8 bytes, not {}",
                cookie.len()
            )));
        }
    }

    let config = SessionConfig {
        session_id: ControlConnId(toml.sid.unwrap_or(0)),
        peer_session_id: ControlConnId(toml.psid.unwrap_or(0)),
        pseudowire: match toml.pseudowire {
            Some(TomlPseudowire::Eth) => PseudowireType::Eth,
            Some(TomlPseudowire::Ppp) | None => PseudowireType::Ppp,
        },
        seqnum: toml.seqnum.unwrap_or(false),
        reorder_timeout: Duration::from_millis(toml.reorder_timeout.unwrap_or(0)),
        cookie: toml.cookie.unwrap_or_default(),
        peer_cookie: toml.peer_cookie.unwrap_or_default(),
        interface_name: toml.interface_name.unwrap_or_default(),
        l2spec_type: match toml.l2spec_type {
            Some(TomlL2Spec::Default) => L2SpecType::Default,
            Some(TomlL2Spec::None) | None => L2SpecType::None,
        },
    };
    Ok(NamedSession { name, config })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = Config::from_str(
            r#"
            [tunnel.t1]
            local = "127.0.0.1:9000"
            peer = "127.0.0.1:9001"
            version = "l2tpv3"
            encap = "ip"
            tid = 42
            ptid = 90

            [tunnel.t1.session.s1]
            sid = 1
            psid = 2
            pseudowire = "eth"
            seqnum = true
            reorder_timeout = 150
            cookie = [1, 2, 3, 4]
            peer_cookie = [5, 6, 7, 8, 9, 10, 11, 12]
            interface_name = "l2tpeth0"
            l2spec_type = "default"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnels.len(), 1);
        let tunnel = &config.tunnels[0];
        assert_eq!(tunnel.name, "t1");
        assert_eq!(tunnel.config.version, ProtocolVersion::V3);
        assert_eq!(tunnel.config.encap, EncapType::Ip);
        assert_eq!(tunnel.config.tunnel_id, ControlConnId(42));
        assert_eq!(tunnel.config.peer_tunnel_id, ControlConnId(90));

        assert_eq!(tunnel.sessions.len(), 1);
        let session = &tunnel.sessions[0];
        assert_eq!(session.name, "s1");
        assert_eq!(session.config.pseudowire, PseudowireType::Eth);
        assert!(session.config.seqnum);
        assert_eq!(session.config.reorder_timeout, Duration::from_millis(150));
        assert_eq!(session.config.cookie, vec![1, 2, 3, 4]);
        assert_eq!(session.config.peer_cookie.len(), 8);
        assert_eq!(session.config.interface_name, "l2tpeth0");
        assert_eq!(session.config.l2spec_type, L2SpecType::Default);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_str(
            r#"
            [tunnel.t1]
            peer = "127.0.0.1:9001"
            "#,
        )
        .unwrap();
        let tunnel = &config.tunnels[0];
        assert_eq!(tunnel.config.version, ProtocolVersion::V2);
        assert_eq!(tunnel.config.encap, EncapType::Udp);
        assert!(tunnel.config.tunnel_id.is_unset());
        assert!(tunnel.sessions.is_empty());
    }

    #[test]
    fn test_unknown_tunnel_key_rejected() {
        let err = Config::from_str(
            r#"
            [tunnel.t1]
            peer = "127.0.0.1:9001"
            shoes = "laced"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn test_unknown_session_key_rejected() {
        assert!(Config::from_str(
            r#"
            [tunnel.t1]
            peer = "127.0.0.1:9001"

            [tunnel.t1.session.s1]
            q931_cause = 16
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_bad_enum_values_rejected() {
        assert!(Config::from_str(
            r#"
            [tunnel.t1]
            peer = "p"
            version = "l2tpv4"
            "#,
        )
        .is_err());
        assert!(Config::from_str(
            r#"
            [tunnel.t1]
            peer = "p"
            encap = "sctp"
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_bad_cookie_length_rejected() {
        let err = Config::from_str(
            r#"
            [tunnel.t1]
            peer = "127.0.0.1:9001"

            [tunnel.t1.session.s1]
            cookie = [1, 2, 3]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cookie"));
    }

    #[test]
    fn test_cookie_out_of_byte_range_rejected() {
        assert!(Config::from_str(
            r#"
            [tunnel.t1]
            peer = "127.0.0.1:9001"

            [tunnel.t1.session.s1]
            cookie = [1, 2, 3, 500]
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_no_tunnel_table_rejected() {
        assert!(Config::from_str("").is_err());
        assert!(Config::from_str("[not_a_tunnel]\n").is_err());
    }
}
