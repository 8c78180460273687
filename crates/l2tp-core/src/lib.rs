#![warn(missing_docs)]

//! l2tp-core: foundational types shared across the l2tp crates.
//!
//! This crate carries the minimal set of definitions every layer needs:
//! - Protocol identifiers and enumerations
//! - Tunnel, session and transport configuration
//! - The error type

/// Tunnel, session and transport configuration descriptors.
pub mod config;
/// Error types and results.
pub mod error;
/// Protocol identifiers and enumerations.
pub mod types;

pub use config::{SessionConfig, TransportConfig, TunnelConfig};
pub use error::{Error, ProtocolError, Result, TransportError};
pub use types::{
    ControlConnId, EncapType, FramingCaps, L2SpecType, ProtocolVersion, PseudowireType,
};
