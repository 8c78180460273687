#![warn(missing_docs)]

//! l2tp-proto: control message framing and protocol state.
//!
//! This crate implements the pure, I/O-free parts of the L2TP control
//! protocol for both RFC 2661 (L2TPv2) and RFC 3931 (L2TPv3):
//! - Attribute-Value-Pair encoding and decoding, including hidden AVPs
//! - Control message headers and framing
//! - Modular sequence number arithmetic
//! - The slow-start/congestion-avoidance transmit window

/// AVP types, values and codec.
pub mod avp;
/// Hidden AVP processing per RFC 2661 section 4.3.
pub mod hidden;
/// Control message framing for both protocol versions.
pub mod message;
/// Modular Ns/Nr sequence arithmetic.
pub mod seq;
/// Slow-start transmit window.
pub mod window;

pub use avp::{Avp, AvpType, AvpValue, MessageType, ResultCode};
pub use message::ControlMessage;
pub use seq::{seq_compare, seq_increment};
pub use window::TxWindow;
