//! # trackspace-core
//!
//! Types shared by every part of the chat hub:
//!
//! - [`ids::ConnectionId`]: opaque, identity-comparable handle for one live socket
//! - [`wire`]: the JSON frames exchanged with browser clients
//! - [`errors`]: handshake, read, write and malformed-message failures

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod wire;

pub use errors::{HandshakeError, HubError};
pub use ids::ConnectionId;
pub use wire::{Condition, InboundMessage, OutboundMessage};
