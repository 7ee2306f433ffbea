//! The chat hub.
//!
//! - [`handle::HubHandle`]: entry point for upgraded sockets, owns the queue sender
//! - [`dispatcher::Dispatcher`]: single task that owns the [`registry::Registry`]
//! - [`broadcast`]: fan-out with pruning, called only by the dispatcher
//! - [`reader`] / [`writer`]: the two tasks bound to each connection
//!
//! Every registry change travels through one bounded FIFO of [`Command`]s.

pub mod broadcast;
pub mod connection;
pub mod dispatcher;
pub mod handle;
pub mod reader;
pub mod registry;
pub mod writer;

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use trackspace_core::{ConnectionId, InboundMessage};

use crate::config::ServerConfig;

pub use connection::ConnectionHandle;
pub use dispatcher::Dispatcher;
pub use handle::{ConnectionPermit, HubHandle};
pub use registry::Registry;

/// Work item for the dispatcher.
#[derive(Debug)]
pub enum Command {
    /// A freshly upgraded connection. `greeting` is sent to it alone.
    Register {
        handle: ConnectionHandle,
        greeting: Option<String>,
    },
    /// A decoded frame from a registered connection.
    Inbound {
        id: ConnectionId,
        message: InboundMessage,
    },
    /// The connection's tasks have ended.
    Disconnect {
        id: ConnectionId,
        cause: DisconnectCause,
    },
    /// Read-only view of the registry.
    Presence(oneshot::Sender<Presence>),
}

/// Registry summary answered through the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Presence {
    pub connections: usize,
    pub connected_user: Vec<String>,
}

/// Why a connection went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Close frame or end of stream.
    PeerClosed,
    ReadError,
    WriteError,
    HeartbeatTimeout,
    ReaderPanic,
    /// Closed by the hub: `serveroffline`, pruning or shutdown.
    Removed,
}

impl DisconnectCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ReaderPanic => "reader_panic",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables the hub needs, lifted out of [`ServerConfig`].
#[derive(Clone, Debug)]
pub struct HubSettings {
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub send_queue_capacity: usize,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub greeting: Option<String>,
}

impl From<&ServerConfig> for HubSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            queue_capacity: config.queue_capacity,
            send_queue_capacity: config.send_queue_capacity,
            write_timeout: config.write_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            greeting: config.greeting_text().map(ToOwned::to_owned),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

pub(crate) mod metric {
    pub const CONNECTIONS_TOTAL: &str = "hub.connections.total";
    pub const CONNECTIONS_ACTIVE: &str = "hub.connections.active";
    pub const DISCONNECTS_TOTAL: &str = "hub.disconnects.total";
    pub const MESSAGES_INBOUND: &str = "hub.messages.inbound";
    pub const BROADCASTS_TOTAL: &str = "hub.broadcasts.total";
    pub const BROADCAST_RECIPIENTS: &str = "hub.broadcast.recipients";
    pub const WRITE_FAILURES_TOTAL: &str = "hub.write_failures.total";
    pub const HANDSHAKE_REJECTED: &str = "hub.handshake.rejected";
    pub const READER_PANICS: &str = "hub.reader.panics";
}
