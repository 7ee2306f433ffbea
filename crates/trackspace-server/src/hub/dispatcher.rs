//! The single task that owns the registry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use trackspace_core::{Condition, ConnectionId, HubError, InboundMessage, OutboundMessage};
use trackspace_telemetry::MetricsRecorder;

use super::broadcast::{self, BroadcastReport};
use super::connection::ConnectionHandle;
use super::registry::Registry;
use super::{metric, Command, DisconnectCause, Presence};

/// Applies [`Command`]s to the registry one at a time.
pub struct Dispatcher {
    registry: Registry,
    metrics: Arc<MetricsRecorder>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            registry: Registry::new(),
            metrics,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Drain `commands` until cancelled or every sender is gone, then close
    /// whatever is still registered.
    #[instrument(skip_all, name = "dispatcher")]
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("dispatcher cancelled");
                    break;
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            if let Command::Register { handle, .. } = cmd {
                debug!(conn_id = %handle.id(), "closing connection queued at shutdown");
                handle.close();
            }
        }
        self.close_all();
        info!("dispatcher stopped");
    }

    /// Apply one command.
    pub fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { handle, greeting } => self.register(handle, greeting.as_deref()),
            Command::Inbound { id, message } => self.inbound(&id, message),
            Command::Disconnect { id, cause } => {
                let _ = self.disconnect(&id, cause);
            }
            Command::Presence(reply) => {
                let _ = reply.send(Presence {
                    connections: self.registry.len(),
                    connected_user: self.registry.connected_users(),
                });
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle, greeting: Option<&str>) {
        let id = handle.id().clone();
        if handle.is_closed() {
            debug!(conn_id = %id, "connection closed before registration");
            return;
        }
        if !self.registry.insert(handle) {
            warn!(conn_id = %id, "duplicate registration ignored");
            return;
        }
        self.metrics.counter_inc(metric::CONNECTIONS_TOTAL, &[], 1);
        self.metrics
            .gauge_set(metric::CONNECTIONS_ACTIVE, &[], self.registry.len() as f64);
        info!(conn_id = %id, connections = self.registry.len(), "connection registered");

        if let Some(text) = greeting {
            let hello = OutboundMessage::greeting(text, self.registry.connected_users());
            let _ = broadcast::send_to(&mut self.registry, &id, &hello, &self.metrics);
        }
    }

    fn inbound(&mut self, id: &ConnectionId, message: InboundMessage) {
        let label = if message.condition.is_known() {
            message.condition.as_str()
        } else {
            "unknown"
        };
        self.metrics
            .counter_inc(metric::MESSAGES_INBOUND, &[("condition", label)], 1);

        let Some(handle) = self.registry.get(id) else {
            debug!(conn_id = %id, condition = %message.condition, "frame from unregistered connection dropped");
            return;
        };
        let sender = attributed_name(handle, &message.user_name);

        match message.condition {
            Condition::Username => {
                let _ = self.registry.set_name(id, &sender);
                info!(conn_id = %id, user = %sender, "user named");
                let users = self.registry.connected_users();
                let _ = self.broadcast(&OutboundMessage::username(users));
            }
            Condition::SendMessage => {
                debug!(conn_id = %id, user = %sender, "chat message");
                let users = self.registry.connected_users();
                let _ = self.broadcast(&OutboundMessage::chat(&sender, &message.message, users));
            }
            Condition::ServerOffline => {
                let _ = self.disconnect(id, DisconnectCause::Removed);
            }
            Condition::Unknown(raw) => {
                let err = HubError::MalformedMessage(format!("unknown condition '{raw}'"));
                debug!(conn_id = %id, error = %err, kind = err.error_kind(), "frame dropped");
            }
        }
    }

    /// Remove `id` and tell everyone else. Returns `false` without
    /// broadcasting when `id` was already gone.
    fn disconnect(&mut self, id: &ConnectionId, cause: DisconnectCause) -> bool {
        let Some(handle) = self.registry.remove(id) else {
            debug!(conn_id = %id, %cause, "disconnect for unregistered connection ignored");
            return false;
        };
        handle.close();
        self.metrics
            .counter_inc(metric::DISCONNECTS_TOTAL, &[("cause", cause.as_str())], 1);
        self.metrics
            .gauge_set(metric::CONNECTIONS_ACTIVE, &[], self.registry.len() as f64);
        info!(
            conn_id = %id,
            %cause,
            age_secs = handle.age().as_secs(),
            dropped = handle.drop_count(),
            connections = self.registry.len(),
            "connection removed"
        );

        let users = self.registry.connected_users();
        let _ = self.broadcast(&OutboundMessage::server_offline(users));
        true
    }

    fn broadcast(&mut self, message: &OutboundMessage) -> BroadcastReport {
        broadcast::broadcast(&mut self.registry, message, &self.metrics)
    }

    fn close_all(&mut self) {
        let handles = self.registry.drain();
        if handles.is_empty() {
            return;
        }
        info!(connections = handles.len(), "closing remaining connections");
        for handle in handles {
            handle.close();
            self.metrics.counter_inc(
                metric::DISCONNECTS_TOTAL,
                &[("cause", DisconnectCause::Removed.as_str())],
                1,
            );
        }
        self.metrics.gauge_set(metric::CONNECTIONS_ACTIVE, &[], 0.0);
    }
}

/// The name a frame is attributed to: the upstream identity when the
/// connection has one, otherwise whatever the client claimed.
fn attributed_name(handle: &ConnectionHandle, claimed: &str) -> String {
    match handle.identity() {
        Some(identity) => {
            if !claimed.is_empty() && claimed != identity {
                warn!(
                    conn_id = %handle.id(),
                    identity,
                    claimed,
                    "claimed user_name differs from authenticated identity"
                );
            }
            identity.to_owned()
        }
        None => claimed.to_owned(),
    }
}
