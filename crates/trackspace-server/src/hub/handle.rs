//! Entry point for upgraded sockets.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use trackspace_core::{ConnectionId, HandshakeError, HubError};
use trackspace_telemetry::MetricsRecorder;

use super::connection::ConnectionHandle;
use super::dispatcher::Dispatcher;
use super::reader::{run_reader, ReaderExit};
use super::writer::{run_writer, WriterExit, WriterTiming};
use super::{metric, Command, DisconnectCause, HubSettings, Presence};

/// A reserved connection slot. Held for the lifetime of the connection.
#[derive(Debug)]
pub struct ConnectionPermit(#[allow(dead_code)] OwnedSemaphorePermit);

/// Cloneable front door of a running hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    slots: Arc<Semaphore>,
    settings: Arc<HubSettings>,
    metrics: Arc<MetricsRecorder>,
    cancel: CancellationToken,
}

impl HubHandle {
    /// Start the dispatcher. It runs until `cancel` fires.
    pub fn spawn(
        settings: HubSettings,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(settings.queue_capacity);
        let dispatcher = Dispatcher::new(metrics.clone());
        let task = tokio::spawn(dispatcher.run(rx, cancel.clone()));
        let hub = Self {
            commands,
            slots: Arc::new(Semaphore::new(settings.max_connections)),
            settings: Arc::new(settings),
            metrics,
            cancel,
        };
        (hub, task)
    }

    /// Slots still free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    /// Reserve a connection slot before upgrading.
    pub fn try_reserve(&self) -> Result<ConnectionPermit, HandshakeError> {
        if self.is_closed() {
            return Err(HandshakeError::HubClosed);
        }
        self.slots
            .clone()
            .try_acquire_owned()
            .map(ConnectionPermit)
            .map_err(|_| HandshakeError::AtCapacity(self.settings.max_connections))
    }

    /// Adopt an upgraded socket.
    ///
    /// Queues the registration (the dispatcher sends the greeting once the
    /// connection is registered), then starts the writer and the supervised
    /// reader. Returns the new connection's id.
    pub async fn accept<S, R, E>(
        &self,
        permit: ConnectionPermit,
        sink: S,
        stream: R,
        identity: Option<String>,
    ) -> Result<ConnectionId, HandshakeError>
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.settings.send_queue_capacity);
        let handle = ConnectionHandle::new(ConnectionId::new(), identity, tx);
        let id = handle.id().clone();

        self.commands
            .send(Command::Register {
                handle: handle.clone(),
                greeting: self.settings.greeting.clone(),
            })
            .await
            .map_err(|_| HandshakeError::HubClosed)?;

        let span = tracing::info_span!("connection", conn_id = %id);
        let timing = WriterTiming {
            write_timeout: self.settings.write_timeout,
            heartbeat_interval: self.settings.heartbeat_interval,
            heartbeat_timeout: self.settings.heartbeat_timeout,
        };
        let writer = tokio::spawn(run_writer(sink, rx, handle.clone(), timing).instrument(span.clone()));
        let reader = tokio::spawn(
            run_reader(stream, handle.clone(), self.commands.clone()).instrument(span.clone()),
        );
        let _supervisor = tokio::spawn(
            supervise(handle, reader, writer, self.commands.clone(), self.metrics.clone(), permit)
                .instrument(span),
        );

        info!(conn_id = %id, "connection accepted");
        Ok(id)
    }

    /// Connection count and user list, answered by the dispatcher.
    pub async fn presence(&self) -> Result<Presence, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Presence(tx))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Record a refused handshake.
    pub fn record_rejection(&self, err: &HandshakeError) {
        self.metrics
            .counter_inc(metric::HANDSHAKE_REJECTED, &[("kind", err.error_kind())], 1);
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// A hub whose queue nobody drains.
    #[cfg(test)]
    pub(crate) fn stalled(settings: HubSettings) -> (Self, mpsc::Receiver<Command>) {
        let (commands, rx) = mpsc::channel(settings.queue_capacity);
        let hub = Self {
            commands,
            slots: Arc::new(Semaphore::new(settings.max_connections)),
            settings: Arc::new(settings),
            metrics: Arc::new(MetricsRecorder::new()),
            cancel: CancellationToken::new(),
        };
        (hub, rx)
    }
}

/// Wait for the reader to end, however it ends, then tear the connection
/// down and tell the dispatcher. A panicking reader only takes its own
/// connection with it.
async fn supervise(
    handle: ConnectionHandle,
    reader: JoinHandle<ReaderExit>,
    writer: JoinHandle<WriterExit>,
    commands: mpsc::Sender<Command>,
    metrics: Arc<MetricsRecorder>,
    permit: ConnectionPermit,
) {
    let reader_cause = match reader.await {
        Ok(ReaderExit::PeerClosed) => Some(DisconnectCause::PeerClosed),
        Ok(ReaderExit::Failed(e)) => {
            warn!(conn_id = %handle.id(), error = %e, kind = e.error_kind(), "read failed");
            Some(DisconnectCause::ReadError)
        }
        Ok(ReaderExit::Cancelled | ReaderExit::HubClosed) => None,
        Err(join_err) if join_err.is_panic() => {
            error!(conn_id = %handle.id(), "reader task panicked");
            metrics.counter_inc(metric::READER_PANICS, &[], 1);
            Some(DisconnectCause::ReaderPanic)
        }
        Err(_) => None,
    };

    handle.close();
    let writer_cause = match writer.await {
        Ok(WriterExit::Failed(e)) => {
            warn!(conn_id = %handle.id(), error = %e, "write failed");
            DisconnectCause::WriteError
        }
        Ok(WriterExit::HeartbeatTimeout) => DisconnectCause::HeartbeatTimeout,
        Ok(WriterExit::Closed) => DisconnectCause::Removed,
        Err(_) => DisconnectCause::WriteError,
    };
    let cause = reader_cause.unwrap_or(writer_cause);

    let _ = commands
        .send(Command::Disconnect {
            id: handle.id().clone(),
            cause,
        })
        .await;
    drop(permit);
}
