//! Per-connection write loop with ping heartbeat.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};
use trackspace_core::HubError;

use super::connection::ConnectionHandle;

/// Timing for one writer.
#[derive(Clone, Copy, Debug)]
pub struct WriterTiming {
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// How a write loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WriterExit {
    /// The connection was closed from either side.
    Closed,
    /// A frame could not be written within the timeout.
    Failed(HubError),
    /// No inbound frame for longer than the heartbeat timeout.
    HeartbeatTimeout,
}

/// Drain `frames` into `sink`, pinging the peer every heartbeat interval.
///
/// Each write is bounded by `write_timeout`. On any exit the connection is
/// closed so its reader stops too.
pub async fn run_writer<S>(
    mut sink: S,
    mut frames: mpsc::Receiver<Utf8Bytes>,
    handle: ConnectionHandle,
    timing: WriterTiming,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = time::interval(timing.heartbeat_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    let exit = loop {
        tokio::select! {
            biased;
            () = handle.closed() => break WriterExit::Closed,
            frame = frames.recv() => {
                let Some(text) = frame else { break WriterExit::Closed };
                if let Err(e) = write(&mut sink, Message::Text(text), timing.write_timeout).await {
                    break WriterExit::Failed(e);
                }
            }
            _ = ping.tick() => {
                let silent = handle.last_seen_elapsed();
                if silent > timing.heartbeat_timeout {
                    warn!(conn_id = %handle.id(), silent_secs = silent.as_secs(), "peer unresponsive, disconnecting");
                    break WriterExit::HeartbeatTimeout;
                }
                if let Err(e) = write(&mut sink, Message::Ping(Default::default()), timing.write_timeout).await {
                    break WriterExit::Failed(e);
                }
                trace!(conn_id = %handle.id(), "sent ping");
            }
        }
    };

    handle.close();
    if !matches!(exit, WriterExit::Failed(_)) {
        // Best effort; the peer may already be gone.
        let _ = time::timeout(timing.write_timeout, sink.send(Message::Close(None))).await;
    }
    debug!(conn_id = %handle.id(), ?exit, "writer stopped");
    exit
}

async fn write<S>(sink: &mut S, message: Message, limit: Duration) -> Result<(), HubError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match time::timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HubError::Write(e.to_string())),
        Err(_) => Err(HubError::Write(format!("timed out after {limit:?}"))),
    }
}
