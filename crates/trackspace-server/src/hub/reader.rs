//! Per-connection read loop.

use std::fmt::Display;

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use trackspace_core::{HubError, InboundMessage};

use super::connection::ConnectionHandle;
use super::Command;

/// How a read loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ReaderExit {
    /// Close frame or end of stream.
    PeerClosed,
    /// Transport error or undecodable frame.
    Failed(HubError),
    /// The connection was closed from the hub side.
    Cancelled,
    /// The dispatcher is gone.
    HubClosed,
}

/// Pull frames off `stream` and forward them to the dispatcher until the
/// peer goes away, a frame cannot be read, or the connection is closed.
///
/// Every frame, including pings and pongs, counts as liveness. Pushing into
/// a full queue waits. The registry is never touched from here.
pub async fn run_reader<R, E>(
    mut stream: R,
    handle: ConnectionHandle,
    commands: mpsc::Sender<Command>,
) -> ReaderExit
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            () = handle.closed() => return ReaderExit::Cancelled,
            next = stream.next() => next,
        };

        let frame = match next {
            None => return ReaderExit::PeerClosed,
            Some(Err(e)) => return ReaderExit::Failed(HubError::Read(e.to_string())),
            Some(Ok(frame)) => frame,
        };
        handle.mark_alive();

        let message = match frame {
            Message::Text(text) => InboundMessage::decode(text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => InboundMessage::decode(text),
                Err(_) => Err(HubError::Read(format!("non-UTF8 binary frame ({} bytes)", data.len()))),
            },
            Message::Close(frame) => {
                debug!(conn_id = %handle.id(), ?frame, "peer sent close frame");
                return ReaderExit::PeerClosed;
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!(conn_id = %handle.id(), "control frame");
                continue;
            }
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => return ReaderExit::Failed(e),
        };

        let cmd = Command::Inbound {
            id: handle.id().clone(),
            message,
        };
        tokio::select! {
            biased;
            () = handle.closed() => return ReaderExit::Cancelled,
            sent = commands.send(cmd) => {
                if sent.is_err() {
                    return ReaderExit::HubClosed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use trackspace_core::{Condition, ConnectionId};

    type Frames = fmpsc::UnboundedSender<Result<Message, String>>;

    fn setup(
        queue: usize,
    ) -> (
        Frames,
        fmpsc::UnboundedReceiver<Result<Message, String>>,
        ConnectionHandle,
        mpsc::Sender<Command>,
        mpsc::Receiver<Command>,
    ) {
        let (frames_tx, frames_rx) = fmpsc::unbounded();
        let (out_tx, _out_rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(ConnectionId::from_raw("r1"), None, out_tx);
        let (cmd_tx, cmd_rx) = mpsc::channel(queue);
        (frames_tx, frames_rx, handle, cmd_tx, cmd_rx)
    }

    fn text(json: &str) -> Result<Message, String> {
        Ok(Message::Text(json.into()))
    }

    #[tokio::test]
    async fn forwards_decoded_frames_in_order() {
        let (frames, stream, handle, cmd_tx, mut cmd_rx) = setup(8);
        frames.unbounded_send(text(r#"{"condition":"username","user_name":"alice"}"#)).unwrap();
        frames.unbounded_send(text(r#"{"condition":"sendMessage","message":"hi"}"#)).unwrap();
        drop(frames);

        let exit = run_reader(stream, handle, cmd_tx).await;
        assert_eq!(exit, ReaderExit::PeerClosed);

        let Some(Command::Inbound { id, message }) = cmd_rx.recv().await else {
            panic!("expected inbound");
        };
        assert_eq!(id.as_str(), "r1");
        assert_eq!(message.condition, Condition::Username);
        let Some(Command::Inbound { message, .. }) = cmd_rx.recv().await else {
            panic!("expected inbound");
        };
        assert_eq!(message.message, "hi");
    }

    #[tokio::test]
    async fn close_frame_ends_loop() {
        let (frames, stream, handle, cmd_tx, mut cmd_rx) = setup(8);
        frames.unbounded_send(Ok(Message::Close(None))).unwrap();
        frames.unbounded_send(text(r#"{"condition":"username"}"#)).unwrap();
        assert_eq!(run_reader(stream, handle, cmd_tx).await, ReaderExit::PeerClosed);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_error_is_terminal() {
        let (frames, stream, handle, cmd_tx, _cmd_rx) = setup(8);
        frames.unbounded_send(Err("connection reset".into())).unwrap();
        let exit = run_reader(stream, handle, cmd_tx).await;
        assert_eq!(exit, ReaderExit::Failed(HubError::Read("connection reset".into())));
    }

    #[tokio::test]
    async fn malformed_json_is_terminal() {
        let (frames, stream, handle, cmd_tx, mut cmd_rx) = setup(8);
        frames.unbounded_send(text("{{{")).unwrap();
        let exit = run_reader(stream, handle, cmd_tx).await;
        assert!(matches!(exit, ReaderExit::Failed(HubError::Read(_))));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_utf8_is_accepted() {
        let (frames, stream, handle, cmd_tx, mut cmd_rx) = setup(8);
        frames
            .unbounded_send(Ok(Message::Binary(r#"{"condition":"serveroffline"}"#.as_bytes().to_vec().into())))
            .unwrap();
        frames
            .unbounded_send(Ok(Message::Binary(vec![0xff, 0xfe].into())))
            .unwrap();
        let exit = run_reader(stream, handle, cmd_tx).await;
        assert!(matches!(exit, ReaderExit::Failed(_)));
        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Inbound { .. })));
    }

    #[tokio::test]
    async fn control_frames_are_skipped() {
        let (frames, stream, handle, cmd_tx, mut cmd_rx) = setup(8);
        frames.unbounded_send(Ok(Message::Ping(Vec::new().into()))).unwrap();
        frames.unbounded_send(Ok(Message::Pong(Vec::new().into()))).unwrap();
        drop(frames);
        assert_eq!(run_reader(stream, handle, cmd_tx).await, ReaderExit::PeerClosed);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_from_hub_cancels_reader() {
        let (_frames, stream, handle, cmd_tx, _cmd_rx) = setup(8);
        let closer = handle.clone();
        let task = tokio::spawn(run_reader(stream, handle, cmd_tx));
        closer.close();
        assert_eq!(task.await.unwrap(), ReaderExit::Cancelled);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_until_closed() {
        let (frames, stream, handle, cmd_tx, _cmd_rx) = setup(1);
        for _ in 0..3 {
            frames.unbounded_send(text(r#"{"condition":"sendMessage"}"#)).unwrap();
        }
        let closer = handle.clone();
        let task = tokio::spawn(run_reader(stream, handle, cmd_tx));
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        closer.close();
        assert_eq!(task.await.unwrap(), ReaderExit::Cancelled);
    }

    #[tokio::test]
    async fn dropped_dispatcher_ends_reader() {
        let (frames, stream, handle, cmd_tx, cmd_rx) = setup(8);
        drop(cmd_rx);
        frames.unbounded_send(text(r#"{"condition":"sendMessage"}"#)).unwrap();
        assert_eq!(run_reader(stream, handle, cmd_tx).await, ReaderExit::HubClosed);
    }
}
