//! Per-connection task: framed I/O, handshake, command forwarding.
//!
//! Each client connection spawns a tokio task that:
//! 1. Wraps the socket in a length-prefixed MessagePack codec.
//! 2. Reads the first message (must be `Hello`) and forwards it to
//!    the server loop for handshake validation.
//! 3. Forwards each later request to the server loop and writes back
//!    the response. One request is in flight at a time, so a `wait`
//!    holds its connection until the event fires or times out.
//! 4. On disconnect, notifies the server loop for cleanup. A peer that
//!    hangs up mid-request is noticed right away, not after the reply.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Status};

use super::state::ConnectionId;

/// Command sent from a connection task to the server loop.
#[derive(Debug)]
pub struct ServerCommand {
    pub request: Message,
    pub response_tx: oneshot::Sender<Message>,
    pub connection_id: ConnectionId,
}

/// Notification sent when a connection closes.
#[derive(Debug)]
pub struct DisconnectNotice {
    pub connection_id: ConnectionId,
}

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first message must be Hello")]
    NotHello,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("server loop closed")]
    ServerGone,
    #[error("response channel closed")]
    ResponseDropped,
}

/// Spawn a connection handler task.
///
/// The task runs until the client disconnects or a protocol error
/// occurs. On exit, a [`DisconnectNotice`] is sent to the server loop.
pub fn spawn_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    disconnect_tx: mpsc::UnboundedSender<DisconnectNotice>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, conn_id, cmd_tx).await {
            tracing::debug!(?conn_id, error = %e, "connection closed");
        }
        let _ = disconnect_tx.send(DisconnectNotice {
            connection_id: conn_id,
        });
    });
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be Hello --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)??;

    let first_msg = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg @ Message::Hello { .. }) => msg,
        DecodeResult::Ok(_) | DecodeResult::UnknownType(_) => {
            return Err(ConnectionError::NotHello);
        }
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    };

    let response = send_command(&cmd_tx, first_msg, conn_id).await?;
    let rejected = matches!(
        response,
        Message::HelloAck {
            status: Status::Error,
            ..
        }
    );
    framed.send(response).await?;
    if rejected {
        return Ok(());
    }

    // -- Main loop: one request, one response --
    let mut pending: Option<BytesMut> = None;
    loop {
        let raw = match pending.take() {
            Some(raw) => raw,
            None => match framed.next().await {
                Some(frame) => frame?,
                None => break,
            },
        };
        let response = match decode_frame(&raw) {
            DecodeResult::Ok(msg) => {
                let response_rx = submit(&cmd_tx, msg, conn_id)?;
                match await_response(&mut framed, response_rx, &mut pending).await? {
                    Some(response) => response,
                    None => {
                        tracing::debug!(?conn_id, "peer left with a request in flight");
                        break;
                    }
                }
            }
            // Unknown type: answer with the echoed id and keep going.
            DecodeResult::UnknownType(envelope) => {
                tracing::debug!(?conn_id, msg_type = %envelope.msg_type, "unknown message type");
                Message::error(envelope.id, "unknown_type")
            }
            DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
        };
        framed.send(response).await?;
    }
    Ok(())
}

/// Send a command to the server loop and wait for the response.
async fn send_command(
    cmd_tx: &mpsc::UnboundedSender<ServerCommand>,
    request: Message,
    conn_id: ConnectionId,
) -> Result<Message, ConnectionError> {
    submit(cmd_tx, request, conn_id)?
        .await
        .map_err(|_| ConnectionError::ResponseDropped)
}

fn submit(
    cmd_tx: &mpsc::UnboundedSender<ServerCommand>,
    request: Message,
    conn_id: ConnectionId,
) -> Result<oneshot::Receiver<Message>, ConnectionError> {
    let (response_tx, response_rx) = oneshot::channel();
    cmd_tx
        .send(ServerCommand {
            request,
            response_tx,
            connection_id: conn_id,
        })
        .map_err(|_| ConnectionError::ServerGone)?;
    Ok(response_rx)
}

/// Wait for the loop's answer while watching the socket.
///
/// Returns `None` if the peer hung up first. A frame that arrives early
/// is parked in `pending` and served after this response.
async fn await_response(
    framed: &mut Framed<UnixStream, FrameCodec>,
    mut response_rx: oneshot::Receiver<Message>,
    pending: &mut Option<BytesMut>,
) -> Result<Option<Message>, ConnectionError> {
    tokio::select! {
        response = &mut response_rx => {
            return response.map(Some).map_err(|_| ConnectionError::ResponseDropped);
        }
        next = framed.next() => match next {
            Some(Ok(frame)) => *pending = Some(frame),
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        },
    }
    response_rx
        .await
        .map(Some)
        .map_err(|_| ConnectionError::ResponseDropped)
}
