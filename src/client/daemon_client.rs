//! Daemon client for the CLI.
//!
//! Connects to the daemon, performs the handshake, and provides one
//! method per request type. Each call is a single request-response
//! cycle on the same connection, so events created here stay owned by
//! this client until it disconnects.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::ipc::codec::LengthPrefixedCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Status, StatsDescriptor};

use super::ClientError;

/// Connected daemon client.
pub struct DaemonClient {
    framed: Framed<UnixStream, LengthPrefixedCodec>,
    next_id: u32,
}

impl DaemonClient {
    /// Connect to the daemon at `socket_path` and perform the handshake.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            ClientError::Daemon(format!("connect {}: {e}", socket_path.display()))
        })?;
        let mut framed = Framed::new(stream, LengthPrefixedCodec::new());

        framed
            .send(Message::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
            })
            .await
            .map_err(|e| ClientError::Daemon(format!("send hello: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::HelloAck {
                status: Status::Ok, ..
            })) => {}
            Some(Ok(Message::HelloAck {
                status: Status::Error,
                error,
                ..
            })) => {
                return Err(ClientError::Daemon(format!(
                    "handshake rejected: {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(ClientError::Daemon(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        }

        Ok(Self {
            framed,
            next_id: 1, // 0 = Hello
        })
    }

    /// Create an event owned by this connection. Returns the raw handle.
    pub async fn create(&mut self) -> Result<u64, ClientError> {
        let id = self.next_id();
        match self.request("create", Message::Create { id }).await? {
            Message::Response {
                handle: Some(handle),
                ..
            } => Ok(handle),
            other => Err(unexpected("create", &other)),
        }
    }

    /// Wait on an event this connection created. `true` if signaled.
    pub async fn wait(&mut self, handle: u64, timeout_ms: u64) -> Result<bool, ClientError> {
        let id = self.next_id();
        let msg = Message::Wait {
            id,
            handle,
            timeout_ms,
        };
        match self.request("wait", msg).await? {
            Message::Response {
                signaled: Some(signaled),
                ..
            } => Ok(signaled),
            other => Err(unexpected("wait", &other)),
        }
    }

    /// Signal an event. `true` if this call delivered the signal.
    pub async fn notify(&mut self, handle: u64) -> Result<bool, ClientError> {
        let id = self.next_id();
        match self.request("notify", Message::Notify { id, handle }).await? {
            Message::Response {
                signaled: Some(delivered),
                ..
            } => Ok(delivered),
            other => Err(unexpected("notify", &other)),
        }
    }

    /// Abort an event that nobody is waiting on yet.
    pub async fn destroy(&mut self, handle: u64) -> Result<(), ClientError> {
        let id = self.next_id();
        self.request("destroy", Message::Destroy { id, handle })
            .await
            .map(|_| ())
    }

    pub async fn stats(&mut self) -> Result<StatsDescriptor, ClientError> {
        let id = self.next_id();
        match self.request("stats", Message::Stats { id }).await? {
            Message::Response {
                stats: Some(stats), ..
            } => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Send one request and return the `Ok` response, or the daemon's
    /// error reason as [`ClientError::Rejected`].
    async fn request(&mut self, op: &'static str, msg: Message) -> Result<Message, ClientError> {
        self.framed
            .send(msg)
            .await
            .map_err(|e| ClientError::Daemon(format!("send {op}: {e}")))?;

        match self.framed.next().await {
            Some(Ok(
                resp @ Message::Response {
                    status: Status::Ok, ..
                },
            )) => Ok(resp),
            Some(Ok(Message::Response {
                status: Status::Error,
                error,
                ..
            })) => Err(ClientError::Rejected {
                op,
                reason: error.unwrap_or_default(),
            }),
            Some(Err(e)) => Err(ClientError::Daemon(format!("receive {op}: {e}"))),
            None => Err(ClientError::Daemon(format!("daemon closed connection during {op}"))),
            Some(Ok(other)) => Err(unexpected(op, &other)),
        }
    }
}

fn unexpected(op: &str, msg: &Message) -> ClientError {
    ClientError::Daemon(format!("unexpected {op} response: {msg:?}"))
}
