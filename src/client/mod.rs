//! CLI client for daemon operations.
//!
//! Each invocation connects, performs its requests, prints the result
//! and exits. `await` is the waiter side (create + wait on one
//! connection); `notify` is the signaler side.

mod daemon_client;
mod format;

use std::path::{Path, PathBuf};

use crate::cli::ClientAction;
pub use daemon_client::DaemonClient;

/// Exit code for an `await` that timed out.
pub const EXIT_TIMED_OUT: i32 = 2;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon: {0}")]
    Daemon(String),
    #[error("{op} rejected: {reason}")]
    Rejected { op: &'static str, reason: String },
    #[error("$XDG_RUNTIME_DIR is not set and no --socket given")]
    NoRuntimeDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the client command and return the process exit code.
pub async fn run(socket: Option<PathBuf>, action: ClientAction) -> Result<i32, ClientError> {
    let socket_path = resolve_socket_path(socket)?;

    match action {
        ClientAction::Await { timeout_ms } => {
            let signaled = await_signal(&socket_path, timeout_ms, format::print_handle).await?;
            format::print_wait_result(signaled);
            return Ok(if signaled { 0 } else { EXIT_TIMED_OUT });
        }
        ClientAction::Notify { handle } => {
            let mut daemon = DaemonClient::connect(&socket_path).await?;
            let delivered = daemon.notify(handle).await?;
            format::print_notify(handle, delivered);
        }
        ClientAction::Destroy { handle } => {
            let mut daemon = DaemonClient::connect(&socket_path).await?;
            daemon.destroy(handle).await?;
            format::print_destroy(handle);
        }
        ClientAction::Stats => {
            let mut daemon = DaemonClient::connect(&socket_path).await?;
            let stats = daemon.stats().await?;
            format::print_stats(&stats);
        }
    }

    Ok(0)
}

fn resolve_socket_path(socket: Option<PathBuf>) -> Result<PathBuf, ClientError> {
    socket
        .or_else(crate::ipc::default_socket_path)
        .ok_or(ClientError::NoRuntimeDir)
}

/// Create an event, wait on it, and report whether it was signaled.
///
/// `on_handle` gets the raw handle before the wait starts, so it can be
/// passed to whoever will signal.
pub async fn await_signal<F>(
    socket_path: &Path,
    timeout_ms: u64,
    on_handle: F,
) -> Result<bool, ClientError>
where
    F: FnOnce(u64) -> std::io::Result<()>,
{
    let mut daemon = DaemonClient::connect(socket_path).await?;
    let handle = daemon.create().await?;
    on_handle(handle)?;
    tracing::debug!(handle, timeout_ms, "waiting");
    daemon.wait(handle, timeout_ms).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::state::{ServerConfig, ServerState};
    use crate::server::{bind_socket, serve};

    async fn start_server(path: &Path) {
        let listener = bind_socket(path).await.unwrap();
        tokio::spawn(serve(
            listener,
            ServerState::new(ServerConfig::default()),
            std::future::pending(),
        ));
    }

    #[test]
    fn explicit_socket_wins() {
        let path = resolve_socket_path(Some("/tmp/x.sock".into())).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.sock"));
    }

    #[tokio::test]
    async fn await_and_notify_between_clients() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("waitd.sock");
        start_server(&sock).await;

        let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();
        let signal_sock = sock.clone();
        let signaler = tokio::spawn(async move {
            let handle = handle_rx.await.unwrap();
            let mut client = DaemonClient::connect(&signal_sock).await.unwrap();
            client.notify(handle).await.unwrap()
        });

        let signaled = await_signal(&sock, 5_000, |h| {
            let _ = handle_tx.send(h);
            Ok(())
        })
        .await
        .unwrap();

        assert!(signaled);
        assert!(signaler.await.unwrap());
    }

    #[tokio::test]
    async fn await_times_out_without_signaler() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("waitd.sock");
        start_server(&sock).await;

        let signaled = await_signal(&sock, 30, |_| Ok(())).await.unwrap();
        assert!(!signaled);
    }

    #[tokio::test]
    async fn rejected_request_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("waitd.sock");
        start_server(&sock).await;

        let mut client = DaemonClient::connect(&sock).await.unwrap();
        let err = client.notify(12345).await.unwrap_err();
        match err {
            ClientError::Rejected { op, reason } => {
                assert_eq!(op, "notify");
                assert_eq!(reason, "unknown_handle");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn destroy_then_stats() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("waitd.sock");
        start_server(&sock).await;

        let mut client = DaemonClient::connect(&sock).await.unwrap();
        let handle = client.create().await.unwrap();
        client.destroy(handle).await.unwrap();

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.live, 0);

        let err = client.wait(handle, 0).await.unwrap_err();
        assert!(err.to_string().contains("use_after_consumed"));
    }

    #[tokio::test]
    async fn destroy_command_aborts_event_held_by_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("waitd.sock");
        start_server(&sock).await;

        let mut owner = DaemonClient::connect(&sock).await.unwrap();
        let handle = owner.create().await.unwrap();

        let code = run(Some(sock.clone()), ClientAction::Destroy { handle })
            .await
            .unwrap();
        assert_eq!(code, 0);

        let err = owner.wait(handle, 0).await.unwrap_err();
        assert!(err.to_string().contains("use_after_consumed"));
        let stats = owner.stats().await.unwrap();
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.live, 0);
    }

    #[tokio::test]
    async fn await_reports_callback_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("waitd.sock");
        start_server(&sock).await;

        let err = await_signal(&sock, 1_000, |_| {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout closed"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonClient::connect(&dir.path().join("absent.sock"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Daemon(_)));
    }
}
