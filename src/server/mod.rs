//! Event daemon: one handle table shared with other processes.
//!
//! The daemon listens on a Unix domain socket. Processes connect,
//! create events, hand the raw handle to whoever will signal, and block
//! in `wait`; signalers connect and send `notify`.
//!
//! Architecture: channel-based actor. A single server loop owns
//! [`state::ServerState`]. Per-connection tasks forward requests via an
//! mpsc channel and get answers on a oneshot. Each `wait` blocks its
//! own thread so the loop keeps serving `notify`. Every such thread
//! holds a live event, so `max_events` bounds the thread count.

mod connection;
pub mod handler;
pub mod state;

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use connection::{DisconnectNotice, ServerCommand};
use handler::Outcome;
use state::{ConnectionId, ServerConfig, ServerState};

/// Daemon startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("$XDG_RUNTIME_DIR is not set and no --socket given")]
    NoRuntimeDir,
    #[error("daemon already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns `ServerError` if no socket path can be resolved, the bind
/// fails, or another daemon is already running on the socket.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let socket_path = match &config.socket_path {
        Some(path) => path.clone(),
        None => crate::ipc::default_socket_path().ok_or(ServerError::NoRuntimeDir)?,
    };
    let listener = bind_socket(&socket_path).await?;

    tracing::info!(
        path = %socket_path.display(),
        max_events = config.max_events,
        max_wait_ms = config.max_wait.as_millis() as u64,
        "daemon listening"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    serve(listener, ServerState::new(config), shutdown).await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, path = %socket_path.display(), "failed to remove socket");
    }

    tracing::info!("daemon stopped");
    Ok(())
}

/// Serve connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: UnixListener, mut state: ServerState, shutdown: F)
where
    F: Future<Output = ()>,
{
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ServerCommand>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<DisconnectNotice>();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => accept_connection(stream, &cmd_tx, &disconnect_tx),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }

            // -- Request from connection task --
            Some(cmd) = cmd_rx.recv() => dispatch(&mut state, cmd),

            // -- Connection disconnected --
            Some(notice) = disconnect_rx.recv() => {
                let conn_id = notice.connection_id;
                let destroyed = state.remove_connection(conn_id);
                tracing::debug!(?conn_id, destroyed, "connection cleaned up");
            }

            () = &mut shutdown => break,
        }
    }
}

/// Accept a new connection and spawn its handler task.
fn accept_connection(
    stream: UnixStream,
    cmd_tx: &mpsc::UnboundedSender<ServerCommand>,
    disconnect_tx: &mpsc::UnboundedSender<DisconnectNotice>,
) {
    let conn_id = ConnectionId::new();
    connection::spawn_connection(stream, conn_id, cmd_tx.clone(), disconnect_tx.clone());
    tracing::debug!(?conn_id, "accepted connection");
}

/// Answer a request, moving blocking waits off the loop.
fn dispatch(state: &mut ServerState, cmd: ServerCommand) {
    match handler::handle_message(state, cmd.request, cmd.connection_id) {
        Outcome::Reply(response) => {
            let _ = cmd.response_tx.send(response);
        }
        Outcome::Wait {
            id,
            handle,
            timeout,
            received,
        } => {
            let table = state.table().clone();
            let conn_id = cmd.connection_id;
            let response_tx = cmd.response_tx;
            // One thread per wait, bounded by max_events.
            let spawned = std::thread::Builder::new()
                .name("waitd-wait".into())
                .spawn(move || {
                    let response = handler::finish_wait(&table, id, handle, timeout, received);
                    if response_tx.send(response).is_err() {
                        tracing::debug!(?conn_id, %handle, "waiter left before wait finished");
                    }
                });
            if let Err(e) = spawned {
                // The reply channel went down with the closure; the
                // connection sees it dropped and closes.
                tracing::error!(?conn_id, %handle, error = %e, "failed to start wait thread");
                if let Err(e) = state.table().destroy(handle) {
                    tracing::debug!(%handle, error = %e, "cleanup after failed wait");
                }
            }
        }
    }
}

// -- Socket setup --

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another daemon
/// is running. If it fails, the socket is stale and is removed.
pub async fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ServerError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(
                |e| ServerError::MkdirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                },
            )?;
        }
    }

    let bind_failed = |e: std::io::Error| ServerError::BindFailed {
        path: path.to_path_buf(),
        source: e,
    };

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(ServerError::AlreadyRunning(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(bind_failed)?;
            UnixListener::bind(path).map_err(bind_failed)
        }
        Err(e) => Err(bind_failed(e)),
    }
}
