//! Message dispatch and request handling.
//!
//! Each handler takes a mutable reference to [`ServerState`] and
//! returns an [`Outcome`]. Everything except `wait` is answered
//! immediately; a `wait` is handed back to the server loop, which runs
//! it on a dedicated thread through [`finish_wait`].

use std::time::{Duration, Instant};

use crate::event::Platform;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Status, StatsDescriptor};
use crate::table::{Handle, HandleTable};

use super::state::{ConnectionId, Ownership, ServerState};

/// What the server loop should do with a request.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Send this response now.
    Reply(Message),
    /// Block on `handle` off the loop, then reply via [`finish_wait`].
    Wait {
        id: u32,
        handle: Handle,
        timeout: Duration,
        /// When the request reached the loop. The timeout counts from here.
        received: Instant,
    },
}

/// Dispatch a request message to the appropriate handler.
///
/// Enforces:
/// - Hello first (requests from connections without a handshake are
///   refused with `unknown_type`)
/// - Only the creating connection may `wait`; `notify` and `destroy`
///   are accepted from any connection
/// - Server-originated variants → `unknown_type`
pub fn handle_message(
    state: &mut ServerState,
    request: Message,
    connection_id: ConnectionId,
) -> Outcome {
    match request {
        Message::Hello { id, version } => {
            Outcome::Reply(handle_hello(state, id, version, connection_id))
        }
        _ if !state.is_connected(connection_id) => {
            Outcome::Reply(Message::error(request_id(&request), "unknown_type"))
        }
        Message::Create { id } => Outcome::Reply(handle_create(state, id, connection_id)),
        Message::Wait {
            id,
            handle,
            timeout_ms,
        } => handle_wait(state, id, Handle::from_raw(handle), timeout_ms, connection_id),
        Message::Notify { id, handle } => {
            Outcome::Reply(handle_notify(state, id, Handle::from_raw(handle)))
        }
        Message::Destroy { id, handle } => Outcome::Reply(handle_destroy(
            state,
            id,
            Handle::from_raw(handle),
            connection_id,
        )),
        Message::Stats { id } => Outcome::Reply(handle_stats(state, id)),
        Message::HelloAck { id, .. } | Message::Response { id, .. } => {
            Outcome::Reply(Message::error(id, "unknown_type"))
        }
    }
}

/// Run a dispatched wait. Blocks; call off the async workers.
///
/// The wait gets whatever is left of `timeout` since `received`, so
/// time spent queued behind other work is not added on top.
pub fn finish_wait<T: Platform>(
    table: &HandleTable<T>,
    id: u32,
    handle: Handle,
    timeout: Duration,
    received: Instant,
) -> Message {
    let remaining = timeout.saturating_sub(received.elapsed());
    match table.wait_once(handle, remaining) {
        Ok(signaled) => Message::Response {
            id,
            status: Status::Ok,
            error: None,
            handle: None,
            signaled: Some(signaled),
            stats: None,
        },
        Err(e) => Message::error(id, e.reason()),
    }
}

// -- Individual handlers --

fn handle_hello(
    state: &mut ServerState,
    id: u32,
    version: u32,
    connection_id: ConnectionId,
) -> Message {
    // hello.id must be 0, and so is hello_ack.id.
    if id != 0 {
        return hello_ack_error("invalid_hello_id");
    }
    if version != PROTOCOL_VERSION {
        return hello_ack_error("version_mismatch");
    }
    state.add_connection(connection_id);
    tracing::debug!(?connection_id, "handshake ok");
    Message::HelloAck {
        id: 0,
        status: Status::Ok,
        error: None,
    }
}

fn handle_create(state: &mut ServerState, id: u32, connection_id: ConnectionId) -> Message {
    match state.table().create() {
        Ok(handle) => {
            state.record_owner(handle, connection_id);
            Message::Response {
                id,
                status: Status::Ok,
                error: None,
                handle: Some(handle.to_raw()),
                signaled: None,
                stats: None,
            }
        }
        Err(e) => {
            tracing::warn!(?connection_id, error = %e, "create refused");
            Message::error(id, e.reason())
        }
    }
}

fn handle_wait(
    state: &mut ServerState,
    id: u32,
    handle: Handle,
    timeout_ms: u64,
    connection_id: ConnectionId,
) -> Outcome {
    let timeout = Duration::from_millis(timeout_ms);
    if timeout > state.config().max_wait {
        return Outcome::Reply(Message::error(id, "timeout_too_long"));
    }
    if let Err(reason) = check_owner(state, handle, connection_id) {
        return Outcome::Reply(Message::error(id, reason));
    }
    // The wait retires the handle whatever happens.
    state.release_owner(handle);
    state.record_wait(connection_id, handle);
    Outcome::Wait {
        id,
        handle,
        timeout,
        received: Instant::now(),
    }
}

fn handle_notify(state: &mut ServerState, id: u32, handle: Handle) -> Message {
    match state.table().notify(handle) {
        Ok(delivered) => Message::Response {
            id,
            status: Status::Ok,
            error: None,
            handle: None,
            signaled: Some(delivered),
            stats: None,
        },
        Err(e) => Message::error(id, e.reason()),
    }
}

/// Any connection may abort an event nobody is waiting on yet; the
/// table answers `busy` once a wait has started.
fn handle_destroy(
    state: &mut ServerState,
    id: u32,
    handle: Handle,
    connection_id: ConnectionId,
) -> Message {
    match state.table().destroy(handle) {
        Ok(()) => {
            if state.ownership(handle, connection_id) == Ownership::OtherConnection {
                tracing::debug!(?connection_id, %handle, "destroyed on behalf of owner");
            }
            state.release_owner(handle);
            Message::ok(id)
        }
        Err(e) => Message::error(id, e.reason()),
    }
}

fn handle_stats(state: &ServerState, id: u32) -> Message {
    let stats = StatsDescriptor::new(state.table().stats(), state.connection_count());
    Message::Response {
        id,
        status: Status::Ok,
        error: None,
        handle: None,
        signaled: None,
        stats: Some(stats),
    }
}

// -- Helpers --

/// Waiting belongs to the creating connection.
///
/// For handles nobody owns, the table decides between
/// `unknown_handle` and `use_after_consumed`. A live handle without an
/// owner has already been handed to a waiter.
fn check_owner(
    state: &ServerState,
    handle: Handle,
    connection_id: ConnectionId,
) -> Result<(), &'static str> {
    match state.ownership(handle, connection_id) {
        Ownership::Owner => Ok(()),
        Ownership::OtherConnection => Err("not_owner"),
        Ownership::Unowned => match state.table().check(handle) {
            Err(e) => Err(e.reason()),
            Ok(()) => Err("busy"),
        },
    }
}

fn hello_ack_error(reason: &str) -> Message {
    Message::HelloAck {
        id: 0,
        status: Status::Error,
        error: Some(reason.into()),
    }
}

fn request_id(msg: &Message) -> u32 {
    match msg {
        Message::Hello { id, .. }
        | Message::HelloAck { id, .. }
        | Message::Create { id }
        | Message::Wait { id, .. }
        | Message::Notify { id, .. }
        | Message::Destroy { id, .. }
        | Message::Stats { id }
        | Message::Response { id, .. } => *id,
    }
}
