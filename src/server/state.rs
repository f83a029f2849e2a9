//! Daemon state: handle table, ownership, connection tracking.
//!
//! Owned by the server loop. The handle table itself is shared with
//! blocking wait tasks through an `Arc`; everything else here is only
//! touched by the loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::event::CondvarPlatform;
use crate::table::{Handle, HandleTable};

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Daemon limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket path; `$XDG_RUNTIME_DIR/waitd/waitd.sock` when `None`.
    pub socket_path: Option<PathBuf>,
    /// Maximum live events across all connections.
    pub max_events: usize,
    /// Longest timeout a `wait` request may ask for.
    pub max_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_events: 1024,
            max_wait: Duration::from_secs(600),
        }
    }
}

/// Who may wait on or destroy a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owner,
    OtherConnection,
    Unowned,
}

/// Daemon state.
#[derive(Debug)]
pub struct ServerState {
    table: Arc<HandleTable<CondvarPlatform>>,
    config: ServerConfig,
    /// Creating connection of each handle not yet waited or destroyed.
    owners: HashMap<Handle, ConnectionId>,
    /// Latest wait dispatched per connection. A connection has at most
    /// one request in flight, so older entries are finished.
    waits: HashMap<ConnectionId, Handle>,
    /// Connections that completed the handshake.
    connections: HashSet<ConnectionId>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let table = HandleTable::new(CondvarPlatform::with_limit(config.max_events));
        Self {
            table: Arc::new(table),
            config,
            owners: HashMap::new(),
            waits: HashMap::new(),
            connections: HashSet::new(),
        }
    }

    pub fn table(&self) -> &Arc<HandleTable<CondvarPlatform>> {
        &self.table
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn add_connection(&mut self, id: ConnectionId) {
        self.connections.insert(id);
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains(&id)
    }

    pub fn connection_count(&self) -> u32 {
        u32::try_from(self.connections.len()).unwrap_or(u32::MAX)
    }

    pub fn record_owner(&mut self, handle: Handle, id: ConnectionId) {
        self.owners.insert(handle, id);
    }

    pub fn ownership(&self, handle: Handle, id: ConnectionId) -> Ownership {
        match self.owners.get(&handle) {
            Some(owner) if *owner == id => Ownership::Owner,
            Some(_) => Ownership::OtherConnection,
            None => Ownership::Unowned,
        }
    }

    /// Forget ownership once the handle is handed to a wait or destroy.
    pub fn release_owner(&mut self, handle: Handle) {
        self.owners.remove(&handle);
    }

    pub fn record_wait(&mut self, id: ConnectionId, handle: Handle) {
        self.waits.insert(id, handle);
    }

    /// Drop a connection and destroy every event it still owns.
    ///
    /// A wait the connection left behind is woken so its thread and
    /// primitive are freed now rather than at the timeout. Returns the
    /// number of events destroyed.
    pub fn remove_connection(&mut self, id: ConnectionId) -> usize {
        self.connections.remove(&id);

        if let Some(handle) = self.waits.remove(&id) {
            // Err here means the wait already finished and retired the handle.
            if let Ok(true) = self.table.notify(handle) {
                tracing::debug!(?id, %handle, "woke abandoned wait");
            }
        }

        let orphaned: Vec<Handle> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(handle, _)| *handle)
            .collect();

        let mut destroyed = 0;
        for handle in orphaned {
            self.owners.remove(&handle);
            match self.table.destroy(handle) {
                Ok(()) => destroyed += 1,
                Err(e) => tracing::debug!(%handle, error = %e, "orphan already gone"),
            }
        }
        destroyed
    }
}
