//! One-shot waitable events.
//!
//! [`WaitableEvent`] is the in-process primitive: one waiter, one
//! signaler, exactly one wait. [`HandleTable`] puts events behind
//! generation-checked handles so they can be addressed from outside the
//! process, and [`server`] exposes a table over a Unix socket.

pub mod cli;
pub mod client;
pub mod event;
pub mod ipc;
pub mod probe;
pub mod server;
pub mod table;

pub use event::{EventError, Notifier, WaitableEvent};
pub use table::{Handle, HandleTable, TableError};
