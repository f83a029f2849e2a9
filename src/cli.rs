use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "waitd", about = "One-shot waitable events across threads and processes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the event daemon
    Serve {
        /// Socket path [default: $XDG_RUNTIME_DIR/waitd/waitd.sock]
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Maximum number of live events
        #[arg(long, default_value_t = 1024)]
        max_events: usize,

        /// Longest timeout a wait request may ask for, in milliseconds
        #[arg(long, default_value_t = 600_000)]
        max_wait_ms: u64,
    },

    /// Talk to a running daemon
    Client {
        /// Socket path [default: $XDG_RUNTIME_DIR/waitd/waitd.sock]
        #[arg(long)]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: ClientAction,
    },

    /// Run an in-process waiter/signaler pair and report the outcome
    Probe {
        /// Delay before the signaler thread notifies, in milliseconds
        #[arg(long, default_value_t = 10)]
        delay_ms: u64,

        /// Waiter timeout, in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Do not start a signaler; the wait must time out
        #[arg(long)]
        no_signal: bool,
    },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// Create an event, print its handle, and wait for it
    Await {
        /// Wait timeout in milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Signal an event by handle
    Notify { handle: u64 },

    /// Abort an event that nobody is waiting on yet
    Destroy { handle: u64 },

    /// Show daemon counters
    Stats,
}
