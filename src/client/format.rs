//! Output formatting for CLI client commands.
//!
//! `await` prints the bare handle on its own line first so a script can
//! read it (`read -r handle`) while the command keeps waiting.

use std::io::{self, Write};

use crate::ipc::protocol::StatsDescriptor;

/// Print a freshly created handle and flush, so a reader sees it
/// before the wait starts.
pub fn print_handle(handle: u64) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{handle}")?;
    stdout.flush()
}

pub fn print_wait_result(signaled: bool) {
    println!("{}", wait_outcome(signaled));
}

pub fn print_notify(handle: u64, delivered: bool) {
    println!("{}", notify_outcome(handle, delivered));
}

pub fn print_destroy(handle: u64) {
    println!("Destroyed {handle}");
}

pub fn print_stats(stats: &StatsDescriptor) {
    for (name, value) in stats_rows(stats) {
        println!("{name:<12} {value:>10}");
    }
}

// `false` covers both an earlier signal and a waiter that has just
// timed out and released the event.
fn notify_outcome(handle: u64, delivered: bool) -> String {
    if delivered {
        format!("Notified {handle}")
    } else {
        format!("Handle {handle} was not signaled by this call")
    }
}

fn wait_outcome(signaled: bool) -> &'static str {
    if signaled { "signaled" } else { "timed out" }
}

fn stats_rows(stats: &StatsDescriptor) -> [(&'static str, u64); 7] {
    [
        ("LIVE", u64::from(stats.live)),
        ("WAITING", u64::from(stats.waiting)),
        ("CREATED", stats.created),
        ("SIGNALED", stats.signaled),
        ("TIMED_OUT", stats.timed_out),
        ("DESTROYED", stats.destroyed),
        ("CONNECTIONS", u64::from(stats.connections)),
    ]
}
