//! In-process waiter/signaler run.
//!
//! Creates an event, optionally starts a signaler thread that sleeps
//! and then notifies, and waits on the calling thread.

use std::thread;
use std::time::{Duration, Instant};

use crate::event::{EventError, WaitableEvent};

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// `None` runs without a signaler.
    pub signal_after: Option<Duration>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub signaled: bool,
    pub elapsed: Duration,
}

/// Run one wait cycle.
///
/// # Errors
///
/// Fails only if the event cannot be created.
pub fn run(config: ProbeConfig) -> Result<ProbeReport, EventError> {
    let event = WaitableEvent::create()?;
    let start = Instant::now();

    let signaler = config.signal_after.map(|delay| {
        let notifier = event.notifier();
        thread::spawn(move || {
            thread::sleep(delay);
            notifier.notify()
        })
    });

    let signaled = event.wait_once(config.timeout);
    let elapsed = start.elapsed();

    if let Some(signaler) = signaler {
        match signaler.join() {
            Ok(delivered) => tracing::debug!(delivered, "signaler finished"),
            Err(_) => tracing::warn!("signaler thread panicked"),
        }
    }

    tracing::debug!(signaled, elapsed_ms = elapsed.as_millis() as u64, "probe done");
    Ok(ProbeReport { signaled, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaled_probe_finishes_early() {
        let report = run(ProbeConfig {
            signal_after: Some(Duration::from_millis(10)),
            timeout: Duration::from_millis(1000),
        })
        .unwrap();
        assert!(report.signaled);
        assert!(report.elapsed >= Duration::from_millis(10));
        assert!(report.elapsed < Duration::from_millis(500));
    }

    #[test]
    fn unsignaled_probe_times_out() {
        let report = run(ProbeConfig {
            signal_after: None,
            timeout: Duration::from_millis(50),
        })
        .unwrap();
        assert!(!report.signaled);
        assert!(report.elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn late_signaler_loses_the_race() {
        let report = run(ProbeConfig {
            signal_after: Some(Duration::from_millis(100)),
            timeout: Duration::from_millis(10),
        })
        .unwrap();
        assert!(!report.signaled);
    }
}
