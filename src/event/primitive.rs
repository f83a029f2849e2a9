//! Platform synchronization primitive behind a [`WaitableEvent`].
//!
//! [`Platform`] allocates primitives and [`Primitive`] is the
//! signal / timed-wait / release surface an event drives. The default
//! [`CondvarPlatform`] hands out `Mutex` + `Condvar` pairs and can cap
//! the number of primitives alive at once.
//!
//! [`WaitableEvent`]: super::WaitableEvent

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::EventError;

/// A single-use signal slot.
pub trait Primitive: Send + Sync + 'static {
    /// Move to the signaled state.
    ///
    /// Returns `true` only for the call that performed the transition.
    /// Repeat signals and signals after [`release`](Self::release) are
    /// no-ops returning `false`.
    fn signal(&self) -> bool;

    /// Block until signaled or until `timeout` elapses.
    ///
    /// A signal that landed before this call is observed without
    /// blocking. A zero timeout is a non-blocking poll.
    fn wait_timeout(&self, timeout: Duration) -> bool;

    /// Current signaled state, without blocking.
    fn is_signaled(&self) -> bool;

    /// Hand the primitive back to its platform. The owning event calls
    /// this exactly once.
    fn release(&self);
}

/// Allocator for [`Primitive`]s.
pub trait Platform: Send + Sync + 'static {
    type Primitive: Primitive;

    /// Allocate a fresh primitive in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ResourceExhausted`] when no primitive can
    /// be handed out.
    fn allocate(&self) -> Result<Self::Primitive, EventError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsignaled,
    Signaled,
    Released,
}

/// Condition-variable primitive.
///
/// Signal and wait both take the same mutex, so the unlock in
/// [`signal`](Primitive::signal) and the lock in
/// [`wait_timeout`](Primitive::wait_timeout) form a release/acquire pair.
#[derive(Debug)]
pub struct CondvarPrimitive {
    state: Mutex<State>,
    cond: Condvar,
    live: Arc<AtomicUsize>,
}

impl CondvarPrimitive {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State is a plain enum; a panicking holder cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Primitive for CondvarPrimitive {
    fn signal(&self) -> bool {
        let mut state = self.lock();
        if *state != State::Unsignaled {
            return false;
        }
        *state = State::Signaled;
        drop(state);
        self.cond.notify_all();
        true
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        // `None` when the deadline does not fit in an Instant: wait forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            match *state {
                State::Signaled => return true,
                State::Released => return false,
                State::Unsignaled => {}
            }
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    state = match self.cond.wait_timeout(state, remaining) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn is_signaled(&self) -> bool {
        *self.lock() == State::Signaled
    }

    fn release(&self) {
        let mut state = self.lock();
        if *state == State::Released {
            debug_assert!(false, "primitive released twice");
            return;
        }
        *state = State::Released;
        drop(state);
        self.cond.notify_all();
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Hands out [`CondvarPrimitive`]s, optionally bounded.
///
/// Clones share the same live counter and limit.
#[derive(Debug, Clone, Default)]
pub struct CondvarPlatform {
    limit: Option<usize>,
    live: Arc<AtomicUsize>,
}

impl CondvarPlatform {
    /// Unbounded platform.
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform that refuses to allocate past `limit` live primitives.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of primitives allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl Platform for CondvarPlatform {
    type Primitive = CondvarPrimitive;

    fn allocate(&self) -> Result<CondvarPrimitive, EventError> {
        match self.limit {
            Some(limit) => {
                self.live
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                        (live < limit).then_some(live + 1)
                    })
                    .map_err(|_| EventError::ResourceExhausted { limit })?;
            }
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
            }
        }

        Ok(CondvarPrimitive {
            state: Mutex::new(State::Unsignaled),
            cond: Condvar::new(),
            live: Arc::clone(&self.live),
        })
    }
}
