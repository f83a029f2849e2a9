//! Handle table: opaque tokens for events that cross a foreign boundary.
//!
//! A foreign caller never sees a pointer. It gets a [`Handle`], an
//! `(index, generation)` pair packed into a `u64`. The table checks the
//! generation on every lookup, so a token that outlived its event is
//! reported as [`TableError::UseAfterConsumed`] and a made-up token as
//! [`TableError::UnknownHandle`], instead of reaching some other event.
//!
//! Waiting does not hold the table lock: the event moves out to the
//! waiting thread and the slot keeps only the notifier until the wait
//! returns and the slot is retired.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::event::{CondvarPlatform, EventError, Notifier, Platform, Primitive, WaitableEvent};

/// Generation-checked reference to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Pack as `generation << 32 | index`.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack a token received from a foreign caller. Any `u64` is
    /// accepted here; validity is decided by the table.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

/// Handle table errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("unknown handle {0}")]
    UnknownHandle(Handle),
    #[error("handle {0} was already consumed")]
    UseAfterConsumed(Handle),
    #[error("handle {0} already has a waiter")]
    Busy(Handle),
    #[error(transparent)]
    Event(#[from] EventError),
}

impl TableError {
    /// Machine-readable reason for wire responses.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownHandle(_) => "unknown_handle",
            Self::UseAfterConsumed(_) => "use_after_consumed",
            Self::Busy(_) => "busy",
            Self::Event(EventError::ResourceExhausted { .. }) => "resource_exhausted",
        }
    }
}

/// Counters exposed through [`HandleTable::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Events created and not yet retired.
    pub live: u32,
    /// Live events with a blocked waiter.
    pub waiting: u32,
    pub created: u64,
    pub signaled: u64,
    pub timed_out: u64,
    pub destroyed: u64,
}

enum Slot<P: Primitive> {
    Vacant,
    Ready {
        event: WaitableEvent<P>,
        notifier: Notifier<P>,
    },
    Waiting {
        notifier: Notifier<P>,
    },
}

struct Entry<P: Primitive> {
    /// Starts at 1 so that a raw token of 0 is never valid.
    generation: u32,
    slot: Slot<P>,
}

struct Slots<P: Primitive> {
    entries: Vec<Entry<P>>,
    free: Vec<u32>,
    stats: TableStats,
}

impl<P: Primitive> Slots<P> {
    /// Generations are compared numerically. Once a slot's generation
    /// wraps from `u32::MAX` back to 1, tokens from before the wrap
    /// compare as newer and are reported as `UnknownHandle` rather than
    /// `UseAfterConsumed`. They are still rejected.
    fn entry_mut(&mut self, handle: Handle) -> Result<&mut Entry<P>, TableError> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .ok_or(TableError::UnknownHandle(handle))?;

        if handle.generation == 0 || handle.generation > entry.generation {
            return Err(TableError::UnknownHandle(handle));
        }
        if handle.generation < entry.generation {
            return Err(TableError::UseAfterConsumed(handle));
        }
        if matches!(entry.slot, Slot::Vacant) {
            // Current generation of a retired slot: never handed out.
            return Err(TableError::UnknownHandle(handle));
        }
        Ok(entry)
    }

    fn retire(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        entry.slot = Slot::Vacant;
        entry.generation = match entry.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.free.push(index);
        self.stats.live -= 1;
    }
}

/// Table of live events addressed by [`Handle`].
///
/// Explicitly constructed and passed around (typically in an `Arc`);
/// there is no process-wide instance.
pub struct HandleTable<T: Platform = CondvarPlatform> {
    platform: T,
    slots: Mutex<Slots<T::Primitive>>,
}

impl Default for HandleTable<CondvarPlatform> {
    fn default() -> Self {
        Self::new(CondvarPlatform::new())
    }
}

impl<T: Platform> HandleTable<T> {
    pub fn new(platform: T) -> Self {
        Self {
            platform,
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                stats: TableStats::default(),
            }),
        }
    }

    pub fn platform(&self) -> &T {
        &self.platform
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T::Primitive>> {
        // Every mutation leaves the slots consistent before anything
        // that can panic, so a poisoned lock is still usable.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an event and return its handle.
    ///
    /// # Errors
    ///
    /// [`TableError::Event`] with `ResourceExhausted` if the platform
    /// refuses, or if the slot index space is used up.
    pub fn create(&self) -> Result<Handle, TableError> {
        let event = WaitableEvent::create_on(&self.platform)?;
        let notifier = event.notifier();

        let mut guard = self.lock();
        let slots = &mut *guard;
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(slots.entries.len()).map_err(|_| {
                    EventError::ResourceExhausted {
                        limit: u32::MAX as usize,
                    }
                })?;
                slots.entries.push(Entry {
                    generation: 1,
                    slot: Slot::Vacant,
                });
                index
            }
        };

        let entry = &mut slots.entries[index as usize];
        entry.slot = Slot::Ready { event, notifier };
        let handle = Handle {
            index,
            generation: entry.generation,
        };
        slots.stats.created += 1;
        slots.stats.live += 1;

        tracing::debug!(%handle, "event created");
        Ok(handle)
    }

    /// Check that `handle` names a live event.
    pub fn check(&self, handle: Handle) -> Result<(), TableError> {
        let mut slots = self.lock();
        slots.entry_mut(handle)?;
        Ok(())
    }

    /// Block until the event is signaled or `timeout` elapses, then
    /// retire the handle.
    ///
    /// # Errors
    ///
    /// [`TableError::Busy`] if another thread is already waiting on the
    /// handle; lookup errors for stale or unknown handles.
    pub fn wait_once(&self, handle: Handle, timeout: Duration) -> Result<bool, TableError> {
        let event = {
            let mut slots = self.lock();
            let entry = slots.entry_mut(handle)?;
            let event = match std::mem::replace(&mut entry.slot, Slot::Vacant) {
                Slot::Ready { event, notifier } => {
                    entry.slot = Slot::Waiting { notifier };
                    event
                }
                waiting @ Slot::Waiting { .. } => {
                    entry.slot = waiting;
                    return Err(TableError::Busy(handle));
                }
                Slot::Vacant => return Err(TableError::UnknownHandle(handle)),
            };
            slots.stats.waiting += 1;
            event
        };

        let signaled = event.wait_once(timeout);

        let mut slots = self.lock();
        slots.retire(handle.index);
        slots.stats.waiting -= 1;
        if signaled {
            slots.stats.signaled += 1;
        } else {
            slots.stats.timed_out += 1;
        }
        drop(slots);

        tracing::debug!(%handle, signaled, "wait finished");
        Ok(signaled)
    }

    /// [`wait_once`](Self::wait_once) with an integer-seconds timeout.
    pub fn wait_once_secs(&self, handle: Handle, timeout_secs: u64) -> Result<bool, TableError> {
        self.wait_once(handle, Duration::from_secs(timeout_secs))
    }

    /// Signal the event behind `handle`.
    ///
    /// Returns `Ok(true)` if this call delivered the signal, `Ok(false)`
    /// if the event was already signaled or its waiter has just given up.
    ///
    /// # Errors
    ///
    /// Lookup errors for stale or unknown handles.
    pub fn notify(&self, handle: Handle) -> Result<bool, TableError> {
        let notifier = {
            let mut slots = self.lock();
            match &slots.entry_mut(handle)?.slot {
                Slot::Ready { notifier, .. } | Slot::Waiting { notifier } => notifier.clone(),
                Slot::Vacant => return Err(TableError::UnknownHandle(handle)),
            }
        };
        let delivered = notifier.notify();
        tracing::debug!(%handle, delivered, "notify");
        Ok(delivered)
    }

    /// Release an event that nobody is waiting on.
    ///
    /// # Errors
    ///
    /// [`TableError::Busy`] while a waiter is blocked on the handle;
    /// lookup errors for stale or unknown handles.
    pub fn destroy(&self, handle: Handle) -> Result<(), TableError> {
        let event = {
            let mut guard = self.lock();
            let slots = &mut *guard;
            let entry = slots.entry_mut(handle)?;
            if matches!(entry.slot, Slot::Waiting { .. }) {
                return Err(TableError::Busy(handle));
            }
            let Slot::Ready { event, .. } = std::mem::replace(&mut entry.slot, Slot::Vacant) else {
                return Err(TableError::UnknownHandle(handle));
            };
            slots.retire(handle.index);
            slots.stats.destroyed += 1;
            event
        };
        event.destroy();
        tracing::debug!(%handle, "event destroyed");
        Ok(())
    }

    pub fn stats(&self) -> TableStats {
        self.lock().stats
    }
}

impl<T: Platform + fmt::Debug> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("platform", &self.platform)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::event::testing::CountingPlatform;

    fn table() -> HandleTable<CountingPlatform> {
        HandleTable::new(CountingPlatform::default())
    }

    #[test]
    fn raw_round_trip_keeps_fields() {
        let h = Handle {
            index: 7,
            generation: 3,
        };
        assert_eq!(h.to_raw(), (3u64 << 32) | 7);
        assert_eq!(Handle::from_raw(h.to_raw()), h);
    }

    #[test]
    fn zero_token_is_never_valid() {
        let t = table();
        let first = t.create().unwrap();
        assert_ne!(first.to_raw(), 0);
        assert!(matches!(
            t.notify(Handle::from_raw(0)),
            Err(TableError::UnknownHandle(_))
        ));
    }

    #[test]
    fn notify_then_wait_by_handle() {
        let t = table();
        let h = t.create().unwrap();
        assert!(t.notify(h).unwrap());
        assert!(!t.notify(h).unwrap(), "second notify is a no-op");
        assert!(t.wait_once(h, Duration::ZERO).unwrap());
    }

    #[test]
    fn wait_times_out_by_handle() {
        let t = table();
        let h = t.create().unwrap();
        let start = Instant::now();
        assert!(!t.wait_once(h, Duration::from_millis(50)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(t.stats().timed_out, 1);
    }

    #[test]
    fn second_wait_is_use_after_consumed() {
        let t = table();
        let h = t.create().unwrap();
        t.wait_once(h, Duration::ZERO).unwrap();
        assert_eq!(
            t.wait_once(h, Duration::ZERO),
            Err(TableError::UseAfterConsumed(h))
        );
        assert_eq!(t.notify(h), Err(TableError::UseAfterConsumed(h)));
        assert_eq!(t.destroy(h), Err(TableError::UseAfterConsumed(h)));
    }

    #[test]
    fn forged_handles_are_unknown() {
        let t = table();
        let h = t.create().unwrap();

        let out_of_range = Handle::from_raw((1u64 << 32) | 99);
        assert_eq!(t.check(out_of_range), Err(TableError::UnknownHandle(out_of_range)));

        let future_generation = Handle {
            index: h.index(),
            generation: h.generation() + 5,
        };
        assert_eq!(
            t.check(future_generation),
            Err(TableError::UnknownHandle(future_generation))
        );
    }

    #[test]
    fn retired_slot_current_generation_is_unknown() {
        let t = table();
        let h = t.create().unwrap();
        t.destroy(h).unwrap();
        let next = Handle {
            index: h.index(),
            generation: h.generation() + 1,
        };
        assert_eq!(t.check(next), Err(TableError::UnknownHandle(next)));
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let t = table();
        let first = t.create().unwrap();
        t.destroy(first).unwrap();

        let second = t.create().unwrap();
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation() + 1);

        assert_eq!(t.notify(first), Err(TableError::UseAfterConsumed(first)));
        assert!(t.notify(second).unwrap());
    }

    #[test]
    fn generation_wraps_past_zero() {
        let t = table();
        let h = t.create().unwrap();
        t.lock().entries[h.index() as usize].generation = u32::MAX;
        let h = Handle {
            index: h.index(),
            generation: u32::MAX,
        };
        t.destroy(h).unwrap();
        let next = t.create().unwrap();
        assert_eq!(next.generation(), 1);
    }

    #[test]
    fn token_from_before_wrap_is_rejected_as_unknown() {
        let t = table();
        let h = t.create().unwrap();
        t.lock().entries[h.index() as usize].generation = u32::MAX - 1;
        let old = Handle {
            index: h.index(),
            generation: u32::MAX - 1,
        };
        t.destroy(old).unwrap();
        let last = t.create().unwrap();
        assert_eq!(last.generation(), u32::MAX);
        t.destroy(last).unwrap();

        let fresh = t.create().unwrap();
        assert_eq!(fresh.generation(), 1);
        assert_eq!(t.notify(old), Err(TableError::UnknownHandle(old)));
        assert_eq!(t.notify(last), Err(TableError::UnknownHandle(last)));
        assert!(t.notify(fresh).unwrap());
    }

    #[test]
    fn cross_thread_notify_wakes_waiter() {
        let t = Arc::new(table());
        let h = t.create().unwrap();
        let signaler = {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                t.notify(h)
            })
        };

        let start = Instant::now();
        assert!(t.wait_once(h, Duration::from_millis(1000)).unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(signaler.join().unwrap(), Ok(true));
    }

    #[test]
    fn concurrent_second_waiter_is_busy_and_destroy_refused() {
        let t = Arc::new(table());
        let h = t.create().unwrap();
        let waiter = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.wait_once(h, Duration::from_secs(5)))
        };

        // Let the waiter take the event out of its slot.
        let deadline = Instant::now() + Duration::from_secs(2);
        while t.stats().waiting == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(t.wait_once(h, Duration::ZERO), Err(TableError::Busy(h)));
        assert_eq!(t.destroy(h), Err(TableError::Busy(h)));
        assert!(t.notify(h).unwrap());
        assert_eq!(waiter.join().unwrap(), Ok(true));
    }

    #[test]
    fn every_create_is_released_once() {
        let t = table();
        let signaled = t.create().unwrap();
        let timed_out = t.create().unwrap();
        let destroyed = t.create().unwrap();
        let _abandoned = t.create().unwrap();

        t.notify(signaled).unwrap();
        t.wait_once(signaled, Duration::from_millis(5)).unwrap();
        t.wait_once(timed_out, Duration::from_millis(5)).unwrap();
        t.destroy(destroyed).unwrap();

        let counters = Arc::clone(&t.platform().counters);
        assert_eq!(counters.created(), 4);
        assert_eq!(counters.destroyed(), 3);

        drop(t);
        assert_eq!(counters.destroyed(), 4, "dropping the table releases the rest");
    }

    #[test]
    fn stats_track_lifecycle() {
        let t = table();
        let a = t.create().unwrap();
        let b = t.create().unwrap();
        let c = t.create().unwrap();
        t.notify(a).unwrap();
        t.wait_once(a, Duration::ZERO).unwrap();
        t.wait_once(b, Duration::ZERO).unwrap();
        t.destroy(c).unwrap();
        t.create().unwrap();

        let stats = t.stats();
        assert_eq!(stats.created, 4);
        assert_eq!(stats.signaled, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[test]
    fn exhausted_platform_surfaces_through_create() {
        let t = HandleTable::new(CountingPlatform::with_limit(1));
        let h = t.create().unwrap();
        let err = t.create().unwrap_err();
        assert_eq!(err.reason(), "resource_exhausted");
        t.destroy(h).unwrap();
        assert!(t.create().is_ok());
    }

    #[test]
    fn integer_seconds_form() {
        let t = table();
        let h = t.create().unwrap();
        t.notify(h).unwrap();
        assert!(t.wait_once_secs(h, 0).unwrap());
    }
}
