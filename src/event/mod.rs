//! One-shot waitable event.
//!
//! A [`WaitableEvent`] lets one thread block until another thread (or
//! an asynchronous completion context) signals, or until a timeout
//! elapses. It is good for exactly one wait: [`WaitableEvent::wait_once`]
//! takes the event by value and releases the underlying primitive before
//! returning, whatever the outcome. An event that is never waited on
//! releases its primitive on drop.
//!
//! The signaling side holds a [`Notifier`]. Notifiers keep only a weak
//! reference, so they never extend the primitive's lifetime, and
//! notifying an event that is already gone is a harmless no-op.
//!
//! Ordering: a `notify()` that happens before the waiter blocks is
//! retained by the primitive, and writes made by the signaler before
//! `notify()` are visible to the waiter once `wait_once` returns `true`.

pub mod primitive;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub use primitive::{CondvarPlatform, CondvarPrimitive, Platform, Primitive};

/// Event construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("no synchronization primitive available (limit {limit})")]
    ResourceExhausted { limit: usize },
}

/// Single-use event owned by the waiting side.
pub struct WaitableEvent<P: Primitive = CondvarPrimitive> {
    /// `None` once released. Taking it is what makes release happen once.
    primitive: Option<Arc<P>>,
}

impl WaitableEvent<CondvarPrimitive> {
    /// Create an event on an unbounded condvar platform.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Self::create_on`].
    pub fn create() -> Result<Self, EventError> {
        Self::create_on(&CondvarPlatform::new())
    }
}

impl<P: Primitive> WaitableEvent<P> {
    /// Create an event whose primitive comes from `platform`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ResourceExhausted`] if the platform cannot
    /// allocate a primitive.
    pub fn create_on<T>(platform: &T) -> Result<Self, EventError>
    where
        T: Platform<Primitive = P> + ?Sized,
    {
        let primitive = platform.allocate()?;
        Ok(Self {
            primitive: Some(Arc::new(primitive)),
        })
    }

    /// A signaling capability for this event. Cheap to clone and send.
    pub fn notifier(&self) -> Notifier<P> {
        Notifier {
            primitive: self
                .primitive
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
        }
    }

    /// Whether a signal has already been delivered.
    pub fn is_signaled(&self) -> bool {
        self.primitive.as_ref().is_some_and(|p| p.is_signaled())
    }

    /// Block until signaled or until `timeout` elapses, then release.
    ///
    /// Returns `true` if the event was signaled before the timeout. A
    /// zero timeout polls the current state without blocking.
    pub fn wait_once(mut self, timeout: Duration) -> bool {
        let signaled = self
            .primitive
            .as_ref()
            .is_some_and(|p| p.wait_timeout(timeout));
        self.release();
        signaled
    }

    /// Release without waiting. Used on early-abort paths.
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(primitive) = self.primitive.take() {
            primitive.release();
        }
    }
}

impl<P: Primitive> Drop for WaitableEvent<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: Primitive> fmt::Debug for WaitableEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitableEvent")
            .field("released", &self.primitive.is_none())
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Signaling side of a [`WaitableEvent`].
pub struct Notifier<P: Primitive = CondvarPrimitive> {
    primitive: Weak<P>,
}

impl<P: Primitive> Notifier<P> {
    /// Wake the waiter, or leave the signal for it to find.
    ///
    /// Returns `true` if this call delivered the signal. Returns `false`
    /// if the event was already signaled or has been released.
    pub fn notify(&self) -> bool {
        match self.primitive.upgrade() {
            Some(primitive) => primitive.signal(),
            None => {
                tracing::trace!("notify on released event ignored");
                false
            }
        }
    }

    /// Whether the event still holds its primitive.
    pub fn is_live(&self) -> bool {
        self.primitive.strong_count() > 0
    }
}

impl<P: Primitive> Clone for Notifier<P> {
    fn clone(&self) -> Self {
        Self {
            primitive: Weak::clone(&self.primitive),
        }
    }
}

impl<P: Primitive> fmt::Debug for Notifier<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("live", &self.is_live())
            .finish()
    }
}

/// Counting platform used by tests that check release accounting.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{CondvarPlatform, CondvarPrimitive, EventError, Platform, Primitive};

    #[derive(Debug, Default)]
    pub struct Counters {
        pub created: AtomicUsize,
        pub destroyed: AtomicUsize,
    }

    impl Counters {
        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        pub fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct CountingPlatform {
        inner: CondvarPlatform,
        pub counters: Arc<Counters>,
    }

    impl CountingPlatform {
        pub fn with_limit(limit: usize) -> Self {
            Self {
                inner: CondvarPlatform::with_limit(limit),
                counters: Arc::default(),
            }
        }
    }

    #[derive(Debug)]
    pub struct CountingPrimitive {
        inner: CondvarPrimitive,
        counters: Arc<Counters>,
    }

    impl Primitive for CountingPrimitive {
        fn signal(&self) -> bool {
            self.inner.signal()
        }

        fn wait_timeout(&self, timeout: Duration) -> bool {
            self.inner.wait_timeout(timeout)
        }

        fn is_signaled(&self) -> bool {
            self.inner.is_signaled()
        }

        fn release(&self) {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            self.inner.release();
        }
    }

    impl Platform for CountingPlatform {
        type Primitive = CountingPrimitive;

        fn allocate(&self) -> Result<CountingPrimitive, EventError> {
            let inner = self.inner.allocate()?;
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(CountingPrimitive {
                inner,
                counters: Arc::clone(&self.counters),
            })
        }
    }
}
