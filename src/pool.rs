//! Free lists of reusable per-response objects.
//!
//! A [`Pool`] hands out [`Pooled`] guards. Dropping the guard recycles the
//! value and puts it back, so every exit path of a response (clean finish,
//! error, or the body being dropped when the peer goes away) returns what it
//! borrowed.

use crate::codec::Encoder;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Values that can be reset for reuse by an unrelated response.
pub trait Recycle {
    /// Erases all state tied to the previous user.
    fn recycle(&mut self);
}

impl Recycle for BytesMut {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recycle for Box<dyn Encoder> {
    fn recycle(&mut self) {
        self.reset();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A thread-safe free list that constructs a new value whenever it is empty.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    make: Factory<T>,
    capacity: Option<usize>,
}

impl<T: Recycle> Pool<T> {
    /// Creates an unbounded pool.
    pub fn new<F>(make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::new()),
            make: Box::new(make),
            capacity: None,
        }
    }

    /// Limits how many idle values are retained; extra releases are dropped.
    pub fn with_capacity_limit(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Checks a value out, constructing one if none is idle.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let value = self.idle.lock().pop().unwrap_or_else(|| {
            tracing::trace!("pool miss, constructing a new value");
            (self.make)()
        });
        Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        }
    }

    /// Number of values waiting to be reused.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut value: T) {
        value.recycle();
        let mut idle = self.idle.lock();
        if self.capacity.is_none_or(|cap| idle.len() < cap) {
            idle.push(value);
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A value checked out of a [`Pool`]; returned to it when dropped.
pub struct Pooled<T: Recycle> {
    value: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // only `drop` takes the value
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

impl<T: Recycle> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").finish_non_exhaustive()
    }
}
