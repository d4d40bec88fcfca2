//! Checkout-counted wrapper used to hand a shared value (the peer lists) from
//! readers to a writer that wants to retire it.
//!
//! Readers call [`ReferenceCounted::open`] and hold the returned [`Checkout`]
//! for the duration of their work; dropping the checkout checks it back in on
//! every exit path. A writer calls [`ReferenceCounted::destroy`] with a cleanup
//! closure which runs immediately if nothing is checked out, otherwise once the
//! last outstanding checkout is dropped.

use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

type Cleanup<T> = Box<dyn FnOnce(&T) + Send>;

pub struct ReferenceCounted<T> {
    value: T,
    state: Mutex<RefState<T>>,
}

struct RefState<T> {
    ref_cnt: usize,
    retired: bool,
    pending_cleanups: Vec<Cleanup<T>>,
}

impl<T> ReferenceCounted<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            state: Mutex::new(RefState {
                ref_cnt: 0,
                retired: false,
                pending_cleanups: Vec::new(),
            }),
        }
    }

    /// Check the value out. Fails once the value has been retired.
    pub fn open(self: &Arc<Self>) -> Result<Checkout<T>> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(Error::new(ErrorKind::Retired, "reference counted value retired"));
        }
        state.ref_cnt += 1;
        Ok(Checkout {
            inner: Arc::clone(self),
        })
    }

    /// Retire the value. `cleanup` runs now if nothing is checked out, otherwise
    /// when the last checkout is closed.
    pub fn destroy<F>(&self, cleanup: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut state = self.state.lock();
        state.retired = true;
        if state.ref_cnt == 0 {
            drop(state);
            cleanup(&self.value);
        } else {
            state.pending_cleanups.push(Box::new(cleanup));
        }
    }

    pub fn ref_cnt(&self) -> usize {
        self.state.lock().ref_cnt
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    fn close(&self) {
        let cleanups = {
            let mut state = self.state.lock();
            state.ref_cnt = state.ref_cnt.saturating_sub(1);
            if state.retired && state.ref_cnt == 0 {
                std::mem::take(&mut state.pending_cleanups)
            } else {
                Vec::new()
            }
        };
        // Cleanups run outside the lock so they may touch the view again.
        for cleanup in cleanups {
            cleanup(&self.value);
        }
    }
}

/// A checked-out handle. Dropping it checks the value back in.
pub struct Checkout<T> {
    inner: Arc<ReferenceCounted<T>>,
}

impl<T> Deref for Checkout<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T> Drop for Checkout<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}
