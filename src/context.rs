//! Thread-local lookup of the calling thread's reactor.
//!
//! The owning thread's reactor is recorded here at construction so code deep
//! inside a callback can recover it without threading a reference through
//! every call. Worker threads of the multi-worker backend push the reactor
//! for the duration of a dispatch pass so `Reactor::current()` works from
//! their callbacks too.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::reactor::Inner;

thread_local! {
    static CURRENT: RefCell<Vec<Weak<Inner>>> = const { RefCell::new(Vec::new()) };
}

/// Record `inner` as this thread's reactor until the guard drops.
pub(crate) fn enter(inner: &Arc<Inner>) -> ContextGuard {
    CURRENT.with(|cur| cur.borrow_mut().push(Arc::downgrade(inner)));
    ContextGuard
}

/// Permanently record `inner` for the constructing thread.
pub(crate) fn register(inner: &Arc<Inner>) {
    CURRENT.with(|cur| cur.borrow_mut().push(Arc::downgrade(inner)));
}

/// Drop the construction-time record, if called from the thread that made it.
pub(crate) fn unregister(inner: *const Inner) {
    let _ = CURRENT.try_with(|cur| {
        cur.borrow_mut()
            .retain(|w| !std::ptr::eq(w.as_ptr(), inner) && w.strong_count() > 0);
    });
}

pub(crate) fn current() -> Option<Arc<Inner>> {
    CURRENT.with(|cur| {
        let mut cur = cur.borrow_mut();
        // Prune entries whose reactor is gone while walking.
        cur.retain(|w| w.strong_count() > 0);
        cur.last().and_then(Weak::upgrade)
    })
}

pub(crate) struct ContextGuard;

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = CURRENT.try_with(|cur| {
            cur.borrow_mut().pop();
        });
    }
}
