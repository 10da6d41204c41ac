//! Mutable reactor state shared between the public API, the dispatch loop
//! and the active backend.
//!
//! Everything in here is guarded by one mutex in `Inner`. The lock is only
//! ever held for short bookkeeping sections; no backend blocks in a poll
//! syscall while holding it, so cross-thread wakeups and (in multi-worker
//! mode) other pollers are never stuck behind a sleeping thread.

use std::collections::VecDeque;

use slab::Slab;

use crate::backend::BackendState;
use crate::bands::Bands;
use crate::hooks::{DeadlineSource, TaskQueue};
use crate::registration::{FdHandle, Registration};

pub(crate) struct Core {
    /// Registration table. Slots are stable for the lifetime of a
    /// registration; handles carry a generation counter on top of the key.
    pub table: Slab<Registration>,

    /// Keys of registrations that gathered events this poll round, in the
    /// order they became ready. Drained once per dispatch pass.
    pub active: VecDeque<usize>,

    /// The registration currently inside its callback, if any.
    pub dispatching: Option<(usize, u64)>,

    /// Set when the currently-dispatching registration is unregistered from
    /// within a callback. Slab reclamation is deferred until its dispatch
    /// entry completes so mid-round references never dangle.
    pub dispatch_dead: bool,

    pub quit: bool,
    pub next_gen: u64,

    pub timers: Option<Box<dyn DeadlineSource>>,
    pub tasks: Option<Box<dyn TaskQueue>>,

    /// Backend-private state for the one backend selected at construction.
    pub backend_state: BackendState,
}

impl Core {
    pub(crate) fn new() -> Self {
        Core {
            table: Slab::new(),
            active: VecDeque::new(),
            dispatching: None,
            dispatch_dead: false,
            quit: false,
            next_gen: 1,
            timers: None,
            tasks: None,
            backend_state: BackendState::Uninit,
        }
    }

    /// Key for a live, registered handle; `None` for stale handles and
    /// handles mid-unregistration.
    pub(crate) fn resolve(&self, handle: FdHandle) -> Option<usize> {
        match self.table.get(handle.key) {
            Some(reg) if reg.gen == handle.gen && reg.registered => Some(handle.key),
            _ => None,
        }
    }

    /// Record bands that fired for a registration and link it onto the
    /// active list. Linked at most once per round regardless of how many
    /// bands fire.
    pub(crate) fn make_ready(&mut self, key: usize, bands: Bands) {
        let Some(reg) = self.table.get_mut(key) else {
            return;
        };
        reg.ready |= bands;
        if !reg.on_active {
            reg.on_active = true;
            self.active.push_back(key);
        }
    }

    /// `make_ready` guarded by a generation check, for backends correlating
    /// kernel events back to registrations. A stale generation means the
    /// event belongs to a registration that has since been unregistered
    /// (possibly with its descriptor number reused); it is dropped.
    pub(crate) fn make_ready_checked(&mut self, key: usize, gen: u64, bands: Bands) {
        match self.table.get(key) {
            Some(reg) if reg.gen == gen && reg.registered => self.make_ready(key, bands),
            _ => log::trace!("dropping stale event for slot {} gen {}", key, gen),
        }
    }

    /// Take a registration off the active list, if it is on it.
    pub(crate) fn unlink_active(&mut self, key: usize) {
        if let Some(reg) = self.table.get_mut(key) {
            if reg.on_active {
                reg.on_active = false;
                reg.ready = Bands::NONE;
                self.active.retain(|&k| k != key);
            }
        }
    }
}
