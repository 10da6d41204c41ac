//! Per-descriptor registration records.
//!
//! A `Registration` binds an OS descriptor to its callbacks and tracks the
//! three independently-changing views of the descriptor: the bands the
//! application wants (derived from which callbacks are set), the bands the
//! active backend has installed kernel-side, and the bands that fired during
//! the most recent poll round. Registrations live in a stable slab table and
//! are referred to by generation-checked handles so that a recycled table
//! slot can never be confused with the registration that used to occupy it.

use std::os::fd::RawFd;

use crate::bands::Bands;
use crate::reactor::Reactor;

/// A band callback. Receives the reactor handle and the registration's
/// cookie; may freely register, unregister or update registrations,
/// including its own.
pub type Handler = Box<dyn FnMut(&Reactor, u64) + Send>;

/// Opaque handle to a registered descriptor.
///
/// Carries a generation counter alongside the table key, so operations on a
/// handle whose registration has since been unregistered fail with
/// `InvalidArgument` instead of touching an unrelated registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdHandle {
    pub(crate) key: usize,
    pub(crate) gen: u64,
}

/// Backend-private slot data on a registration.
///
/// Exactly one variant is in use at a time, selected by the active backend:
/// the plain poll backend keeps a dense index into its descriptor array, the
/// multi-worker backend keeps a (group, index-within-group) pair, and the
/// kernel-queue backends need no slot at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BackendSlot {
    None,
    Index(usize),
    Group { grp: usize, idx: usize },
}

pub(crate) struct Registration {
    pub fd: RawFd,
    pub cookie: u64,
    pub handler_in: Option<Handler>,
    pub handler_out: Option<Handler>,
    pub handler_err: Option<Handler>,

    /// Bands with a callback set. Owned by the reactor core; a backend never
    /// writes this.
    pub wanted: Bands,

    /// Bands currently reflected in the backend's kernel-side bookkeeping.
    /// Owned by the backend; the core never writes this.
    pub installed: Bands,

    /// Bands that fired during the current poll round. Valid only between
    /// poll and dispatch; cleared when the registration is dispatched.
    pub ready: Bands,

    /// True from successful registration until unregistration begins.
    /// Backends observe false here while unregistration cleanup runs.
    pub registered: bool,

    /// Linked onto the active list for the current round. A registration is
    /// linked at most once per round no matter how many bands fired.
    pub on_active: bool,

    /// Queued on a backend's deferred-notify list. Makes `notify_fd`
    /// idempotent between polls.
    pub queued: bool,

    pub gen: u64,
    pub slot: BackendSlot,
}

impl Registration {
    pub(crate) fn new(fd: RawFd, cookie: u64, gen: u64) -> Self {
        Registration {
            fd,
            cookie,
            handler_in: None,
            handler_out: None,
            handler_err: None,
            wanted: Bands::NONE,
            installed: Bands::NONE,
            ready: Bands::NONE,
            registered: true,
            on_active: false,
            queued: false,
            gen,
            slot: BackendSlot::None,
        }
    }

    /// Recompute `wanted` from which handlers are set.
    pub(crate) fn recompute_wanted(&mut self) {
        let mut wanted = Bands::NONE;
        if self.handler_in.is_some() {
            wanted |= Bands::IN;
        }
        if self.handler_out.is_some() {
            wanted |= Bands::OUT;
        }
        if self.handler_err.is_some() {
            wanted |= Bands::ERR;
        }
        self.wanted = wanted;
    }

    pub(crate) fn handler_slot(&mut self, band: Bands) -> &mut Option<Handler> {
        if band == Bands::IN {
            &mut self.handler_in
        } else if band == Bands::OUT {
            &mut self.handler_out
        } else {
            &mut self.handler_err
        }
    }
}
