//! The public reactor surface and the dispatch loop.
//!
//! A `Reactor` is a cheap clone-able handle onto one shared `Inner`. All
//! structural operations (registering, updating, unregistering, running) are
//! restricted to the thread that built the reactor, or to the thread
//! currently holding the multi-worker backend's execution lock when called
//! from inside a callback. The one deliberately cross-thread surface is
//! `ReactorWaker`, which posts the backend's wake signal and nothing else.
//!
//! Dispatch runs with the core lock released: each callback is moved out of
//! its slot for the duration of the call and restored afterwards only if the
//! registration still exists, still wants the band, and nothing replaced the
//! callback in the meantime. That makes re-entrant `register`, `unregister`,
//! `update_callbacks` and `quit` from inside a callback all legal, including
//! a callback unregistering its own descriptor.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Backend, BackendKind};
use crate::bands::Bands;
use crate::context;
use crate::core::Core;
use crate::error::ReactorError;
use crate::hooks::{DeadlineSource, TaskQueue};
use crate::registration::{FdHandle, Handler, Registration};

pub(crate) struct Inner {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) core: Mutex<Core>,
    pub(crate) owner: ThreadId,
    /// Live `ReactorWaker` handles. The backend's wake receiver is armed
    /// while this is nonzero.
    pub(crate) waker_count: AtomicUsize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        {
            let mut core = self.core.lock();
            let core = &mut *core;
            let keys: Vec<usize> = core.table.iter().map(|(key, _)| key).collect();
            for key in keys {
                core.table[key].registered = false;
                self.backend.unregister_fd(core, key);
                core.table.remove(key);
            }
            core.active.clear();
        }
        self.backend.deinit(self);
        context::unregister(self as *const Inner);
    }
}

/// Handle onto an event-driven I/O reactor.
///
/// Multiplexes readiness of registered descriptors over one of several
/// polling backends and dispatches per-band callbacks from `run`.
#[derive(Clone)]
pub struct Reactor {
    pub(crate) inner: Arc<Inner>,
}

impl Reactor {
    /// Build a reactor on the platform's default backend (overridable via
    /// the `DYNEIN_POLL_METHOD` environment variable).
    pub fn new() -> Result<Reactor, ReactorError> {
        Self::with_backend(BackendKind::default_kind())
    }

    pub fn with_backend(kind: BackendKind) -> Result<Reactor, ReactorError> {
        let inner = Arc::new(Inner {
            backend: kind.strategy(),
            core: Mutex::new(Core::new()),
            owner: thread::current().id(),
            waker_count: AtomicUsize::new(0),
        });
        inner.backend.init(&inner)?;
        context::register(&inner);
        Ok(Reactor { inner })
    }

    /// The reactor owned by the calling thread, if one was built on it (or,
    /// from a worker-dispatched callback, the reactor being dispatched).
    pub fn current() -> Option<Reactor> {
        context::current().map(|inner| Reactor { inner })
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Number of currently registered descriptors.
    pub fn len(&self) -> usize {
        self.inner
            .core
            .lock()
            .table
            .iter()
            .filter(|(_, reg)| reg.registered)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_structural(&self) -> Result<(), ReactorError> {
        if thread::current().id() == self.inner.owner
            || self.inner.backend.is_exec_holder(&self.inner)
        {
            Ok(())
        } else {
            Err(ReactorError::InvalidArgument(
                "structural operation from a foreign thread",
            ))
        }
    }

    /// Register a descriptor with one callback per band of interest. At
    /// least one callback is required. The returned handle is the sole way
    /// to refer to the registration afterwards.
    pub fn register(
        &self,
        fd: RawFd,
        cookie: u64,
        handler_in: Option<Handler>,
        handler_out: Option<Handler>,
        handler_err: Option<Handler>,
    ) -> Result<FdHandle, ReactorError> {
        self.check_structural()?;
        if handler_in.is_none() && handler_out.is_none() && handler_err.is_none() {
            return Err(ReactorError::InvalidArgument(
                "registration needs at least one callback",
            ));
        }

        if let Err(e) = crate::utils::set_fd_nonblocking(fd) {
            log::debug!("could not set fd {} nonblocking: {}", fd, e);
        }

        let mut core = self.inner.core.lock();
        let gen = core.next_gen;
        core.next_gen += 1;
        let mut reg = Registration::new(fd, cookie, gen);
        reg.handler_in = handler_in;
        reg.handler_out = handler_out;
        reg.handler_err = handler_err;
        reg.recompute_wanted();
        let key = core.table.insert(reg);
        log::trace!("registering fd {} in slot {}", fd, key);

        if let Err(e) = self.inner.backend.register_fd(&mut core, key) {
            core.table.remove(key);
            return Err(e);
        }
        Ok(FdHandle { key, gen })
    }

    /// Replace the full callback set of a registration. `None` clears a
    /// band. Interest growth is reconciled lazily at the next poll; interest
    /// shrinkage is reconciled synchronously so a caller about to close the
    /// descriptor knows the kernel side is gone. If synchronous
    /// reconciliation fails, the lazy path is queued as a fallback and the
    /// error surfaced: the descriptor must not be closed yet.
    pub fn update_callbacks(
        &self,
        handle: FdHandle,
        handler_in: Option<Handler>,
        handler_out: Option<Handler>,
        handler_err: Option<Handler>,
    ) -> Result<(), ReactorError> {
        self.check_structural()?;
        let mut core = self.inner.core.lock();
        let Some(key) = core.resolve(handle) else {
            return Err(ReactorError::InvalidArgument("stale registration handle"));
        };

        // Wanted is computed from the arguments, not from the slots: during
        // dispatch the running band's callback is moved out of its slot, so
        // slot occupancy is not authoritative here.
        let mut wanted = Bands::NONE;
        if handler_in.is_some() {
            wanted |= Bands::IN;
        }
        if handler_out.is_some() {
            wanted |= Bands::OUT;
        }
        if handler_err.is_some() {
            wanted |= Bands::ERR;
        }

        let old_wanted = {
            let reg = &mut core.table[key];
            let old = reg.wanted;
            reg.handler_in = handler_in;
            reg.handler_out = handler_out;
            reg.handler_err = handler_err;
            reg.wanted = wanted;
            // Bands that lost their callback must not fire this round.
            reg.ready = reg.ready & wanted;
            old
        };

        if wanted.is_empty() {
            // Detached from the backend but still registered; a later
            // update can re-grow it.
            if !old_wanted.is_empty() {
                self.inner.backend.unregister_fd(&mut core, key);
            }
            core.unlink_active(key);
            return Ok(());
        }
        if old_wanted.is_empty() {
            return self.inner.backend.register_fd(&mut core, key);
        }
        if !(old_wanted - wanted).is_empty() {
            return match self.inner.backend.notify_fd_sync(&mut core, key) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.inner.backend.notify_fd(&mut core, key);
                    Err(e)
                }
            };
        }
        if !(wanted - old_wanted).is_empty() {
            self.inner.backend.notify_fd(&mut core, key);
        }
        Ok(())
    }

    /// Unregister a descriptor. The handle is dead afterwards; a second
    /// unregister through it fails. Legal from inside any callback,
    /// including the registration's own: its remaining bands for this round
    /// are suppressed and its slot is reclaimed once the callback returns.
    pub fn unregister(&self, handle: FdHandle) -> Result<(), ReactorError> {
        self.check_structural()?;
        let mut core = self.inner.core.lock();
        let Some(key) = core.resolve(handle) else {
            return Err(ReactorError::InvalidArgument("stale registration handle"));
        };
        log::trace!("unregistering fd {} from slot {}", core.table[key].fd, key);

        core.table[key].registered = false;
        self.inner.backend.unregister_fd(&mut core, key);
        core.unlink_active(key);
        if core.dispatching == Some((key, handle.gen)) {
            // The dispatch pass still references this slot; reclamation is
            // deferred until its entry completes.
            core.dispatch_dead = true;
        } else {
            core.table.remove(key);
        }
        Ok(())
    }

    /// Ask the run loop to return after the current round completes.
    /// Callable from any thread; a blocked poll is woken.
    pub fn quit(&self) {
        self.inner.core.lock().quit = true;
        self.inner.backend.event_send(&self.inner);
    }

    /// A cross-thread wake handle. Arms the backend's wake receiver on
    /// first creation; disarmed again when the last waker drops.
    pub fn waker(&self) -> Result<ReactorWaker, ReactorError> {
        self.inner.backend.event_rx_on(&self.inner)?;
        self.inner.waker_count.fetch_add(1, Ordering::AcqRel);
        Ok(ReactorWaker {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn set_deadline_source(&self, source: Box<dyn DeadlineSource>) {
        self.inner.core.lock().timers = Some(source);
    }

    pub fn set_task_queue(&self, queue: Box<dyn TaskQueue>) {
        self.inner.core.lock().tasks = Some(queue);
    }

    /// Run until `quit` is called or nothing remains that could produce an
    /// event: no registered descriptor, no armed timer, no pending task and
    /// no live waker.
    pub fn run(&self) -> Result<(), ReactorError> {
        self.check_structural()?;
        let result = loop {
            let timeout = {
                let mut core = self.inner.core.lock();
                if core.quit {
                    core.quit = false;
                    break Ok(());
                }
                let core = &mut *core;
                let has_fds = core.table.iter().any(|(_, reg)| reg.registered);
                let tasks_pending = core.tasks.as_ref().is_some_and(|t| t.has_pending());
                let deadline = core.timers.as_mut().and_then(|t| t.next_deadline());
                let armed = self.inner.waker_count.load(Ordering::Acquire) > 0;
                if !has_fds && !tasks_pending && deadline.is_none() && !armed {
                    break Ok(());
                }
                if tasks_pending {
                    Some(Duration::ZERO)
                } else {
                    deadline
                }
            };

            if let Err(e) = self.inner.backend.poll(&self.inner, timeout) {
                break Err(e);
            }
            run_active(&self.inner);
            self.run_hooks();
        };
        self.inner.backend.release_exec(&self.inner);
        result
    }

    /// One poll-plus-dispatch round, bounded by `timeout` (`None` blocks
    /// until something happens). Collaborator hooks run as in `run`.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<(), ReactorError> {
        self.check_structural()?;
        let result = self.inner.backend.poll(&self.inner, timeout);
        if result.is_ok() {
            run_active(&self.inner);
            self.run_hooks();
        }
        self.inner.backend.release_exec(&self.inner);
        result
    }

    /// Drive the timer source and the task queue, each moved out of the
    /// core while it runs so its callbacks can re-enter the reactor.
    fn run_hooks(&self) {
        let timers = self.inner.core.lock().timers.take();
        if let Some(mut timers) = timers {
            timers.expire_due(self);
            let mut core = self.inner.core.lock();
            if core.timers.is_none() {
                core.timers = Some(timers);
            }
        }

        let tasks = {
            let mut core = self.inner.core.lock();
            match core.tasks.take() {
                Some(t) if t.has_pending() => Some(t),
                other => {
                    core.tasks = other;
                    None
                }
            }
        };
        if let Some(mut tasks) = tasks {
            tasks.run_one(self);
            let mut core = self.inner.core.lock();
            if core.tasks.is_none() {
                core.tasks = Some(tasks);
            }
        }
    }
}

/// Dispatch every entry on the active list, in the order readiness was
/// gathered. Also the entry point for multi-worker backend threads, which
/// call it holding the execution lock.
pub(crate) fn run_active(inner: &Arc<Inner>) {
    let reactor = Reactor {
        inner: inner.clone(),
    };
    loop {
        let (key, gen) = {
            let mut core = inner.core.lock();
            let Some(key) = core.active.pop_front() else {
                break;
            };
            let Some(reg) = core.table.get_mut(key) else {
                continue;
            };
            reg.on_active = false;
            let gen = reg.gen;
            core.dispatching = Some((key, gen));
            core.dispatch_dead = false;
            (key, gen)
        };

        dispatch_one(&reactor, key, gen);

        let mut core = inner.core.lock();
        core.dispatching = None;
        if core.dispatch_dead {
            core.dispatch_dead = false;
            core.table.remove(key);
        }
    }
}

/// Run one registration's callbacks for every band in `ready ∩ wanted`,
/// re-evaluated before each band so a callback's own structural changes take
/// effect within the round.
fn dispatch_one(reactor: &Reactor, key: usize, gen: u64) {
    for band in [Bands::IN, Bands::OUT, Bands::ERR] {
        let (mut handler, cookie) = {
            let mut core = reactor.inner.core.lock();
            if core.dispatch_dead {
                return;
            }
            let Some(reg) = core.table.get_mut(key) else {
                return;
            };
            if reg.gen != gen || !reg.registered {
                return;
            }
            if !(reg.ready & reg.wanted).contains(band) {
                continue;
            }
            reg.ready = reg.ready - band;
            let Some(handler) = reg.handler_slot(band).take() else {
                continue;
            };
            (handler, reg.cookie)
        };

        handler(reactor, cookie);

        let mut core = reactor.inner.core.lock();
        if core.dispatch_dead {
            // Unregistered itself; the moved-out callback is dropped here.
            return;
        }
        if let Some(reg) = core.table.get_mut(key) {
            if reg.gen == gen && reg.registered && reg.wanted.contains(band) {
                let slot = reg.handler_slot(band);
                if slot.is_none() {
                    *slot = Some(handler);
                }
                // A refilled slot means update_callbacks installed a
                // replacement mid-call; the old callback is dropped.
            }
        }
    }

    let mut core = reactor.inner.core.lock();
    if !core.dispatch_dead {
        if let Some(reg) = core.table.get_mut(key) {
            if reg.gen == gen {
                reg.ready = Bands::NONE;
            }
        }
    }
}

/// Cross-thread wake handle obtained from [`Reactor::waker`].
///
/// The only reactor surface that is legal to use off the owning thread:
/// `wake` forces a blocked poll to return and start a fresh round. Holds the
/// reactor weakly, so it never extends the reactor's lifetime.
pub struct ReactorWaker {
    inner: Weak<Inner>,
}

impl ReactorWaker {
    /// Wake the reactor if it still exists. A wake with no blocked poll in
    /// flight makes the next poll return immediately instead.
    pub fn wake(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.backend.event_send(&inner);
        }
    }
}

impl Clone for ReactorWaker {
    fn clone(&self) -> Self {
        if let Some(inner) = self.inner.upgrade() {
            inner.waker_count.fetch_add(1, Ordering::AcqRel);
        }
        ReactorWaker {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for ReactorWaker {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.waker_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.backend.event_rx_off(&inner);
            }
        }
    }
}
