//! epoll backend (Linux).
//!
//! Kernel registrations are expensive to churn one syscall at a time, so
//! reconciliation of `wanted` vs `installed` is deferred onto a notify queue
//! and flushed in a batch at the start of every poll. Unregistration is the
//! exception: it deletes the kernel registration synchronously, so a
//! descriptor number reused after `unregister`/`close` can never inherit
//! stale event delivery.
//!
//! Events are correlated back to registrations through the epoll data word,
//! which packs the table key with the low half of the registration's
//! generation; a mismatch on either side drops the event.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::backend::{Backend, BackendState};
use crate::bands::Bands;
use crate::core::Core;
use crate::error::ReactorError;
use crate::reactor::Inner;
use crate::registration::Registration;
use crate::utils::{wake_drain, wake_pipe, wake_write};

const EVENT_BATCH: usize = 64;

/// Data word for the wake channel; never collides with a packed token
/// because keys are truncated to 32 bits.
const WAKE_TOKEN: u64 = u64::MAX;

pub(crate) struct EpollState {
    ep: Arc<Epoll>,
    /// Keys queued for wanted-vs-installed reconciliation at next poll.
    notify: VecDeque<usize>,
    wake_rx: OwnedFd,
    wake_tx: Arc<OwnedFd>,
}

pub(crate) struct EpollBackend;

fn state_mut(bs: &mut BackendState) -> &mut EpollState {
    match bs {
        BackendState::Epoll(st) => st,
        _ => unreachable!("epoll backend driving foreign state"),
    }
}

fn token(key: usize, gen: u64) -> u64 {
    ((gen as u32 as u64) << 32) | (key as u32 as u64)
}

fn untoken(data: u64) -> (usize, u32) {
    ((data as u32) as usize, (data >> 32) as u32)
}

fn bands_to_events(wanted: Bands) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if wanted.contains(Bands::IN) {
        flags |= EpollFlags::EPOLLIN;
    }
    if wanted.contains(Bands::OUT) {
        flags |= EpollFlags::EPOLLOUT;
    }
    // EPOLLERR and EPOLLHUP are always reported.
    flags
}

fn events_to_bands(events: EpollFlags) -> Bands {
    let err = EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;
    let mut bands = Bands::NONE;
    if events.intersects(EpollFlags::EPOLLIN | err) {
        bands |= Bands::IN;
    }
    if events.intersects(EpollFlags::EPOLLOUT | err) {
        bands |= Bands::OUT;
    }
    if events.intersects(err) {
        bands |= Bands::ERR;
    }
    bands
}

fn epoll_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(d) => {
            let mut ms = d.as_millis();
            // Sub-millisecond deadlines round up, not down to a spin.
            if ms == 0 && !d.is_zero() {
                ms = 1;
            }
            EpollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
        }
    }
}

/// Bring the kernel registration for one descriptor in line with `wanted`.
fn reconcile(ep: &Epoll, key: usize, reg: &mut Registration) -> nix::Result<()> {
    if reg.installed == reg.wanted {
        return Ok(());
    }
    let fd = unsafe { BorrowedFd::borrow_raw(reg.fd) };
    if reg.installed.is_empty() {
        ep.add(fd, EpollEvent::new(bands_to_events(reg.wanted), token(key, reg.gen)))?;
    } else if reg.wanted.is_empty() {
        ep.delete(fd)?;
    } else {
        let mut ev = EpollEvent::new(bands_to_events(reg.wanted), token(key, reg.gen));
        ep.modify(fd, &mut ev)?;
    }
    reg.installed = reg.wanted;
    Ok(())
}

impl EpollBackend {
    /// Drain the deferred-notify queue, applying each queued registration's
    /// reconciliation. Entries whose registration was unregistered (or
    /// already reconciled synchronously) in the meantime are skipped via the
    /// `queued` flag. A failed reconciliation goes back on the queue for the
    /// next flush, so `installed` keeps converging on `wanted`; the batch is
    /// taken up front so a persistently failing key is attempted once per
    /// round.
    fn flush_notify(&self, core: &mut Core) {
        let mut batch = {
            let st = state_mut(&mut core.backend_state);
            std::mem::take(&mut st.notify)
        };
        while let Some(key) = batch.pop_front() {
            match core.table.get_mut(key) {
                Some(reg) if reg.queued => reg.queued = false,
                _ => continue,
            }
            let ep = state_mut(&mut core.backend_state).ep.clone();
            if let Err(e) = reconcile(&ep, key, &mut core.table[key]) {
                log::warn!("epoll reconcile for slot {} failed: {}", key, e);
                core.table[key].queued = true;
                state_mut(&mut core.backend_state).notify.push_back(key);
            }
        }
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn init(&self, inner: &Arc<Inner>) -> Result<(), ReactorError> {
        let ep = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|source| ReactorError::Init { source })?;
        let (wake_rx, wake_tx) = wake_pipe().map_err(|source| ReactorError::Init { source })?;
        ep.add(&wake_rx, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(|source| ReactorError::Init { source })?;

        let mut core = inner.core.lock();
        core.backend_state = BackendState::Epoll(EpollState {
            ep: Arc::new(ep),
            notify: VecDeque::new(),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
        });
        Ok(())
    }

    fn poll(&self, inner: &Arc<Inner>, timeout: Option<Duration>) -> Result<(), ReactorError> {
        let (ep, wake_rx) = {
            let mut core = inner.core.lock();
            self.flush_notify(&mut core);
            let st = state_mut(&mut core.backend_state);
            (st.ep.clone(), st.wake_rx.as_raw_fd())
        };

        let mut events = [EpollEvent::empty(); EVENT_BATCH];
        let n = loop {
            match ep.wait(&mut events, epoll_timeout(timeout)) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(source) => return Err(ReactorError::WorkerUnhealthy { group: 0, source }),
            }
        };

        let mut core = inner.core.lock();
        for event in &events[..n] {
            if event.data() == WAKE_TOKEN {
                wake_drain(wake_rx);
                continue;
            }
            let (key, gen32) = untoken(event.data());
            let bands = events_to_bands(event.events());
            if bands.is_empty() {
                continue;
            }
            match core.table.get(key) {
                Some(reg) if reg.gen as u32 == gen32 && reg.registered => {
                    core.make_ready(key, bands);
                }
                _ => log::trace!("dropping stale epoll event for slot {}", key),
            }
        }
        Ok(())
    }

    fn register_fd(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        self.notify_fd(core, key);
        Ok(())
    }

    fn unregister_fd(&self, core: &mut Core, key: usize) {
        let core = &mut *core;
        let st = state_mut(&mut core.backend_state);
        let reg = &mut core.table[key];
        reg.queued = false;
        if !reg.installed.is_empty() {
            let fd = unsafe { BorrowedFd::borrow_raw(reg.fd) };
            if let Err(e) = st.ep.delete(fd) {
                // EBADF here means the application closed before
                // unregistering; the kernel already dropped the entry.
                log::debug!("epoll delete for fd {} failed: {}", reg.fd, e);
            }
            reg.installed = Bands::NONE;
        }
    }

    fn notify_fd(&self, core: &mut Core, key: usize) {
        let core = &mut *core;
        let st = state_mut(&mut core.backend_state);
        let reg = &mut core.table[key];
        if !reg.queued {
            reg.queued = true;
            st.notify.push_back(key);
        }
    }

    fn notify_fd_sync(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        core.table[key].queued = false;
        let ep = state_mut(&mut core.backend_state).ep.clone();
        reconcile(&ep, key, &mut core.table[key])
            .map_err(|source| ReactorError::BackendSync { source })
    }

    fn deinit(&self, inner: &Inner) {
        let mut core = inner.core.lock();
        core.backend_state = BackendState::Uninit;
    }

    fn event_rx_on(&self, _inner: &Inner) -> Result<(), ReactorError> {
        // The wake channel is registered from init onward.
        Ok(())
    }

    fn event_rx_off(&self, _inner: &Inner) {}

    fn event_send(&self, inner: &Inner) {
        let wake_tx = {
            let mut core = inner.core.lock();
            match &mut core.backend_state {
                BackendState::Epoll(st) => Some(st.wake_tx.clone()),
                _ => None,
            }
        };
        if let Some(tx) = wake_tx {
            wake_write(tx.as_raw_fd());
        }
    }
}
