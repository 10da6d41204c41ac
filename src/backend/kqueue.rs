//! kqueue backend (BSDs, macOS).
//!
//! Same shape as the epoll backend: a deferred notify queue flushed at poll
//! time, synchronous kernel-side deletion on unregister. Read and write
//! interest map to separate EVFILT_READ / EVFILT_WRITE filter entries, so a
//! reconcile may submit up to two change events per descriptor.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use nix::libc::timespec;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};

use crate::backend::{Backend, BackendState};
use crate::bands::Bands;
use crate::core::Core;
use crate::error::ReactorError;
use crate::reactor::Inner;
use crate::registration::Registration;
use crate::utils::{wake_drain, wake_pipe, wake_write};

const EVENT_BATCH: usize = 64;
const WAKE_UDATA: isize = -1;

const NO_TIME_WAIT: timespec = unsafe { std::mem::zeroed() };

pub(crate) struct KqueueState {
    kq: Arc<Kqueue>,
    notify: VecDeque<usize>,
    wake_rx: OwnedFd,
    wake_tx: Arc<OwnedFd>,
}

pub(crate) struct KqueueBackend;

fn state_mut(bs: &mut BackendState) -> &mut KqueueState {
    match bs {
        BackendState::Kqueue(st) => st,
        _ => unreachable!("kqueue backend driving foreign state"),
    }
}

fn udata(key: usize, gen: u64) -> isize {
    (((gen as u32 as u64) << 32) | (key as u32 as u64)) as isize
}

fn unudata(data: isize) -> (usize, u32) {
    let data = data as u64;
    ((data as u32) as usize, (data >> 32) as u32)
}

fn wait_timespec(timeout: Option<Duration>) -> Option<timespec> {
    timeout.map(|d| timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    })
}

/// Bring the kernel filters for one descriptor in line with `wanted`.
fn reconcile(kq: &Kqueue, key: usize, reg: &mut Registration) -> nix::Result<()> {
    if reg.installed == reg.wanted {
        return Ok(());
    }
    let mut changes = Vec::with_capacity(2);
    for (band, filter) in [
        (Bands::IN, EventFilter::EVFILT_READ),
        (Bands::OUT, EventFilter::EVFILT_WRITE),
    ] {
        let had = reg.installed.contains(band);
        let want = reg.wanted.contains(band);
        if want == had {
            continue;
        }
        let flags = if want { EventFlag::EV_ADD } else { EventFlag::EV_DELETE };
        changes.push(KEvent::new(
            reg.fd as _,
            filter,
            flags,
            FilterFlag::empty(),
            0,
            udata(key, reg.gen),
        ));
    }
    if !changes.is_empty() {
        kq.kevent(&changes, &mut [], Some(NO_TIME_WAIT))?;
    }
    reg.installed = reg.wanted;
    Ok(())
}

impl KqueueBackend {
    /// Failed reconciliations go back on the queue for the next flush; the
    /// batch is taken up front so each key is attempted once per round.
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
            let kq = state_mut(&mut core.backend_state).kq.clone();
            if let Err(e) = reconcile(&kq, key, &mut core.table[key]) {
                log::warn!("kqueue reconcile for slot {} failed: {}", key, e);
                core.table[key].queued = true;
                state_mut(&mut core.backend_state).notify.push_back(key);
            }
        }
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn init(&self, inner: &Arc<Inner>) -> Result<(), ReactorError> {
        let kq = Kqueue::new().map_err(|source| ReactorError::Init { source })?;
        let (wake_rx, wake_tx) = wake_pipe().map_err(|source| ReactorError::Init { source })?;
        let wake_ev = KEvent::new(
            wake_rx.as_raw_fd() as _,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD,
            FilterFlag::empty(),
            0,
            WAKE_UDATA,
        );
        kq.kevent(&[wake_ev], &mut [], Some(NO_TIME_WAIT))
            .map_err(|source| ReactorError::Init { source })?;

        let mut core = inner.core.lock();
        core.backend_state = BackendState::Kqueue(KqueueState {
            kq: Arc::new(kq),
            notify: VecDeque::new(),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
        });
        Ok(())
    }

    fn poll(&self, inner: &Arc<Inner>, timeout: Option<Duration>) -> Result<(), ReactorError> {
        let (kq, wake_rx) = {
            let mut core = inner.core.lock();
            self.flush_notify(&mut core);
            let st = state_mut(&mut core.backend_state);
            (st.kq.clone(), st.wake_rx.as_raw_fd())
        };

        let mut events: [KEvent; EVENT_BATCH] = unsafe { std::mem::zeroed() };
        let n = loop {
            match kq.kevent(&[], &mut events, wait_timespec(timeout)) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(source) => return Err(ReactorError::WorkerUnhealthy { group: 0, source }),
            }
        };

        let mut core = inner.core.lock();
        for event in &events[..n] {
            if event.udata() == WAKE_UDATA {
                wake_drain(wake_rx);
                continue;
            }
            let mut bands = match event.filter() {
                Ok(EventFilter::EVFILT_READ) => Bands::IN,
                Ok(EventFilter::EVFILT_WRITE) => Bands::OUT,
                _ => continue,
            };
            if event.flags().intersects(EventFlag::EV_EOF | EventFlag::EV_ERROR) {
                bands |= Bands::ERR;
            }
            let (key, gen32) = unudata(event.udata());
            match core.table.get(key) {
                Some(reg) if reg.gen as u32 == gen32 && reg.registered => {
                    core.make_ready(key, bands);
                }
                _ => log::trace!("dropping stale kevent for slot {}", key),
            }
        }
        Ok(())
    }

    fn register_fd(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        self.notify_fd(core, key);
        Ok(())
    }

    fn unregister_fd(&self, core: &mut Core, key: usize) {
        core.table[key].queued = false;
        let kq = state_mut(&mut core.backend_state).kq.clone();
        let reg = &mut core.table[key];
        let wanted = reg.wanted;
        reg.wanted = Bands::NONE;
        if let Err(e) = reconcile(&kq, key, reg) {
            log::debug!("kqueue delete for fd {} failed: {}", reg.fd, e);
            reg.installed = Bands::NONE;
        }
        reg.wanted = wanted;
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
        let kq = state_mut(&mut core.backend_state).kq.clone();
        reconcile(&kq, key, &mut core.table[key])
            .map_err(|source| ReactorError::BackendSync { source })
    }

    fn deinit(&self, inner: &Inner) {
        let mut core = inner.core.lock();
        core.backend_state = BackendState::Uninit;
    }

    fn event_rx_on(&self, _inner: &Inner) -> Result<(), ReactorError> {
        Ok(())
    }

    fn event_rx_off(&self, _inner: &Inner) {}

    fn event_send(&self, inner: &Inner) {
        let wake_tx = {
            let mut core = inner.core.lock();
            match &mut core.backend_state {
                BackendState::Kqueue(st) => Some(st.wake_tx.clone()),
                _ => None,
            }
        };
        if let Some(tx) = wake_tx {
            wake_write(tx.as_raw_fd());
        }
    }
}
