//! Plain `poll(2)` fallback backend.
//!
//! Level-triggered and entirely stateless kernel-side: every poll round
//! submits the full descriptor set, so there is no deferred reconciliation
//! and `installed` tracks `wanted` immediately. Registrations get a dense
//! index slot into the backend's descriptor array; unregistration
//! swap-removes and patches the moved entry's slot.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::backend::{Backend, BackendState};
use crate::bands::Bands;
use crate::core::Core;
use crate::error::ReactorError;
use crate::reactor::Inner;
use crate::registration::BackendSlot;
use crate::utils::{wake_drain, wake_pipe, wake_write};

pub(crate) struct PollState {
    /// (key, generation) of every registration in the poll set, dense.
    regd: Vec<(usize, u64)>,
    wake_rx: OwnedFd,
    wake_tx: Arc<OwnedFd>,
}

pub(crate) struct PollBackend;

fn state_mut(bs: &mut BackendState) -> &mut PollState {
    match bs {
        BackendState::Poll(st) => st,
        _ => unreachable!("poll backend driving foreign state"),
    }
}

pub(crate) fn bands_to_events(wanted: Bands) -> PollFlags {
    let mut flags = PollFlags::empty();
    if wanted.contains(Bands::IN) {
        flags |= PollFlags::POLLIN;
    }
    if wanted.contains(Bands::OUT) {
        flags |= PollFlags::POLLOUT;
    }
    // POLLERR is delivered unconditionally; the error band needs no bit.
    flags
}

pub(crate) fn revents_to_bands(revents: PollFlags) -> Bands {
    let err = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
    let mut bands = Bands::NONE;
    if revents.intersects(PollFlags::POLLIN | err) {
        bands |= Bands::IN;
    }
    if revents.intersects(PollFlags::POLLOUT | err) {
        bands |= Bands::OUT;
    }
    if revents.intersects(err) {
        bands |= Bands::ERR;
    }
    bands
}

pub(crate) fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let mut ms = d.as_millis();
            // Sub-millisecond deadlines round up, not down to a spin.
            if ms == 0 && !d.is_zero() {
                ms = 1;
            }
            PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
        }
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn init(&self, inner: &Arc<Inner>) -> Result<(), ReactorError> {
        let (wake_rx, wake_tx) = wake_pipe().map_err(|source| ReactorError::Init { source })?;
        let mut core = inner.core.lock();
        core.backend_state = BackendState::Poll(PollState {
            regd: Vec::new(),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
        });
        Ok(())
    }

    fn poll(&self, inner: &Arc<Inner>, timeout: Option<Duration>) -> Result<(), ReactorError> {
        let (snapshot, wake_rx) = {
            let mut core = inner.core.lock();
            let core = &mut *core;
            let st = state_mut(&mut core.backend_state);
            let snapshot: Vec<(usize, u64, RawFd, Bands)> = st
                .regd
                .iter()
                .map(|&(key, gen)| {
                    let reg = &core.table[key];
                    (key, gen, reg.fd, reg.wanted)
                })
                .collect();
            (snapshot, st.wake_rx.as_raw_fd())
        };

        let mut pfds: Vec<PollFd> = snapshot
            .iter()
            .map(|&(_, _, fd, wanted)| {
                PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, bands_to_events(wanted))
            })
            .collect();
        pfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(wake_rx) },
            PollFlags::POLLIN,
        ));

        loop {
            match poll(&mut pfds, poll_timeout(timeout)) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(source) => return Err(ReactorError::WorkerUnhealthy { group: 0, source }),
            }
        }

        let revents: Vec<PollFlags> = pfds
            .iter()
            .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(pfds);

        if revents[snapshot.len()].contains(PollFlags::POLLIN) {
            wake_drain(wake_rx);
        }

        let mut core = inner.core.lock();
        for (i, &(key, gen, _, _)) in snapshot.iter().enumerate() {
            let bands = revents_to_bands(revents[i]);
            if !bands.is_empty() {
                core.make_ready_checked(key, gen, bands);
            }
        }
        Ok(())
    }

    fn register_fd(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        let core = &mut *core;
        let st = state_mut(&mut core.backend_state);
        let reg = &mut core.table[key];
        if !matches!(reg.slot, BackendSlot::Index(_)) {
            st.regd.push((key, reg.gen));
            reg.slot = BackendSlot::Index(st.regd.len() - 1);
        }
        reg.installed = reg.wanted;
        Ok(())
    }

    fn unregister_fd(&self, core: &mut Core, key: usize) {
        let core = &mut *core;
        let slot = core.table[key].slot;
        if let BackendSlot::Index(i) = slot {
            let st = state_mut(&mut core.backend_state);
            st.regd.swap_remove(i);
            if i < st.regd.len() {
                let (moved_key, _) = st.regd[i];
                core.table[moved_key].slot = BackendSlot::Index(i);
            }
        }
        let reg = &mut core.table[key];
        reg.installed = Bands::NONE;
        reg.slot = BackendSlot::None;
    }

    fn notify_fd(&self, core: &mut Core, key: usize) {
        // No kernel-side state to defer: the next round's descriptor set is
        // rebuilt from `wanted` anyway.
        let reg = &mut core.table[key];
        reg.installed = reg.wanted;
    }

    fn notify_fd_sync(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        self.notify_fd(core, key);
        Ok(())
    }

    fn deinit(&self, inner: &Inner) {
        let mut core = inner.core.lock();
        core.backend_state = BackendState::Uninit;
    }

    fn event_rx_on(&self, _inner: &Inner) -> Result<(), ReactorError> {
        // The wake channel is part of every poll set already.
        Ok(())
    }

    fn event_rx_off(&self, _inner: &Inner) {}

    fn event_send(&self, inner: &Inner) {
        let wake_tx = {
            let mut core = inner.core.lock();
            match &mut core.backend_state {
                BackendState::Poll(st) => Some(st.wake_tx.clone()),
                _ => None,
            }
        };
        if let Some(tx) = wake_tx {
            wake_write(tx.as_raw_fd());
        }
    }
}
