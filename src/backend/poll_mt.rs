//! Multi-worker `poll(2)` backend.
//!
//! Registrations are partitioned into fixed-capacity groups of seven
//! descriptors plus one control-channel slot. Group 0 is serviced by the
//! owning thread inside `Backend::poll`; every further group gets a
//! dedicated worker thread blocking in its own `poll(2)` call. Polling is
//! parallel, callback execution is not: before marking anything ready a
//! thread must take the shared execution lock (a re-entrant owner/depth
//! counter guarded by the coordinator mutex and its "exec free" condition
//! variable), and it holds the lock across the whole dispatch pass. N-way
//! parallel waiting, 1-way serial user code.
//!
//! Structural changes mutate group membership under the coordinator mutex
//! and write the owning group's control pipe, so a blocked worker promptly
//! rebuilds its local descriptor set. Newly created groups are queued on a
//! pending list; the owning thread spawns their workers on its next poll
//! pass and teardown waits on the "groups quiesced" condition variable for
//! a consistency point.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Condvar, Mutex};

use crate::backend::poll::{bands_to_events, poll_timeout, revents_to_bands};
use crate::backend::{Backend, BackendState};
use crate::bands::Bands;
use crate::context;
use crate::core::Core;
use crate::error::ReactorError;
use crate::reactor::{run_active, Inner};
use crate::registration::BackendSlot;
use crate::utils::{wake_drain, wake_pipe, wake_write};

/// Descriptors per group, not counting the control channel slot.
pub(crate) const MAX_GROUP_FDS: usize = 7;

#[derive(Clone, Copy)]
struct Member {
    key: usize,
    gen: u64,
    fd: RawFd,
    wanted: Bands,
}

struct Group {
    upd_rx: OwnedFd,
    upd_tx: OwnedFd,
    /// Dense member sequence; indices are slot data and stay stable while a
    /// slot is occupied.
    members: Vec<Member>,
    /// Thread id of the group's poll worker, once spawned.
    worker: Option<ThreadId>,
    shutdown: bool,
}

impl Group {
    fn new() -> nix::Result<Group> {
        let (upd_rx, upd_tx) = wake_pipe()?;
        Ok(Group {
            upd_rx,
            upd_tx,
            members: Vec::with_capacity(MAX_GROUP_FDS),
            worker: None,
            shutdown: false,
        })
    }

    fn wake(&self) {
        wake_write(self.upd_tx.as_raw_fd());
    }
}

pub(crate) struct MtState {
    groups: Vec<Option<Group>>,
    /// Groups awaiting first-time worker setup or acknowledgement.
    pending: Vec<usize>,
    /// Groups whose worker failed unrecoverably. All faults are retained
    /// (deduplicated), not just the most recent one.
    unhealthy: Vec<usize>,
    exec_owner: Option<ThreadId>,
    exec_depth: u32,
    event_rx_active: bool,
    event_rx: Option<OwnedFd>,
    event_tx: Option<Arc<OwnedFd>>,
    shutdown: bool,
}

pub(crate) struct MtShared {
    state: Mutex<MtState>,
    /// Signaled when the pending list empties or a group retires.
    groups_quiesced: Condvar,
    /// Signaled when the execution lock is released.
    exec_free: Condvar,
    inner: OnceLock<Weak<Inner>>,
}

impl MtShared {
    fn exec_acquire(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.exec_owner == Some(me) {
            st.exec_depth += 1;
            return;
        }
        while st.exec_owner.is_some() {
            self.exec_free.wait(&mut st);
        }
        st.exec_owner = Some(me);
        st.exec_depth = 1;
    }

    fn exec_release(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.exec_owner != Some(me) {
            return;
        }
        st.exec_depth -= 1;
        if st.exec_depth == 0 {
            st.exec_owner = None;
            self.exec_free.notify_one();
        }
    }

    fn exec_held(&self) -> bool {
        self.state.lock().exec_owner == Some(thread::current().id())
    }

    /// Block until every worker group has retired. The caller may itself be
    /// the worker of one of these groups (a worker thread can drop the last
    /// reactor handle), so its own group is excluded: it retires on the
    /// worker's next loop iteration, after this call has returned. Bounded
    /// as a last resort.
    fn wait_quiesced(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        for _ in 0..50 {
            let busy = st
                .groups
                .iter()
                .skip(1)
                .any(|g| g.as_ref().is_some_and(|g| g.worker != Some(me)));
            if !busy {
                return;
            }
            let _ = self
                .groups_quiesced
                .wait_for(&mut st, Duration::from_millis(100));
        }
        log::warn!("timed out waiting for poll workers to quiesce");
    }

    fn nudge_owner(st: &MtState) {
        if let Some(main) = st.groups.first().and_then(Option::as_ref) {
            main.wake();
        }
    }
}

pub(crate) struct PollMtBackend {
    shared: OnceLock<Arc<MtShared>>,
}

impl PollMtBackend {
    pub(crate) fn new() -> Self {
        PollMtBackend {
            shared: OnceLock::new(),
        }
    }

    fn shared(&self) -> Option<&Arc<MtShared>> {
        self.shared.get()
    }
}

fn spawn_worker(shared: &Arc<MtShared>, st: &mut MtState, gi: usize) {
    let worker_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("dynein-mt-{}", gi))
        .spawn(move || worker_loop(worker_shared, gi));
    match spawned {
        Ok(handle) => {
            if let Some(g) = st.groups[gi].as_mut() {
                g.worker = Some(handle.thread().id());
            }
        }
        Err(e) => log::error!("failed to spawn poll worker for group {}: {}", gi, e),
    }
}

fn retire(shared: &MtShared, st: &mut MtState, gi: usize) {
    if gi < st.groups.len() {
        st.groups[gi] = None;
    }
    st.pending.retain(|&p| p != gi);
    shared.groups_quiesced.notify_all();
}

fn worker_loop(shared: Arc<MtShared>, gi: usize) {
    loop {
        let (members, upd_rx) = {
            let mut st = shared.state.lock();
            let done = st.shutdown
                || st
                    .groups
                    .get(gi)
                    .and_then(Option::as_ref)
                    .map_or(true, |g| g.shutdown);
            if done {
                retire(&shared, &mut st, gi);
                return;
            }
            if let Some(pos) = st.pending.iter().position(|&p| p == gi) {
                st.pending.swap_remove(pos);
                shared.groups_quiesced.notify_all();
            }
            let g = st.groups[gi].as_ref().expect("live group");
            (g.members.clone(), g.upd_rx.as_raw_fd())
        };

        let mut pfds: Vec<PollFd> = members
            .iter()
            .map(|m| PollFd::new(unsafe { BorrowedFd::borrow_raw(m.fd) }, bands_to_events(m.wanted)))
            .collect();
        pfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(upd_rx) },
            PollFlags::POLLIN,
        ));

        match poll(&mut pfds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("poll worker for group {} failed: {}", gi, e);
                let mut st = shared.state.lock();
                if let Some(g) = st.groups.get_mut(gi).and_then(Option::as_mut) {
                    g.worker = None;
                }
                if !st.unhealthy.contains(&gi) {
                    st.unhealthy.push(gi);
                }
                MtShared::nudge_owner(&st);
                return;
            }
        }

        let revents: Vec<PollFlags> = pfds
            .iter()
            .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(pfds);

        if revents[members.len()].contains(PollFlags::POLLIN) {
            // Membership changed under us. Drain the control channel and
            // rebuild; any real readiness is level-triggered and will show
            // up again on the fresh descriptor set.
            wake_drain(upd_rx);
            continue;
        }

        let ready: Vec<(Member, Bands)> = members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let bands = revents_to_bands(revents[i]);
                (!bands.is_empty()).then_some((*m, bands))
            })
            .collect();
        if ready.is_empty() {
            continue;
        }

        let Some(inner) = shared.inner.get().and_then(Weak::upgrade) else {
            // Reactor teardown raced our readiness snapshot. Retire now;
            // nobody will flag this group's shutdown bit anymore.
            let mut st = shared.state.lock();
            retire(&shared, &mut st, gi);
            return;
        };
        shared.exec_acquire();
        {
            let mut core = inner.core.lock();
            for (m, bands) in &ready {
                core.make_ready_checked(m.key, m.gen, *bands);
            }
        }
        let ctx = context::enter(&inner);
        run_active(&inner);
        drop(ctx);
        shared.exec_release();
    }
}

impl Backend for PollMtBackend {
    fn name(&self) -> &'static str {
        "poll-mt"
    }

    fn init(&self, inner: &Arc<Inner>) -> Result<(), ReactorError> {
        let main = Group::new().map_err(|source| ReactorError::Init { source })?;
        let shared = Arc::new(MtShared {
            state: Mutex::new(MtState {
                groups: vec![Some(main)],
                pending: Vec::new(),
                unhealthy: Vec::new(),
                exec_owner: None,
                exec_depth: 0,
                event_rx_active: false,
                event_rx: None,
                event_tx: None,
                shutdown: false,
            }),
            groups_quiesced: Condvar::new(),
            exec_free: Condvar::new(),
            inner: OnceLock::new(),
        });
        let _ = shared.inner.set(Arc::downgrade(inner));
        let _ = self.shared.set(shared.clone());

        let mut core = inner.core.lock();
        core.backend_state = BackendState::PollMt(shared);
        Ok(())
    }

    fn poll(&self, inner: &Arc<Inner>, timeout: Option<Duration>) -> Result<(), ReactorError> {
        let Some(shared) = self.shared() else {
            return Ok(());
        };
        if shared.exec_held() {
            // Held since the previous round's dispatch pass.
            shared.exec_release();
        }

        let (members, upd_rx, event_rx) = {
            let mut st = shared.state.lock();

            // Coordinator duties: spawn workers for groups awaiting setup,
            // rebuild groups whose worker faulted.
            let pending = st.pending.clone();
            for gi in pending {
                let needs = st
                    .groups
                    .get(gi)
                    .and_then(Option::as_ref)
                    .is_some_and(|g| g.worker.is_none() && !g.shutdown);
                if needs {
                    spawn_worker(shared, &mut st, gi);
                }
            }
            let unhealthy = std::mem::take(&mut st.unhealthy);
            for gi in unhealthy {
                let (rebuild, retire_now) = match st.groups.get(gi).and_then(Option::as_ref) {
                    Some(g) if g.worker.is_some() => (false, false),
                    Some(g) => (!g.shutdown && !g.members.is_empty(), g.members.is_empty()),
                    None => (false, false),
                };
                if rebuild {
                    log::warn!("rebuilding poll worker for group {}", gi);
                    spawn_worker(shared, &mut st, gi);
                } else if retire_now {
                    retire(shared, &mut st, gi);
                }
            }

            let Some(main) = st.groups.first().and_then(Option::as_ref) else {
                return Ok(());
            };
            let event_rx = st
                .event_rx_active
                .then(|| st.event_rx.as_ref().map(|fd| fd.as_raw_fd()))
                .flatten();
            (main.members.clone(), main.upd_rx.as_raw_fd(), event_rx)
        };

        let mut pfds: Vec<PollFd> = members
            .iter()
            .map(|m| PollFd::new(unsafe { BorrowedFd::borrow_raw(m.fd) }, bands_to_events(m.wanted)))
            .collect();
        pfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(upd_rx) },
            PollFlags::POLLIN,
        ));
        if let Some(fd) = event_rx {
            pfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            ));
        }

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

        if revents[members.len()].contains(PollFlags::POLLIN) {
            wake_drain(upd_rx);
        }
        if let (Some(fd), Some(rev)) = (event_rx, revents.get(members.len() + 1)) {
            if rev.contains(PollFlags::POLLIN) {
                wake_drain(fd);
            }
        }

        // Serialize with the workers before touching the active list; the
        // lock stays held through the caller's dispatch pass.
        shared.exec_acquire();
        let mut core = inner.core.lock();
        for (i, m) in members.iter().enumerate() {
            let bands = revents_to_bands(revents[i]);
            if !bands.is_empty() {
                core.make_ready_checked(m.key, m.gen, bands);
            }
        }
        Ok(())
    }

    fn register_fd(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        let Some(shared) = self.shared() else {
            return Err(ReactorError::InvalidArgument("backend not initialized"));
        };
        let mut st = shared.state.lock();
        let reg = &mut core.table[key];

        // The slot is always free here: a collapsed-to-empty interest set
        // goes through unregister_fd, which releases it.
        debug_assert_eq!(reg.slot, BackendSlot::None);

        let member = Member {
            key,
            gen: reg.gen,
            fd: reg.fd,
            wanted: reg.wanted,
        };

        // First fit; group count scales with descriptor count, not load.
        let gi = st
            .groups
            .iter()
            .position(|g| {
                g.as_ref()
                    .is_some_and(|g| !g.shutdown && g.members.len() < MAX_GROUP_FDS)
            })
            .map(Ok)
            .unwrap_or_else(|| -> Result<usize, ReactorError> {
                let grp = Group::new().map_err(|source| ReactorError::Init { source })?;
                let gi = match st.groups.iter().position(Option::is_none) {
                    Some(free) => {
                        st.groups[free] = Some(grp);
                        free
                    }
                    None => {
                        st.groups.push(Some(grp));
                        st.groups.len() - 1
                    }
                };
                st.pending.push(gi);
                Ok(gi)
            })?;

        let g = st.groups[gi].as_mut().expect("first-fit group");
        g.members.push(member);
        reg.slot = BackendSlot::Group {
            grp: gi,
            idx: g.members.len() - 1,
        };
        reg.installed = reg.wanted;
        g.wake();
        MtShared::nudge_owner(&st);
        Ok(())
    }

    fn unregister_fd(&self, core: &mut Core, key: usize) {
        let Some(shared) = self.shared() else {
            return;
        };
        let mut st = shared.state.lock();
        let slot = core.table[key].slot;

        if let BackendSlot::Group { grp, idx } = slot {
            if let Some(g) = st.groups.get_mut(grp).and_then(Option::as_mut) {
                g.members.swap_remove(idx);
                if idx < g.members.len() {
                    let moved = g.members[idx];
                    if let Some(mreg) = core.table.get_mut(moved.key) {
                        mreg.slot = BackendSlot::Group { grp, idx };
                    }
                }
                g.wake();
                if grp != 0 && g.members.is_empty() {
                    g.shutdown = true;
                    g.wake();
                    if g.worker.is_none() {
                        retire(shared, &mut st, grp);
                    }
                }
            }
            MtShared::nudge_owner(&st);
        }

        let reg = &mut core.table[key];
        reg.installed = Bands::NONE;
        reg.slot = BackendSlot::None;
    }

    fn notify_fd(&self, core: &mut Core, key: usize) {
        let Some(shared) = self.shared() else {
            return;
        };
        let mut st = shared.state.lock();
        let reg = &mut core.table[key];
        if let BackendSlot::Group { grp, idx } = reg.slot {
            if let Some(g) = st.groups.get_mut(grp).and_then(Option::as_mut) {
                g.members[idx].wanted = reg.wanted;
                g.wake();
            }
        }
        reg.installed = reg.wanted;
    }

    fn notify_fd_sync(&self, core: &mut Core, key: usize) -> Result<(), ReactorError> {
        // poll(2) keeps no kernel-side registration, so there is nothing a
        // descriptor close can go stale against: the membership snapshot is
        // generation-checked and the worker rebuilds on the control-channel
        // wake. The update above is therefore already synchronous enough.
        self.notify_fd(core, key);
        Ok(())
    }

    fn deinit(&self, inner: &Inner) {
        let Some(shared) = self.shared() else {
            return;
        };
        {
            let mut st = shared.state.lock();
            st.shutdown = true;
            st.event_rx_active = false;
            for g in st.groups.iter().flatten() {
                g.wake();
            }
        }
        shared.wait_quiesced();
        {
            let mut st = shared.state.lock();
            st.groups.clear();
            st.event_rx = None;
            st.event_tx = None;
        }
        inner.core.lock().backend_state = BackendState::Uninit;
    }

    fn event_rx_on(&self, _inner: &Inner) -> Result<(), ReactorError> {
        let Some(shared) = self.shared() else {
            return Err(ReactorError::InvalidArgument("backend not initialized"));
        };
        let mut st = shared.state.lock();
        if st.event_rx.is_none() {
            let (rx, tx) = wake_pipe().map_err(|source| ReactorError::Init { source })?;
            st.event_rx = Some(rx);
            st.event_tx = Some(Arc::new(tx));
        }
        st.event_rx_active = true;
        MtShared::nudge_owner(&st);
        Ok(())
    }

    fn event_rx_off(&self, _inner: &Inner) {
        if let Some(shared) = self.shared() {
            let mut st = shared.state.lock();
            st.event_rx_active = false;
            MtShared::nudge_owner(&st);
        }
    }

    fn event_send(&self, _inner: &Inner) {
        let Some(shared) = self.shared() else {
            return;
        };
        let st = shared.state.lock();
        match &st.event_tx {
            Some(tx) => wake_write(tx.as_raw_fd()),
            // Not armed; the control channel still gets the owner's poll
            // out of its syscall.
            None => MtShared::nudge_owner(&st),
        }
    }

    fn is_exec_holder(&self, _inner: &Inner) -> bool {
        self.shared().is_some_and(|s| s.exec_held())
    }

    fn release_exec(&self, _inner: &Inner) {
        if let Some(shared) = self.shared() {
            if shared.exec_held() {
                shared.exec_release();
            }
        }
    }
}
