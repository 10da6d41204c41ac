//! Polling backend selection.
//!
//! One readiness-queue backend per platform (epoll on Linux, kqueue on the
//! BSDs and macOS) plus two portable `poll(2)` backends, one single-threaded
//! and one fanning the descriptor set out over worker threads. The default
//! is the platform readiness queue; `DYNEIN_POLL_METHOD` overrides it by
//! name.

use std::env;
use std::sync::Arc;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod kqueue;
mod interface;
mod poll;
mod poll_mt;

pub(crate) use interface::Backend;

#[cfg(target_os = "linux")]
use epoll::{EpollBackend, EpollState};
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
use kqueue::{KqueueBackend, KqueueState};
use poll::{PollBackend, PollState};
use poll_mt::{MtShared, PollMtBackend};

/// Per-backend bookkeeping, held inside the core so backend methods that
/// already hold the core lock can reach it without further locking.
pub(crate) enum BackendState {
    Uninit,
    #[cfg(target_os = "linux")]
    Epoll(EpollState),
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    Kqueue(KqueueState),
    Poll(PollState),
    PollMt(Arc<MtShared>),
}

/// The polling methods a reactor can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    #[cfg(target_os = "linux")]
    Epoll,
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    Kqueue,
    Poll,
    PollMt,
}

impl BackendKind {
    /// The platform default, unless `DYNEIN_POLL_METHOD` names another
    /// method. An unrecognized override is logged and ignored.
    pub fn default_kind() -> BackendKind {
        if let Ok(name) = env::var("DYNEIN_POLL_METHOD") {
            match Self::from_name(&name) {
                Some(kind) => return kind,
                None => log::warn!("unknown poll method {:?}, using platform default", name),
            }
        }
        Self::platform_default()
    }

    fn from_name(name: &str) -> Option<BackendKind> {
        match name {
            #[cfg(target_os = "linux")]
            "epoll" => Some(BackendKind::Epoll),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            "kqueue" => Some(BackendKind::Kqueue),
            "poll" => Some(BackendKind::Poll),
            "poll-mt" => Some(BackendKind::PollMt),
            _ => None,
        }
    }

    #[cfg(target_os = "linux")]
    fn platform_default() -> BackendKind {
        BackendKind::Epoll
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    fn platform_default() -> BackendKind {
        BackendKind::Kqueue
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    fn platform_default() -> BackendKind {
        BackendKind::Poll
    }

    pub(crate) fn strategy(self) -> Box<dyn Backend> {
        match self {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Box::new(EpollBackend),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            BackendKind::Kqueue => Box::new(KqueueBackend),
            BackendKind::Poll => Box::new(PollBackend),
            BackendKind::PollMt => Box::new(PollMtBackend::new()),
        }
    }
}
