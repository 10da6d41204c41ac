use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by the reactor.
///
/// Structural misuse is reported synchronously to the caller. Faults inside a
/// blocked poll are retried where possible and escalated here only when the
/// backend cannot recover.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Backend resource allocation failed at startup. Fatal to the reactor
    /// instance; no partial state is retained.
    #[error("backend initialization failed")]
    Init {
        #[source]
        source: Errno,
    },

    /// The caller supplied a registration with no callbacks, used a stale or
    /// doubly-unregistered handle, or made a structural call from a thread
    /// that does not own the reactor.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The backend could not synchronously reconcile kernel state ahead of a
    /// descriptor close. The caller must not close the descriptor until the
    /// deferred reconciliation path has completed.
    #[error("synchronous backend reconciliation failed")]
    BackendSync {
        #[source]
        source: Errno,
    },

    /// A polling worker failed unrecoverably. Group 0 is the group serviced
    /// by the owning thread itself.
    #[error("poll worker for group {group} failed")]
    WorkerUnhealthy {
        group: usize,
        #[source]
        source: Errno,
    },
}
