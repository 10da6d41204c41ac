//! The contract every polling backend implements.
//!
//! Backends differ wildly in kernel facility (readiness queues, plain
//! polling, multi-threaded polling) but present one strategy interface to
//! the reactor core. A backend is selected once at reactor construction and
//! never changes for the reactor's lifetime.
//!
//! Division of labor on a registration: the core owns `wanted`, the backend
//! owns `installed` and `slot`, and `poll` fills `ready` and the active
//! list. The backend's primary safety obligation is descriptor-number-reuse
//! avoidance: after `unregister_fd` returns, no kernel-side bookkeeping may
//! reference the descriptor number, and no event gathered for the old
//! registration may ever surface against a newer one.

use std::sync::Arc;
use std::time::Duration;

use crate::core::Core;
use crate::error::ReactorError;
use crate::reactor::Inner;

pub(crate) trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate backend resources into `core.backend_state`. Failure leaves
    /// the reactor unusable; nothing is retained.
    fn init(&self, inner: &Arc<Inner>) -> Result<(), ReactorError>;

    /// Block until a registered descriptor is ready, the timeout elapses, or
    /// a wake event arrives, then record ready bands and populate the active
    /// list. `None` blocks indefinitely. Must not hold the core lock across
    /// the blocking syscall, and must return promptly when a structural
    /// change or `event_send` interrupts it.
    fn poll(&self, inner: &Arc<Inner>, timeout: Option<Duration>) -> Result<(), ReactorError>;

    /// A registration's `wanted` went from empty to non-empty: assign slot
    /// data and bring `installed` in line (possibly deferred to poll time).
    fn register_fd(&self, core: &mut Core, key: usize) -> Result<(), ReactorError>;

    /// A registration's `wanted` became empty or it is being unregistered:
    /// drop all kernel-side state for the descriptor before returning.
    fn unregister_fd(&self, core: &mut Core, key: usize);

    /// Queue reconciliation of `wanted` vs `installed` for the next poll.
    /// Idempotent between polls.
    fn notify_fd(&self, core: &mut Core, key: usize);

    /// Reconcile `wanted` vs `installed` right now, for callers about to
    /// close the descriptor. An `Err` means the caller must not close the
    /// descriptor until the deferred path has caught up.
    fn notify_fd_sync(&self, core: &mut Core, key: usize) -> Result<(), ReactorError>;

    /// Release backend resources. Only valid once no registrations remain.
    fn deinit(&self, inner: &Inner);

    /// Arm delivery of cross-thread wake signals into this backend's poll.
    fn event_rx_on(&self, inner: &Inner) -> Result<(), ReactorError>;

    fn event_rx_off(&self, inner: &Inner);

    /// Post a wake signal, forcing a blocked `poll` on `inner` to return
    /// early. Callable from any thread; never takes the core lock for
    /// longer than a field read.
    fn event_send(&self, inner: &Inner);

    /// Whether the calling thread currently holds this backend's execution
    /// lock. Single-threaded backends have none.
    fn is_exec_holder(&self, _inner: &Inner) -> bool {
        false
    }

    /// Release the execution lock if the calling thread holds it. Called at
    /// the end of a dispatch pass; single-threaded backends have nothing to
    /// release.
    fn release_exec(&self, _inner: &Inner) {}
}
