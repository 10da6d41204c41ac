//! Narrow interfaces to the run loop's external collaborators.
//!
//! The timer-deadline subsystem and the deferred-task queue are not part of
//! the reactor core; the run loop consumes them through these traits only.
//! The timer source's next deadline bounds each blocking poll, and pending
//! deferred tasks force a zero-deadline poll instead of blocking.

use std::time::Duration;

use crate::reactor::Reactor;

/// The timer-deadline subsystem as seen by the run loop.
pub trait DeadlineSource: Send {
    /// Time until the earliest timed callback is due, or `None` if no timer
    /// is armed.
    fn next_deadline(&mut self) -> Option<Duration>;

    /// Fire every timed callback that is due. Called once per run-loop
    /// iteration, after dispatch.
    fn expire_due(&mut self, reactor: &Reactor);
}

/// The deferred-task queue as seen by the run loop.
pub trait TaskQueue: Send {
    fn has_pending(&self) -> bool;

    /// Run one pending task. Called at most once per run-loop iteration.
    fn run_one(&mut self, reactor: &Reactor);
}
