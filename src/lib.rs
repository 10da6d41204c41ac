//! dynein: an event-driven I/O reactor over pluggable polling backends.
//!
//! Descriptors are registered with up to three per-band callbacks (input,
//! output, error); [`Reactor::run`] multiplexes readiness through the
//! platform's kernel facility (epoll, kqueue, or `poll(2)` in single- or
//! multi-worker form) and dispatches callbacks on the owning thread, or
//! under a global execution lock in multi-worker mode so user code is never
//! run concurrently with itself.
//!
//! Callbacks may freely re-enter the reactor: registering new descriptors,
//! updating or unregistering existing ones (their own included), and asking
//! the loop to quit are all legal mid-dispatch. The only cross-thread
//! surface is [`ReactorWaker`].

mod backend;
mod bands;
mod context;
mod core;
mod error;
mod hooks;
mod registration;
mod reactor;
mod utils;

pub use backend::BackendKind;
pub use bands::Bands;
pub use error::ReactorError;
pub use hooks::{DeadlineSource, TaskQueue};
pub use reactor::{Reactor, ReactorWaker};
pub use registration::{FdHandle, Handler};
pub use utils::{set_fd_cloexec, set_fd_nonblocking};
