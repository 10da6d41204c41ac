use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

pub fn set_fd_nonblocking(fd: RawFd) -> nix::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    let prev_flags = OFlag::from_bits_truncate(bits);
    fcntl(fd, FcntlArg::F_SETFL(prev_flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub fn set_fd_cloexec(fd: RawFd) -> nix::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFD)?;
    let prev_flags = FdFlag::from_bits_truncate(bits);
    fcntl(fd, FcntlArg::F_SETFD(prev_flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// A nonblocking cloexec pipe used as a wake channel: backends keep the read
/// end in their poll set, and anything needing to interrupt a blocked poll
/// writes a byte to the write end.
pub(crate) fn wake_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
}

/// Post a wakeup. A full pipe means a wakeup is already pending, which is
/// just as good.
pub(crate) fn wake_write(fd: RawFd) {
    let buf = [1u8];
    loop {
        match nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, &buf) {
            Ok(_) | Err(Errno::EAGAIN) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("wake pipe write failed: {}", e);
                return;
            }
        }
    }
}

/// Drain all pending wakeups from the read end of a wake channel.
pub(crate) fn wake_drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) | Err(Errno::EAGAIN) => return,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("wake pipe read failed: {}", e);
                return;
            }
        }
    }
}
