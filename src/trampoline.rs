//! The splice trampoline: a process-wide intermediate pipe pair used
//! only to bridge socket→file transfers where a direct socket→file
//! splice is not supported. Scoped `thread_local` rather than a global
//! behind a lock, since each worker owns its queues with no
//! cross-thread sharing of a live queue.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;

use crate::platform;

#[cfg(target_os = "linux")]
const PIPE_HINT_BYTES: libc::c_int = 256 * 1024;

thread_local! {
  static TRAMPOLINE: RefCell<Option<(RawFd, RawFd)>> = const { RefCell::new(None) };
}

/// Ensures the trampoline pipe exists, creating it on first use.
pub fn ensure() -> io::Result<()> {
  TRAMPOLINE.with(|cell| {
    let mut slot = cell.borrow_mut();
    if slot.is_none() {
      let (read_fd, write_fd) = platform::pipe_cloexec()?;
      #[cfg(target_os = "linux")]
      unsafe {
        libc::fcntl(read_fd, libc::F_SETPIPE_SZ, PIPE_HINT_BYTES);
      }
      *slot = Some((read_fd, write_fd));
    }
    Ok(())
  })
}

/// Runs `f` with the trampoline's `(read_fd, write_fd)` pair if one is
/// available; `None` if the trampoline was never initialized, in which
/// case the caller falls back to its non-trampoline path.
///
/// Copies the pair out and drops the borrow before calling `f`: `f` may
/// itself touch the trampoline (e.g. on error, draining the pipe resets
/// it), and holding the `Ref` across that call would panic on the
/// resulting `borrow_mut`.
pub fn with_pipe<T>(f: impl FnOnce(RawFd, RawFd) -> T) -> Option<T> {
  let pair = TRAMPOLINE.with(|cell| *cell.borrow());
  pair.map(|(r, w)| f(r, w))
}

/// Tears down the trampoline pipe. Must be called after `fork()` and
/// on graceful restart so the child does not inherit descriptors that
/// alias the parent's trampoline.
pub fn reset() {
  TRAMPOLINE.with(|cell| {
    if let Some((r, w)) = cell.borrow_mut().take() {
      platform::close(r);
      platform::close(w);
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ensure_then_reset_is_idempotent() {
    reset();
    ensure().unwrap();
    assert!(with_pipe(|_, _| ()).is_some());
    reset();
    assert!(with_pipe(|_, _| ()).is_none());
    reset();
  }
}
