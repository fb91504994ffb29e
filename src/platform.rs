//! The platform abstraction consumed by the transfer engine: cloexec
//! open/pipe/dup, `mkostemp`, and the kernel-assisted transfer
//! primitives (`sendfile`, `splice`, `pwrite`/`pwritev`, `mmap`).
//!
//! Every wrapper here retries `EINTR` internally; callers never see it.
//! `EAGAIN`/`EWOULDBLOCK` and `EINVAL` (splice-not-applicable) are
//! surfaced as-is so the transfer engine can apply its own fallback
//! policy (spill rollover, write-chunk fallback chain).

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::macros::syscall;

fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
  loop {
    match op() {
      Err(e) if e.kind() == io::ErrorKind::Interrupted => {
        tracing::trace!("syscall interrupted, retrying");
        continue;
      }
      other => return other,
    }
  }
}

/// Opens `path` with `O_CLOEXEC` always set in addition to `flags`.
pub fn open_cloexec(path: &Path, flags: i32, mode: libc::mode_t) -> io::Result<RawFd> {
  let c_path = CString::new(path.as_os_str().as_bytes())
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
  retry_eintr(|| syscall!(open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode)).map(|fd| fd as RawFd))
}

/// Creates a unique file under `dir` using the `<prefix>-XXXXXX`
/// template `mkostemp` convention, returning the opened fd and the
/// realized path.
pub fn mkostemp_unique(
  dir: &Path,
  prefix: &str,
  extra_flags: i32,
) -> io::Result<(RawFd, std::path::PathBuf)> {
  let mut template = dir.join(format!("{prefix}-XXXXXX"));
  let mut bytes = template.as_os_str().as_bytes().to_vec();
  bytes.push(0);
  let fd = {
    let ptr = bytes.as_mut_ptr() as *mut libc::c_char;
    #[allow(unused_unsafe)]
    let res = unsafe { libc::mkostemp(ptr, extra_flags | libc::O_CLOEXEC) };
    if res == -1 {
      return Err(io::Error::last_os_error());
    }
    res as RawFd
  };
  bytes.pop();
  template = std::path::PathBuf::from(std::ffi::OsStr::from_bytes(&bytes));
  Ok((fd, template))
}

pub fn pipe_cloexec() -> io::Result<(RawFd, RawFd)> {
  let mut fds = [0i32; 2];
  syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
  Ok((fds[0], fds[1]))
}

pub fn dup_cloexec(fd: RawFd) -> io::Result<RawFd> {
  syscall!(fcntl(fd, libc::F_DUPFD_CLOEXEC, 0)).map(|fd| fd as RawFd)
}

pub fn close(fd: RawFd) {
  let _ = syscall!(close(fd));
}

/// `pwrite` at a fixed offset, retrying `EINTR`. Returns the number of
/// bytes written (may be less than `buf.len()` on a partial write).
pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
  retry_eintr(|| {
    syscall!(pwrite(
      fd,
      buf.as_ptr() as *const libc::c_void,
      buf.len(),
      offset as libc::off_t,
    ))
    .map(|n| n as usize)
  })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
  retry_eintr(|| syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize))
}

/// Unpositioned `read`, retrying `EINTR`. Used to drain the splice
/// trampoline's pipe when a direct splice path isn't available.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
  retry_eintr(|| syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize))
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
  retry_eintr(|| {
    syscall!(pread(
      fd,
      buf.as_mut_ptr() as *mut libc::c_void,
      buf.len(),
      offset as libc::off_t,
    ))
    .map(|n| n as usize)
  })
}

/// Gathered positional write of up to 16 iovecs in one syscall.
pub fn pwritev(fd: RawFd, iovecs: &[&[u8]], offset: i64) -> io::Result<usize> {
  debug_assert!(iovecs.len() <= 16);
  let raw: Vec<libc::iovec> = iovecs
    .iter()
    .map(|b| libc::iovec {
      iov_base: b.as_ptr() as *mut libc::c_void,
      iov_len: b.len(),
    })
    .collect();
  retry_eintr(|| {
    syscall!(pwritev(fd, raw.as_ptr(), raw.len() as i32, offset as libc::off_t)).map(|n| n as usize)
  })
}

/// `sendfile(dst, src, &offset, count)`. `None` means the operation is
/// not supported for this fd pair on this platform.
#[cfg(target_os = "linux")]
pub fn sendfile(dst: RawFd, src: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
  let mut off = *offset as libc::off_t;
  let r = retry_eintr(|| syscall!(sendfile(dst, src, &mut off, count)).map(|n| n as usize));
  *offset = off as i64;
  r
}

#[cfg(not(target_os = "linux"))]
pub fn sendfile(_dst: RawFd, _src: RawFd, _offset: &mut i64, _count: usize) -> io::Result<usize> {
  Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// `splice(src, &soff, dst, &doff, count, flags)`.
#[cfg(target_os = "linux")]
pub fn splice(
  src: RawFd,
  src_offset: Option<&mut i64>,
  dst: RawFd,
  dst_offset: Option<&mut i64>,
  count: usize,
  flags: libc::c_uint,
) -> io::Result<usize> {
  let mut soff_store: libc::loff_t = src_offset.as_ref().map(|o| **o as libc::loff_t).unwrap_or(0);
  let mut doff_store: libc::loff_t = dst_offset.as_ref().map(|o| **o as libc::loff_t).unwrap_or(0);
  let soff_ptr = if src_offset.is_some() { &mut soff_store as *mut _ } else { std::ptr::null_mut() };
  let doff_ptr = if dst_offset.is_some() { &mut doff_store as *mut _ } else { std::ptr::null_mut() };
  let res = retry_eintr(|| syscall!(splice(src, soff_ptr, dst, doff_ptr, count, flags)).map(|n| n as usize));
  if let Some(o) = src_offset {
    *o = soff_store as i64;
  }
  if let Some(o) = dst_offset {
    *o = doff_store as i64;
  }
  res
}

#[cfg(not(target_os = "linux"))]
pub fn splice(
  _src: RawFd,
  _src_offset: Option<&mut i64>,
  _dst: RawFd,
  _dst_offset: Option<&mut i64>,
  _count: usize,
  _flags: libc::c_uint,
) -> io::Result<usize> {
  Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

pub fn page_size() -> usize {
  let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if sz <= 0 { 4096 } else { sz as usize }
}

/// Maps `[map_offset, map_offset+map_len)` of `fd` read-only/private.
/// `map_offset` must already be page-aligned by the caller.
pub fn mmap_read(fd: RawFd, map_offset: i64, map_len: usize) -> io::Result<*mut u8> {
  let ptr = unsafe {
    libc::mmap(
      std::ptr::null_mut(),
      map_len,
      libc::PROT_READ,
      libc::MAP_PRIVATE,
      fd,
      map_offset as libc::off_t,
    )
  };
  if ptr == libc::MAP_FAILED {
    Err(io::Error::last_os_error())
  } else {
    Ok(ptr as *mut u8)
  }
}

pub fn munmap(ptr: *mut u8, len: usize) {
  unsafe {
    libc::munmap(ptr as *mut libc::c_void, len);
  }
}

pub fn fstat_size(fd: RawFd) -> io::Result<u64> {
  let mut st: libc::stat = unsafe { std::mem::zeroed() };
  syscall!(fstat(fd, &mut st))?;
  Ok(st.st_size as u64)
}
