//! Spill-to-tempfile family: bounded-memory overflow of accumulated
//! bytes into a rotating temp file once a threshold is crossed.
//! Monotone — once a queue starts spilling it never reverts to
//! mem-first — and the two recursive entry points
//! ([`ChunkQueue::append_mem_to_tempfile`] and
//! [`ChunkQueue::steal_with_tempfiles`]) terminate because the
//! destination the migration step drains into always starts empty.

use std::io;
use std::os::fd::RawFd;

use crate::chunk::{ChunkBody, FileFd};
use crate::error::QueueError;
use crate::tempdir::TempDirPolicy;
use crate::trampoline;

use super::ChunkQueue;

const SPLICE_FLAGS: libc::c_uint = (libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK) as libc::c_uint;
const DRAIN_BUF: usize = 16 * 1024;

impl ChunkQueue {
  /// Ensures the tail is an open temp FILE chunk ready to accept more
  /// bytes, rolling a fresh one if the tail isn't a temp chunk, isn't
  /// open, or has already grown past `upload_temp_file_size`.
  fn ensure_append_tempfile(&mut self) -> Result<(), QueueError> {
    let usable = match self.chunks.back().and_then(crate::chunk::Chunk::as_file) {
      Some(f) if f.is_temp() && matches!(f.fd(), FileFd::Open(_)) => f.length < self.upload_temp_file_size,
      _ => false,
    };
    if usable {
      return Ok(());
    }
    let has_stale_temp_tail = matches!(
      self.chunks.back().and_then(crate::chunk::Chunk::as_file),
      Some(f) if f.is_temp() && matches!(f.fd(), FileFd::Open(_))
    );
    if has_stale_temp_tail {
      self.handle_tempfile_write_error_force_close();
    }
    self.new_append_tempfile()
  }

  fn new_append_tempfile(&mut self) -> Result<(), QueueError> {
    let (fd, path) = self.tempdirs.create_tempfile()?;
    tracing::debug!(path = %path.display(), "rolled a new spill tempfile");
    let mut chunk = self.pool.borrow_mut().acquire_file_chunk();
    if let Some(f) = chunk.as_file_mut() {
      f.path = path;
      f.fd = FileFd::Open(fd);
      f.offset = 0;
      f.length = 0;
      f.is_temp = true;
    }
    self.chunks.push_back(chunk);
    Ok(())
  }

  /// Closes the tail temp chunk's fd unconditionally so the next
  /// `ensure_append_tempfile` rolls a new one, without touching the
  /// chunk's already-written bytes.
  fn handle_tempfile_write_error_force_close(&mut self) {
    if let Some(f) = self.chunks.back_mut().and_then(crate::chunk::Chunk::as_file_mut) {
      if let FileFd::Open(fd) = f.fd {
        crate::platform::close(fd);
      }
      f.fd = FileFd::Closed;
    }
  }

  /// Handles a failed write to the tail temp chunk: an empty chunk
  /// (nothing was ever written to it) is dropped outright, otherwise
  /// its fd is closed so no further append is attempted on it.
  fn handle_tempfile_write_error(&mut self) {
    if let Some(back) = self.chunks.back() {
      if back.remaining() == 0 {
        let c = self.chunks.pop_back().unwrap();
        self.release_chunk(c);
        return;
      }
    }
    self.handle_tempfile_write_error_force_close();
  }

  fn migrate_mem_to_tempfiles(&mut self) -> Result<(), QueueError> {
    let total = self.length();
    if total == 0 {
      return Ok(());
    }
    let mut scratch = ChunkQueue {
      chunks: std::mem::take(&mut self.chunks),
      bytes_in: self.bytes_in,
      bytes_out: self.bytes_out,
      pool: self.pool.clone(),
      tempdirs: TempDirPolicy::new(Vec::new()),
      upload_temp_file_size: self.upload_temp_file_size,
      pending_reserve: None,
    };
    self.bytes_in -= total;
    self.steal_with_tempfiles(&mut scratch, total)
  }

  /// Gathers up to 16 consecutive leading MEM-chunk iovecs from `src`
  /// (capped at `len` bytes total) and writes them to the active temp
  /// chunk in one `pwritev`. Returns how many bytes were consumed
  /// from `src` (0 on a recoverable `ENOSPC`, to be retried by the
  /// caller after rotating directories).
  fn append_cqmem_gather_to_tempfile(&mut self, src: &ChunkQueue, mut budget: u64) -> Result<u64, QueueError> {
    let mut owned: Vec<Vec<u8>> = Vec::new();
    for c in src.chunks.iter() {
      if owned.len() == 16 || budget == 0 {
        break;
      }
      let Some((buf, offset)) = c.as_mem() else { break };
      let avail = (buf.used() - offset) as u64;
      let take = avail.min(budget);
      if take == 0 {
        break;
      }
      owned.push(buf.as_slice()[offset..offset + take as usize].to_vec());
      budget -= take;
    }
    if owned.is_empty() {
      return Ok(0);
    }

    self.ensure_append_tempfile()?;
    let (fd, base_offset) = {
      let f = self.chunks.back().and_then(crate::chunk::Chunk::as_file).expect("just ensured a temp chunk");
      match f.fd() {
        FileFd::Open(fd) => (fd, f.length),
        _ => return Err(QueueError::Io(io::Error::new(io::ErrorKind::Other, "temp chunk has no open fd"))),
      }
    };
    let refs: Vec<&[u8]> = owned.iter().map(Vec::as_slice).collect();
    match crate::platform::pwritev(fd, &refs, base_offset as i64) {
      Ok(written) => {
        if let Some(f) = self.chunks.back_mut().and_then(crate::chunk::Chunk::as_file_mut) {
          f.length += written as u64;
        }
        self.bytes_in += written as u64;
        Ok(written as u64)
      }
      Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
        tracing::warn!("spill tempfile hit ENOSPC, rotating to next temp directory");
        self.handle_tempfile_write_error();
        self.tempdirs.advance_on_disk_full();
        Ok(0)
      }
      Err(e) => {
        self.handle_tempfile_write_error();
        Err(QueueError::Io(e))
      }
    }
  }

  /// Appends `mem` to the tail, spilling it to a temp file rather
  /// than holding it as a MEM chunk. If the queue currently starts
  /// with MEM chunks, they're migrated to tempfiles first so the
  /// queue never mixes MEM-then-FILE-then-MEM again once spilling
  /// begins.
  pub fn append_mem_to_tempfile(&mut self, mem: &[u8]) -> Result<(), QueueError> {
    if matches!(self.chunks.front(), Some(c) if c.is_mem()) {
      self.migrate_mem_to_tempfiles()?;
    }
    let mut remaining = mem;
    while !remaining.is_empty() {
      self.ensure_append_tempfile()?;
      let (fd, base_offset) = {
        let f = self.chunks.back().and_then(crate::chunk::Chunk::as_file).expect("just ensured a temp chunk");
        match f.fd() {
          FileFd::Open(fd) => (fd, f.length),
          _ => return Err(QueueError::Io(io::Error::new(io::ErrorKind::Other, "temp chunk has no open fd"))),
        }
      };
      match crate::platform::pwrite(fd, remaining, base_offset as i64) {
        Ok(written) => {
          if let Some(f) = self.chunks.back_mut().and_then(crate::chunk::Chunk::as_file_mut) {
            f.length += written as u64;
          }
          self.bytes_in += written as u64;
          remaining = &remaining[written..];
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
          tracing::warn!("spill tempfile hit ENOSPC, rotating to next temp directory");
          self.handle_tempfile_write_error();
          self.tempdirs.advance_on_disk_full();
        }
        Err(e) => {
          self.handle_tempfile_write_error();
          return Err(QueueError::Io(e));
        }
      }
    }
    Ok(())
  }

  /// Moves up to `len` bytes from the front of `src` onto the tail of
  /// `self`, spilling any MEM runs to tempfiles via a gathered
  /// `pwritev` and moving/splitting FILE chunks the same way
  /// [`ChunkQueue::steal`] does.
  pub fn steal_with_tempfiles(&mut self, src: &mut ChunkQueue, mut len: u64) -> Result<(), QueueError> {
    while len > 0 {
      let Some(is_mem) = src.chunks.front().map(|c| c.is_mem()) else { break };
      if is_mem {
        let written = self.append_cqmem_gather_to_tempfile(src, len)?;
        if written == 0 {
          continue; // ENOSPC rotation happened; retry with the new tempfile
        }
        src.mark_written(written);
        len -= written;
      } else {
        let clen = src.chunks.front().unwrap().remaining().min(len);
        self.steal(src, clen).map_err(QueueError::Io)?;
        len -= clen;
      }
    }
    Ok(())
  }

  /// Drains `len` bytes from a plain pipe into the active temp chunk
  /// via a read/`append_mem_to_tempfile` loop, used when `splice`
  /// returns `EINVAL` (the source isn't splice-able, e.g. a regular
  /// file opened without `O_DIRECT` on some kernels).
  fn drain_pipe_to_tempfile(&mut self, pipe_fd: RawFd, mut len: u64) -> Result<u64, QueueError> {
    let mut buf = [0u8; DRAIN_BUF];
    let mut moved = 0u64;
    while len > 0 {
      let want = (len as usize).min(buf.len());
      let n = crate::platform::read(pipe_fd, &mut buf[..want]).map_err(QueueError::Io)?;
      if n == 0 {
        break;
      }
      self.append_mem_to_tempfile(&buf[..n])?;
      moved += n as u64;
      len -= n as u64;
    }
    Ok(moved)
  }

  /// Splices up to `len` bytes from `pipe_fd` directly into the
  /// active temp chunk. `EAGAIN`/`EWOULDBLOCK` (nothing ready) returns
  /// whatever was moved so far; `EINVAL` (splice not applicable to
  /// this fd pair) falls back to [`Self::drain_pipe_to_tempfile`].
  pub fn append_splice_pipe_tempfile(&mut self, pipe_fd: RawFd, mut len: u64) -> Result<u64, QueueError> {
    if matches!(self.chunks.front(), Some(c) if c.is_mem()) {
      self.migrate_mem_to_tempfiles()?;
    }
    let mut total = 0u64;
    while len > 0 {
      self.ensure_append_tempfile()?;
      let (fd, base_offset) = {
        let f = self.chunks.back().and_then(crate::chunk::Chunk::as_file).expect("just ensured a temp chunk");
        match f.fd() {
          FileFd::Open(fd) => (fd, f.length),
          _ => return Err(QueueError::Io(io::Error::new(io::ErrorKind::Other, "temp chunk has no open fd"))),
        }
      };
      let mut off = base_offset as i64;
      match crate::platform::splice(pipe_fd, None, fd, Some(&mut off), len as usize, SPLICE_FLAGS) {
        Ok(0) => break,
        Ok(n) => {
          if let Some(f) = self.chunks.back_mut().and_then(crate::chunk::Chunk::as_file_mut) {
            f.length += n as u64;
          }
          self.bytes_in += n as u64;
          total += n as u64;
          len -= n as u64;
        }
        Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) => {
          self.remove_empty_chunks();
          return Ok(total);
        }
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
          let drained = self.drain_pipe_to_tempfile(pipe_fd, len)?;
          return Ok(total + drained);
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
          self.handle_tempfile_write_error();
          self.tempdirs.advance_on_disk_full();
        }
        Err(e) => {
          self.handle_tempfile_write_error();
          return Err(QueueError::Io(e));
        }
      }
    }
    Ok(total)
  }

  /// Drains and discards bytes from a trampoline pipe so it's left
  /// empty for the next use; resets the trampoline entirely if
  /// reading it fails outright.
  fn drain_trampoline_pipe(&self, read_fd: RawFd) {
    let mut buf = [0u8; DRAIN_BUF];
    loop {
      match crate::platform::read(read_fd, &mut buf) {
        Ok(0) => break,
        Ok(_) => continue,
        Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) => break,
        Err(_) => {
          trampoline::reset();
          break;
        }
      }
    }
  }

  /// Splices `len` bytes from a socket into the active temp chunk by
  /// bridging through the per-thread splice trampoline (sockets can't
  /// usually `splice` directly to a regular file). Returns `None` if
  /// the trampoline can't be used (caller falls back to a read/write
  /// copy loop), `Some(Err(..))` on a real failure.
  pub fn append_splice_sock_tempfile(&mut self, sock_fd: RawFd, len: u64) -> Option<Result<u64, QueueError>> {
    if trampoline::ensure().is_err() {
      return None;
    }
    let outcome = trampoline::with_pipe(|read_fd, write_fd| {
      match crate::platform::splice(sock_fd, None, write_fd, None, len as usize, SPLICE_FLAGS) {
        Ok(n) if n > 0 => match self.append_splice_pipe_tempfile(read_fd, n as u64) {
          Ok(written) => Some(Ok(written)),
          Err(e) => {
            self.drain_trampoline_pipe(read_fd);
            Some(Err(e))
          }
        },
        _ => None,
      }
    });
    outcome.flatten()
  }
}
