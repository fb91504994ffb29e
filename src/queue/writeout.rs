//! Outbound write-out family: `write_chunk` (with its
//! `sendfile`→`mmap`→bounce-buffer fallback chain), `write_chunk_to_pipe`,
//! and the small-response optimization that folds a trailing FILE
//! chunk back into its preceding header buffer.

use std::io;
use std::os::fd::RawFd;

use crate::chunk::{Chunk, FileFd, MmapWindow};
use crate::error::QueueError;

use super::ChunkQueue;

const BOUNCE_BUF: usize = 16 * 1024;

impl ChunkQueue {
  /// Writes as much of the head chunk as the kernel accepts in one
  /// call to `fd`, without consuming it — pair with
  /// [`ChunkQueue::mark_written`].
  pub fn write_chunk(&mut self, fd: RawFd) -> io::Result<usize> {
    match self.chunks.front() {
      None => Ok(0),
      Some(c) if c.is_mem() => self.write_chunk_mem(fd),
      Some(_) => self.write_chunk_file(fd),
    }
  }

  fn write_chunk_mem(&mut self, fd: RawFd) -> io::Result<usize> {
    let (buf, offset) = self.chunks.front().and_then(Chunk::as_mem).expect("checked is_mem");
    crate::platform::write(fd, &buf.as_slice()[offset..])
  }

  fn write_chunk_file(&mut self, fd: RawFd) -> io::Result<usize> {
    let src_fd = self
      .chunks
      .front_mut()
      .and_then(Chunk::as_file_mut)
      .expect("checked file chunk")
      .ensure_open()
      .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let (offset, count) = {
      let f = self.chunks.front().and_then(Chunk::as_file).unwrap();
      (f.offset, f.remaining())
    };
    if count == 0 {
      return Ok(0);
    }

    let mut sf_offset = offset as i64;
    match crate::platform::sendfile(fd, src_fd, &mut sf_offset, count as usize) {
      Ok(n) => return Ok(n),
      Err(e) if !matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS)) => return Err(e),
      Err(e) => tracing::debug!(error = %e, "sendfile unsupported for this fd pair, falling back to mmap"),
    }

    if let Ok(n) = self.write_chunk_file_mmap(fd, src_fd, offset, count) {
      return Ok(n);
    }
    tracing::debug!("mmap write-out failed, falling back to bounce buffer");

    self.write_chunk_file_intermediate(fd)
  }

  fn write_chunk_file_mmap(&mut self, fd: RawFd, src_fd: RawFd, offset: u64, count: u64) -> io::Result<usize> {
    let page = crate::platform::page_size() as u64;
    let map_offset = offset - (offset % page);
    let f = self.chunks.front_mut().and_then(Chunk::as_file_mut).expect("checked file chunk");

    let need_remap = match &f.mmap {
      Some(w) => offset < w.map_offset as u64 || offset + count > w.map_offset as u64 + w.map_len as u64,
      None => true,
    };
    if need_remap {
      let want_len = (f.length - map_offset) as usize;
      let ptr = crate::platform::mmap_read(src_fd, map_offset as i64, want_len)?;
      f.mmap = Some(MmapWindow { ptr, map_offset: map_offset as i64, map_len: want_len });
    }
    let window = f.mmap.as_ref().unwrap();
    let rel = (offset as i64 - window.map_offset) as usize;
    // Safety: `rel..rel+count` is within `[0, map_len)` by the remap
    // check above, and the mapping outlives this borrow via `f.mmap`.
    let data = unsafe { std::slice::from_raw_parts(window.ptr.add(rel), count as usize) };
    crate::platform::write(fd, data)
  }

  fn write_chunk_file_intermediate(&mut self, fd: RawFd) -> io::Result<usize> {
    let peeked = self.peek_data(BOUNCE_BUF)?;
    if peeked.is_empty() {
      return Ok(0);
    }
    crate::platform::write(fd, &peeked)
  }

  /// As [`Self::write_chunk`] but for a pipe destination: a FILE head
  /// is spliced directly rather than read into a user-space buffer
  /// first; a MEM head still goes through a plain `write`.
  pub fn write_chunk_to_pipe(&mut self, fd: RawFd) -> io::Result<usize> {
    let is_file = matches!(self.chunks.front(), Some(c) if c.is_file());
    if !is_file {
      return self.write_chunk(fd);
    }
    let (src_fd, offset, count) = {
      let f = self.chunks.front_mut().and_then(Chunk::as_file_mut).expect("checked file chunk");
      let src_fd = f.ensure_open().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
      (src_fd, f.offset, f.remaining())
    };
    if count == 0 {
      return Ok(0);
    }
    let mut off = offset as i64;
    crate::platform::splice(src_fd, Some(&mut off), fd, None, count as usize, libc::SPLICE_F_NONBLOCK as libc::c_uint)
  }

  /// When the queue holds exactly a small MEM header followed by one
  /// already-open FILE chunk, reads the file's contents into the
  /// header buffer and drops the FILE chunk, trading a later
  /// `sendfile`/`splice` for one `pread` loop up front — worthwhile
  /// for small bodies where the syscall overhead of a second write
  /// dominates. Restores the queue to its original state on a
  /// partial read.
  pub fn small_response_optimization(&mut self) -> Result<(), QueueError> {
    if self.chunks.len() != 2 || !self.chunks[0].is_mem() || !self.chunks[1].is_file() {
      return Ok(());
    }
    let (file_len, file_offset, fd) = {
      let f = self.chunks[1].as_file().unwrap();
      match f.fd() {
        FileFd::Open(fd) => (f.remaining(), f.offset, fd),
        _ => return Ok(()),
      }
    };
    if file_len == 0 {
      return Ok(());
    }

    let needed = file_len as usize;
    if needed > self.chunks[0].as_mem().unwrap().0.space() {
      let mut bigger = self.pool.borrow_mut().acquire_mem_chunk(needed + 1);
      {
        let (old_buf, old_off) = self.chunks[0].as_mem().unwrap();
        let (bbuf, _) = bigger.as_mem_mut().unwrap();
        bbuf.append_bytes(&old_buf.as_slice()[old_off..]);
      }
      let old = std::mem::replace(&mut self.chunks[0], bigger);
      self.release_chunk(old);
    }

    let base_used = self.chunks[0].as_mem().unwrap().0.used();
    let region = self.chunks[0].as_mem_mut().unwrap().0.extend(needed);

    let mut read_total = 0usize;
    let mut io_err = None;
    while read_total < needed {
      match crate::platform::pread(fd, &mut region[read_total..], (file_offset + read_total as u64) as i64) {
        Ok(0) => break,
        Ok(n) => read_total += n,
        Err(e) => {
          io_err = Some(e);
          break;
        }
      }
    }

    if read_total == needed {
      self.chunks[0].as_mem_mut().unwrap().0.truncate(base_used + needed);
      let file_chunk = self.chunks.remove(1).unwrap();
      self.release_chunk(file_chunk);
      Ok(())
    } else {
      self.chunks[0].as_mem_mut().unwrap().0.truncate(base_used);
      if let Some(f) = self.chunks[1].as_file_mut() {
        f.offset += read_total as u64;
      }
      match io_err {
        Some(e) => Err(QueueError::Io(e)),
        None => Ok(()),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::pool::Pool;
  use std::io::Write as _;
  use std::os::fd::AsRawFd;

  fn fresh() -> ChunkQueue {
    ChunkQueue::new(Pool::new(), &Config::default())
  }

  #[test]
  fn write_chunk_mem_writes_from_current_offset() {
    let mut cq = fresh();
    cq.append_mem(b"hello world");
    cq.mark_written(0);
    let (read_fd, write_fd) = crate::platform::pipe_cloexec().unwrap();
    let n = cq.write_chunk(write_fd).unwrap();
    assert_eq!(n, 11);
    crate::platform::close(write_fd);
    crate::platform::close(read_fd);
  }

  #[test]
  fn write_chunk_file_falls_back_through_to_bounce_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("body");
    std::fs::write(&path, b"file contents").unwrap();
    let mut cq = fresh();
    cq.append_file(path, 0, 13);

    let out_path = dir.path().join("out");
    let out = std::fs::File::create(&out_path).unwrap();
    let n = cq.write_chunk(out.as_raw_fd()).unwrap();
    assert!(n > 0);
  }

  #[test]
  fn small_response_optimization_merges_header_and_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("body");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(b"0123456789").unwrap();
    drop(f);

    let mut cq = fresh();
    cq.append_mem(b"HEADER:");
    cq.append_file(path, 0, 10);
    let fd = crate::platform::open_cloexec(std::path::Path::new(&dir.path().join("body")), libc::O_RDONLY, 0).unwrap();
    if let Some(fc) = cq.chunks[1].as_file_mut() {
      fc.fd = FileFd::Open(fd);
    }

    cq.small_response_optimization().unwrap();
    assert_eq!(cq.chunk_count(), 1);
    assert_eq!(cq.length(), 17);
    let peeked = cq.peek_data(17).unwrap();
    assert_eq!(&peeked[..], b"HEADER:0123456789");
  }

  #[test]
  fn small_response_optimization_is_a_noop_for_other_shapes() {
    let mut cq = fresh();
    cq.append_mem(b"only mem");
    cq.small_response_optimization().unwrap();
    assert_eq!(cq.chunk_count(), 1);
  }
}
