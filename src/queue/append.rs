//! Producer-facing append/prepend family: `chunkqueue_append_mem` /
//! `append_buffer` / `append_file` / `append_chunkqueue` and their
//! `prepend_*` mirrors, plus the `reserve_*`/`commit_*` write-pointer
//! pair that folds reserve-then-fill-in-place writes into a single
//! checkpointed operation.

use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::buffer::Buffer;
use crate::chunk::{Chunk, FileFd, RefChangeHook};
use crate::error::QueueError;
use crate::platform;

use super::ChunkQueue;

impl ChunkQueue {
  pub fn append_mem(&mut self, bytes: &[u8]) {
    let n = bytes.len();
    if n == 0 {
      return;
    }
    let default_size = self.pool.borrow().default_chunk_size();
    if n < default_size {
      if let Some(c) = self.chunks.back_mut() {
        if let Some((buf, _)) = c.as_mem_mut() {
          if buf.space() >= n {
            buf.append_bytes(bytes);
            self.bytes_in += n as u64;
            return;
          }
        }
      }
    }
    let mut chunk = self.pool.borrow_mut().acquire_mem_chunk(n + 1);
    if let Some((buf, _)) = chunk.as_mem_mut() {
      buf.append_bytes(bytes);
    }
    self.chunks.push_back(chunk);
    self.bytes_in += n as u64;
  }

  pub fn append_buffer(&mut self, mut buf: Buffer) {
    let n = buf.used();
    if n == 0 {
      return;
    }
    if n < 1024 {
      if let Some(c) = self.chunks.back_mut() {
        if let Some((tail, _)) = c.as_mem_mut() {
          if tail.space() >= n {
            tail.append_bytes(buf.as_slice());
            buf.clear();
            self.bytes_in += n as u64;
            return;
          }
        }
      }
    }
    let default_size = self.pool.borrow().default_chunk_size();
    let mut chunk = self.pool.borrow_mut().acquire_mem_chunk(default_size);
    if let Some((tail, _)) = chunk.as_mem_mut() {
      tail.move_from(&mut buf);
    }
    self.chunks.push_back(chunk);
    self.bytes_in += n as u64;
  }

  pub fn append_file(&mut self, path: PathBuf, offset: u64, length: u64) {
    if length == 0 {
      return;
    }
    let mut chunk = self.pool.borrow_mut().acquire_file_chunk();
    if let Some(f) = chunk.as_file_mut() {
      f.path = path;
      f.offset = offset;
      f.length = offset + length;
    }
    self.chunks.push_back(chunk);
    self.bytes_in += length;
  }

  /// As [`Self::append_file`] but with an fd already open; `fd` is
  /// closed immediately if `length` is zero (no chunk is created).
  pub fn append_file_fd(&mut self, path: PathBuf, fd: RawFd, offset: u64, length: u64) {
    if length == 0 {
      platform::close(fd);
      return;
    }
    let mut chunk = self.pool.borrow_mut().acquire_file_chunk();
    if let Some(f) = chunk.as_file_mut() {
      f.path = path;
      f.offset = offset;
      f.length = offset + length;
      f.fd = FileFd::Open(fd);
    }
    self.chunks.push_back(chunk);
    self.bytes_in += length;
  }

  /// As [`Self::append_file_fd`] but `fd` is shared with another
  /// subsystem: `hook` fires `+1`/`-1` instead of the chunk closing
  /// the fd directly.
  pub fn append_file_refcounted(&mut self, path: PathBuf, fd: RawFd, offset: u64, length: u64, hook: RefChangeHook) {
    if length == 0 {
      return;
    }
    let chunk = Chunk::new_file_with_refcount(path, FileFd::Open(fd), offset, offset + length, hook);
    self.chunks.push_back(chunk);
    self.bytes_in += length;
  }

  pub fn prepend_mem(&mut self, bytes: &[u8]) {
    let n = bytes.len();
    if n == 0 {
      return;
    }
    let mut chunk = self.pool.borrow_mut().acquire_mem_chunk(n + 1);
    if let Some((buf, _)) = chunk.as_mem_mut() {
      buf.append_bytes(bytes);
    }
    self.chunks.push_front(chunk);
    self.bytes_in += n as u64;
  }

  pub fn prepend_buffer(&mut self, mut buf: Buffer) {
    let n = buf.used();
    if n == 0 {
      return;
    }
    let default_size = self.pool.borrow().default_chunk_size();
    let mut chunk = self.pool.borrow_mut().acquire_mem_chunk(default_size);
    if let Some((tail, _)) = chunk.as_mem_mut() {
      tail.move_from(&mut buf);
    }
    self.chunks.push_front(chunk);
    self.bytes_in += n as u64;
  }

  pub fn prepend_file(&mut self, path: PathBuf, offset: u64, length: u64) {
    if length == 0 {
      return;
    }
    let mut chunk = self.pool.borrow_mut().acquire_file_chunk();
    if let Some(f) = chunk.as_file_mut() {
      f.path = path;
      f.offset = offset;
      f.length = offset + length;
    }
    self.chunks.push_front(chunk);
    self.bytes_in += length;
  }

  /// Moves every chunk of `src` onto the tail of `self` in O(1) and
  /// leaves `src` fully drained (`bytes_out` caught up to `bytes_in`).
  pub fn append_chunkqueue(&mut self, src: &mut ChunkQueue) {
    if src.chunks.is_empty() {
      return;
    }
    let len = src.length();
    self.chunks.append(&mut src.chunks);
    self.bytes_in += len;
    src.bytes_out = src.bytes_in;
  }

  /// Advances the tail chunk's declared length in place, for a FILE
  /// chunk whose backing file is still being written by the caller
  /// (e.g. a streaming upload sink). Errors if the tail isn't a FILE
  /// chunk.
  pub fn extend_file_chunk(&mut self, additional_len: u64) -> Result<(), QueueError> {
    let f = self
      .chunks
      .back_mut()
      .and_then(Chunk::as_file_mut)
      .ok_or_else(|| QueueError::Io(std::io::Error::new(std::io::ErrorKind::Other, "tail is not a FILE chunk")))?;
    f.length += additional_len;
    self.bytes_in += additional_len;
    Ok(())
  }

  /// Reserves at least `hint` bytes (or a pool-sized default if
  /// `hint` is 0) at the tail for in-place writing, extending the
  /// current tail MEM chunk if it has room or acquiring a fresh one
  /// otherwise. Pair with [`Self::commit_tail`].
  pub fn reserve_tail(&mut self, hint: usize) -> &mut [u8] {
    let sz = if hint == 0 { (self.pool.borrow().default_chunk_size() / 2).max(1) } else { hint };
    let need_new = match self.chunks.back() {
      Some(c) => match c.as_mem() {
        Some((buf, _)) => buf.space() < sz,
        None => true,
      },
      None => true,
    };
    if need_new {
      let chunk = self.pool.borrow_mut().acquire_mem_chunk(sz);
      self.chunks.push_back(chunk);
    }
    self.pending_reserve = Some(sz);
    let (buf, _) = self.chunks.back_mut().and_then(Chunk::as_mem_mut).expect("tail is a mem chunk");
    buf.extend(sz)
  }

  /// Commits `n` of the most recent [`Self::reserve_tail`] reservation
  /// as actually written, giving back any unused reserved tail. A
  /// no-op if there is no pending reservation.
  pub fn commit_tail(&mut self, n: usize) {
    let Some(sz) = self.pending_reserve.take() else { return };
    debug_assert!(n <= sz);
    if let Some((buf, _)) = self.chunks.back_mut().and_then(Chunk::as_mem_mut) {
      let new_used = buf.used() - sz + n;
      buf.truncate(new_used);
      self.bytes_in += n as u64;
    }
  }

  /// As [`Self::reserve_tail`] but always acquires a brand-new empty
  /// chunk at the head rather than reusing an existing one, since
  /// extending a chunk already downstream of the head in place would
  /// require shifting already-queued bytes.
  pub fn reserve_head(&mut self, hint: usize) -> &mut [u8] {
    let sz = if hint == 0 { (self.pool.borrow().default_chunk_size() / 2).max(1) } else { hint };
    let chunk = self.pool.borrow_mut().acquire_mem_chunk(sz);
    self.chunks.push_front(chunk);
    self.pending_reserve = Some(sz);
    let (buf, _) = self.chunks.front_mut().and_then(Chunk::as_mem_mut).expect("just pushed a mem chunk");
    buf.extend(sz)
  }

  pub fn commit_head(&mut self, n: usize) {
    let Some(sz) = self.pending_reserve.take() else { return };
    debug_assert!(n <= sz);
    if let Some((buf, _)) = self.chunks.front_mut().and_then(Chunk::as_mem_mut) {
      let new_used = buf.used() - sz + n;
      buf.truncate(new_used);
      self.bytes_in += n as u64;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::pool::Pool;

  fn fresh() -> ChunkQueue {
    ChunkQueue::new(Pool::new(), &Config::default())
  }

  #[test]
  fn append_mem_extends_tail_in_place_below_default_size() {
    let mut cq = fresh();
    cq.append_mem(b"hello ");
    cq.append_mem(b"world");
    assert_eq!(cq.chunk_count(), 1);
    assert_eq!(cq.bytes_in(), 11);
  }

  #[test]
  fn append_buffer_moves_ownership_in_o1() {
    let mut cq = fresh();
    let mut buf = Buffer::new();
    buf.append_bytes(b"payload");
    cq.append_buffer(buf);
    assert_eq!(cq.length(), 7);
  }

  #[test]
  fn append_file_records_offset_and_length() {
    let mut cq = fresh();
    cq.append_file(PathBuf::from("/etc/hosts"), 10, 50);
    assert_eq!(cq.length(), 50);
    assert_eq!(cq.bytes_in(), 50);
  }

  #[test]
  fn append_chunkqueue_drains_src_in_o1() {
    let mut dst = fresh();
    let mut src = fresh();
    src.append_mem(b"abc");
    src.append_mem(&vec![0u8; 20000]);
    let src_len = src.length();
    dst.append_chunkqueue(&mut src);
    assert!(src.is_empty());
    assert_eq!(src.bytes_out(), src.bytes_in());
    assert_eq!(dst.length(), src_len);
  }

  #[test]
  fn reserve_tail_then_commit_tracks_bytes_in() {
    let mut cq = fresh();
    let region = cq.reserve_tail(16);
    region[..5].copy_from_slice(b"abcde");
    cq.commit_tail(5);
    assert_eq!(cq.bytes_in(), 5);
    assert_eq!(cq.length(), 5);
  }

  #[test]
  fn reserve_head_always_creates_a_fresh_chunk() {
    let mut cq = fresh();
    cq.append_mem(b"tail");
    let region = cq.reserve_head(8);
    region[..3].copy_from_slice(b"abc");
    cq.commit_head(3);
    assert_eq!(cq.chunk_count(), 2);
    assert_eq!(cq.length(), 7);
  }

  #[test]
  fn prepend_mem_inserts_at_head() {
    let mut cq = fresh();
    cq.append_mem(b"b");
    cq.prepend_mem(b"a");
    let peeked = cq.peek_data(2).unwrap();
    assert_eq!(&peeked[..], b"ab");
  }

  #[test]
  fn extend_file_chunk_grows_tail_length() {
    let mut cq = fresh();
    cq.append_file(PathBuf::from("/tmp/upload"), 0, 10);
    cq.extend_file_chunk(5).unwrap();
    assert_eq!(cq.length(), 15);
  }

  #[test]
  fn extend_file_chunk_errors_on_mem_tail() {
    let mut cq = fresh();
    cq.append_mem(b"x");
    assert!(cq.extend_file_chunk(5).is_err());
  }
}
