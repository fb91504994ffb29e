//! Non-consuming read family: `peek_data` exposes up to `max` bytes
//! from the head without advancing it, `read_data` is the exact-length
//! peek-then-consume pair, and `squash` collapses the whole queue
//! into a single MEM chunk.

use std::borrow::Cow;
use std::io;

use crate::buffer::Buffer;
use crate::chunk::{Chunk, ChunkBody, FileFd};
use crate::error::QueueError;

use super::ChunkQueue;

/// `chunkqueue_read_squash`'s original guard: squashing past 4 GiB
/// would overflow the 32-bit length field it was written against.
const SQUASH_GUARD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

impl ChunkQueue {
  /// Exposes up to `max` bytes from the head of the queue without
  /// consuming them. When the head is a single MEM chunk holding at
  /// least `max` bytes, this is a zero-copy borrow straight into that
  /// chunk's buffer — the whole point of keeping bytes in MEM chunks
  /// in the first place. Any other shape (the head is a FILE chunk, or
  /// satisfying `max` needs bytes from more than one chunk) falls back
  /// to [`Self::peek_fill`], which copies into an owned buffer.
  pub fn peek_data(&mut self, max: usize) -> io::Result<Cow<'_, [u8]>> {
    if max == 0 {
      return Ok(Cow::Borrowed(&[]));
    }
    if let Some((mbuf, offset)) = self.chunks.front().and_then(Chunk::as_mem) {
      let avail = mbuf.used() - offset;
      if avail >= max {
        return Ok(Cow::Borrowed(&mbuf.as_slice()[offset..offset + max]));
      }
    }
    let mut merged = vec![0u8; max];
    let n = self.peek_fill(&mut merged)?;
    merged.truncate(n);
    Ok(Cow::Owned(merged))
  }

  /// Fills `buf` with up to `buf.len()` bytes from the head of the
  /// queue without consuming them, walking forward across chunks as
  /// needed. A FILE chunk is read positionally (its own read cursor
  /// is untouched); a short read from one FILE chunk is accepted as-is
  /// and the walk moves on to the next chunk rather than retrying.
  /// Returns the number of bytes actually filled, which may be less
  /// than `buf.len()` if the queue holds fewer bytes.
  fn peek_fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    let mut idx = 0usize;
    while filled < buf.len() {
      let Some(c) = self.chunks.get_mut(idx) else { break };
      let space = buf.len() - filled;
      match &mut c.body {
        ChunkBody::Mem { buf: mbuf, offset } => {
          let have = (mbuf.used() - *offset).min(space);
          if have > 0 {
            buf[filled..filled + have].copy_from_slice(&mbuf.as_slice()[*offset..*offset + have]);
            filled += have;
          }
        }
        ChunkBody::File(f) => {
          if !matches!(f.fd(), FileFd::Open(_)) {
            f.ensure_open().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
          }
          let have = (f.remaining() as usize).min(space);
          if have > 0 {
            let FileFd::Open(fd) = f.fd() else { unreachable!("just ensured open") };
            let n = crate::platform::pread(fd, &mut buf[filled..filled + have], f.offset as i64)?;
            if n == 0 {
              return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected EOF reading file chunk"));
            }
            filled += n;
          }
        }
      }
      idx += 1;
    }
    Ok(filled)
  }

  /// As [`Self::peek_data`] but requires exactly `buf.len()` bytes to
  /// be available and, on success, consumes them via
  /// [`ChunkQueue::mark_written`].
  pub fn read_data(&mut self, buf: &mut [u8]) -> io::Result<()> {
    let n = buf.len();
    {
      let peeked = self.peek_data(n)?;
      if peeked.len() != n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "not enough data buffered to satisfy read_data"));
      }
      buf.copy_from_slice(&peeked);
    }
    self.mark_written(n as u64);
    Ok(())
  }

  /// Collapses the entire queue into a single MEM chunk and returns a
  /// reference to its buffer; `bytes_out` is untouched (this doesn't
  /// consume anything). A queue that already holds exactly one MEM
  /// chunk is returned as-is. Errors if the total length would exceed
  /// the 4 GiB guard.
  pub fn squash(&mut self) -> Result<&Buffer, QueueError> {
    let total = self.length();
    if total >= SQUASH_GUARD_BYTES {
      return Err(QueueError::SquashTooLarge(total));
    }
    let already_single_mem = self.chunks.len() == 1 && self.chunks[0].is_mem();
    if !already_single_mem {
      let merged = self.peek_data(total as usize).map_err(QueueError::Io)?.into_owned();
      self.drain_to_pool();
      let mut chunk = self.pool.borrow_mut().acquire_mem_chunk(total as usize + 1);
      if let Some((buf, _)) = chunk.as_mem_mut() {
        buf.append_bytes(&merged);
      }
      self.chunks.push_back(chunk);
    }
    match &self.chunks.front().expect("just ensured a single mem chunk").body {
      ChunkBody::Mem { buf, .. } => Ok(buf),
      ChunkBody::File(_) => unreachable!("squash always leaves a mem chunk"),
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
  fn peek_data_does_not_consume() {
    let mut cq = fresh();
    cq.append_mem(b"abcdef");
    let peeked = cq.peek_data(3).unwrap();
    assert_eq!(&peeked[..], b"abc");
    drop(peeked);
    assert_eq!(cq.length(), 6);
    assert_eq!(cq.bytes_out(), 0);
  }

  #[test]
  fn peek_data_is_zero_copy_for_a_single_mem_head() {
    let mut cq = fresh();
    cq.append_mem(b"abcdef");
    let peeked = cq.peek_data(3).unwrap();
    assert!(matches!(peeked, Cow::Borrowed(_)));
  }

  #[test]
  fn peek_data_spans_multiple_chunks() {
    let mut cq = fresh();
    let mut src = fresh();
    src.append_mem(b"def");
    cq.append_mem(b"abc");
    cq.append_chunkqueue(&mut src);
    let peeked = cq.peek_data(6).unwrap();
    assert_eq!(&peeked[..], b"abcdef");
    assert!(matches!(peeked, Cow::Owned(_)));
  }

  #[test]
  fn peek_data_returns_short_fill_when_queue_has_less() {
    let mut cq = fresh();
    cq.append_mem(b"ab");
    let peeked = cq.peek_data(5).unwrap();
    assert_eq!(peeked.len(), 2);
    assert_eq!(&peeked[..], b"ab");
  }

  #[test]
  fn read_data_consumes_exact_length() {
    let mut cq = fresh();
    cq.append_mem(b"abcdef");
    let mut out = [0u8; 3];
    cq.read_data(&mut out).unwrap();
    assert_eq!(&out, b"abc");
    assert_eq!(cq.bytes_out(), 3);
    assert_eq!(cq.length(), 3);
  }

  #[test]
  fn read_data_errors_on_insufficient_bytes() {
    let mut cq = fresh();
    cq.append_mem(b"ab");
    let mut out = [0u8; 5];
    assert!(cq.read_data(&mut out).is_err());
  }

  #[test]
  fn squash_collapses_multiple_chunks_into_one() {
    let mut cq = fresh();
    let mut src = fresh();
    src.append_mem(b"llo wor");
    cq.append_mem(b"he");
    cq.append_chunkqueue(&mut src);
    cq.append_mem(b"ld");
    let buf = cq.squash().unwrap();
    assert_eq!(buf.as_slice(), b"hello world");
    assert_eq!(cq.chunk_count(), 1);
    assert_eq!(cq.bytes_out(), 0);
  }

  #[test]
  fn squash_is_a_noop_for_a_single_mem_chunk() {
    let mut cq = fresh();
    cq.append_mem(b"already one chunk");
    let buf = cq.squash().unwrap();
    assert_eq!(buf.as_slice(), b"already one chunk");
    assert_eq!(cq.chunk_count(), 1);
  }
}
