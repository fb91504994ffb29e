//! Movement between queues and within a queue: `steal`,
//! `append_cq_range`, `mark_written`, `remove_finished_chunks`,
//! `remove_empty_chunks`, `compact_mem`.

use std::io;

use crate::chunk::ChunkBody;

use super::ChunkQueue;

impl ChunkQueue {
  /// Moves up to `len` bytes from the front of `src` onto the tail of
  /// `self`. Whole chunks move in O(1); a partial leading chunk is
  /// split — a MEM split copies the trailing range, a FILE split
  /// duplicates the fd (or bumps its refcount) and advances `src`'s
  /// offset past what was taken.
  pub fn steal(&mut self, src: &mut ChunkQueue, mut len: u64) -> io::Result<()> {
    while len > 0 {
      let Some(front) = src.chunks.front() else { break };
      let clen = front.remaining();
      if clen == 0 {
        let c = src.chunks.pop_front().unwrap();
        src.release_chunk(c);
        continue;
      }
      if len >= clen {
        let c = src.chunks.pop_front().unwrap();
        self.chunks.push_back(c);
        self.bytes_in += clen;
        src.bytes_out += clen;
        len -= clen;
      } else {
        let n = len;
        match &mut src.chunks[0].body {
          ChunkBody::Mem { buf, offset } => {
            let bytes = buf.as_slice()[*offset..*offset + n as usize].to_vec();
            self.append_mem(&bytes);
            *offset += n as usize;
          }
          ChunkBody::File(f) => {
            let mut dup = f.duplicate()?;
            dup.length = f.offset + n;
            self.chunks.push_back(crate::chunk::Chunk { body: ChunkBody::File(dup) });
            self.bytes_in += n;
            f.offset += n;
          }
        }
        src.bytes_out += n;
        len -= n;
      }
    }
    Ok(())
  }

  /// Copies (never moves) `len` bytes starting at `offset` from `src`
  /// onto the tail of `self`. Unlike [`Self::steal`] this leaves `src`
  /// untouched, at the cost of a dup/copy per chunk touched. `self`
  /// and `src` must be different queues.
  pub fn append_cq_range(&mut self, src: &ChunkQueue, mut offset: u64, mut len: u64) -> io::Result<()> {
    for c in src.chunks.iter() {
      if len == 0 {
        break;
      }
      let total = c.remaining();
      if offset >= total {
        offset -= total;
        continue;
      }
      let mut take = total - offset;
      if take > len {
        take = len;
      }
      len -= take;
      match &c.body {
        ChunkBody::File(f) => {
          let mut dup = f.duplicate()?;
          dup.offset = f.offset + offset;
          dup.length = dup.offset + take;
          self.chunks.push_back(crate::chunk::Chunk { body: ChunkBody::File(dup) });
          self.bytes_in += take;
        }
        ChunkBody::Mem { buf, offset: head_off } => {
          let start = head_off + offset as usize;
          let bytes = buf.as_slice()[start..start + take as usize].to_vec();
          self.append_mem(&bytes);
        }
      }
      offset = 0;
    }
    Ok(())
  }

  /// Advances `bytes_out` by `len`, releasing every chunk fully
  /// drained by that advance and, if the advance ends partway through
  /// a chunk, moving just that chunk's read cursor forward.
  pub fn mark_written(&mut self, mut len: u64) {
    self.bytes_out += len;
    while len > 0 {
      let Some(front) = self.chunks.front() else { break };
      let clen = front.remaining();
      if len >= clen {
        let c = self.chunks.pop_front().unwrap();
        len -= clen;
        self.release_chunk(c);
      } else {
        self.chunks[0].advance_offset(len);
        return;
      }
    }
  }

  /// Releases every chunk at the head that is already fully drained.
  pub fn remove_finished_chunks(&mut self) {
    while let Some(front) = self.chunks.front() {
      if front.remaining() != 0 {
        break;
      }
      let c = self.chunks.pop_front().unwrap();
      self.release_chunk(c);
    }
  }

  /// As [`Self::remove_finished_chunks`] but also drops any
  /// zero-length chunk anywhere in the queue, not just at the head.
  pub fn remove_empty_chunks(&mut self) {
    self.remove_finished_chunks();
    let mut i = 1;
    while i < self.chunks.len() {
      if self.chunks[i].remaining() == 0 {
        let c = self.chunks.remove(i).unwrap();
        self.release_chunk(c);
      } else {
        i += 1;
      }
    }
  }

  fn compact_mem_offset(&mut self) {
    let Some((buf, offset)) = self.chunks.front_mut().and_then(crate::chunk::Chunk::as_mem_mut) else { return };
    if *offset == 0 {
      return;
    }
    buf.drop_prefix(*offset);
    *offset = 0;
  }

  /// Ensures at least `clen` contiguous bytes are available starting
  /// at the head, either by reclaiming the head MEM chunk's leading
  /// offset in place or, if its capacity is too small, by prepending
  /// a fresh larger buffer and folding subsequent MEM chunks into it.
  /// The head chunk (and every chunk folded in) must be a MEM chunk.
  /// Idempotent: a second call with the same `clen` is a no-op.
  pub fn compact_mem(&mut self, clen: usize) {
    if self.chunks.is_empty() {
      return;
    }
    let Some((used0, off0)) = self.chunks[0].as_mem().map(|(b, o)| (b.used(), o)) else { return };
    let mut len = used0 - off0;
    if len >= clen {
      return;
    }

    let head_cap = self.chunks[0].mem_capacity().unwrap();
    if head_cap > clen {
      let space = self.chunks[0].as_mem().unwrap().0.space();
      if space < clen - len {
        self.compact_mem_offset();
      }
    } else {
      let mut bigger = self.pool.borrow_mut().acquire_mem_chunk(clen + 1);
      let head = self.chunks.pop_front().unwrap();
      if let Some((old_buf, old_off)) = head.as_mem() {
        let bytes = old_buf.as_slice()[old_off..].to_vec();
        if let Some((nbuf, _)) = bigger.as_mem_mut() {
          nbuf.append_bytes(&bytes);
        }
      }
      self.release_chunk(head);
      self.chunks.push_front(bigger);
    }

    let mut target = clen;
    loop {
      target = target.saturating_sub(len);
      if target == 0 || self.chunks.len() < 2 {
        break;
      }
      let next_len = self.chunks[1].remaining() as usize;
      len = next_len;
      if next_len == 0 {
        let c = self.chunks.remove(1).unwrap();
        self.release_chunk(c);
        continue;
      }
      if next_len > target {
        let take = target;
        let bytes = match &mut self.chunks[1].body {
          ChunkBody::Mem { buf, offset } => {
            let slice = buf.as_slice()[*offset..*offset + take].to_vec();
            *offset += take;
            slice
          }
          ChunkBody::File(_) => break,
        };
        if let Some((hbuf, _)) = self.chunks[0].as_mem_mut() {
          hbuf.append_bytes(&bytes);
        }
        break;
      } else {
        let bytes = match &self.chunks[1].body {
          ChunkBody::Mem { buf, offset } => buf.as_slice()[*offset..].to_vec(),
          ChunkBody::File(_) => break,
        };
        if let Some((hbuf, _)) = self.chunks[0].as_mem_mut() {
          hbuf.append_bytes(&bytes);
        }
        let c = self.chunks.remove(1).unwrap();
        self.release_chunk(c);
      }
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
  fn steal_whole_chunk_is_o1_move() {
    let mut src = fresh();
    let mut dst = fresh();
    src.append_mem(b"abcdef");
    dst.steal(&mut src, 6).unwrap();
    assert!(src.is_empty());
    assert_eq!(dst.length(), 6);
    assert_eq!(src.bytes_out(), 6);
  }

  #[test]
  fn steal_partial_mem_chunk_copies_and_advances_offset() {
    let mut src = fresh();
    let mut dst = fresh();
    src.append_mem(b"abcdef");
    dst.steal(&mut src, 3).unwrap();
    assert_eq!(src.length(), 3);
    assert_eq!(dst.length(), 3);
    let peeked = dst.peek_data(3).unwrap();
    assert_eq!(&peeked[..], b"abc");
  }

  #[test]
  fn mark_written_releases_drained_chunks_and_advances_partial() {
    let mut cq = fresh();
    cq.append_mem(b"hello");
    cq.append_mem(b"world");
    cq.mark_written(7);
    assert_eq!(cq.bytes_out(), 7);
    assert_eq!(cq.length(), 3);
    let peeked = cq.peek_data(3).unwrap();
    assert_eq!(&peeked[..], b"rld");
  }

  #[test]
  fn remove_empty_chunks_drops_zero_length_chunks_anywhere() {
    let mut cq = fresh();
    cq.append_mem(b"a");
    cq.append_mem(b""); // no-op, doesn't create a chunk
    cq.append_mem(b"b");
    assert_eq!(cq.chunk_count(), 1); // both merged into one tail chunk
    cq.remove_empty_chunks();
    assert_eq!(cq.chunk_count(), 1);
  }

  #[test]
  fn compact_mem_is_idempotent() {
    let mut cq = fresh();
    cq.append_mem(b"0123456789");
    cq.mark_written(4); // advances head offset to 4
    cq.append_mem(b"abcdef");
    cq.compact_mem(8);
    let len_after_first = cq.length();
    cq.compact_mem(8);
    assert_eq!(cq.length(), len_after_first);
    let peeked = cq.peek_data(len_after_first as usize).unwrap();
    assert_eq!(&peeked[..], b"456789abcdef");
  }
}
