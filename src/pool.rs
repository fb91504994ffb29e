//! Process-wide (per-worker) freelists of recyclable chunks and
//! buffers, partitioned by size class. See `DESIGN.md` for how this
//! collapses what would otherwise be four separate freelists
//! (default/oversized/file-chunk/lent-out-shell) down to three, since a
//! Rust `Buffer` needs no separate header allocation to reclaim.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::chunk::Chunk;
use crate::config::{round_chunk_buf_sz, DEFAULT_CHUNK_BUF_SZ};

pub type PoolHandle = Rc<RefCell<Pool>>;

/// Heuristic cap on the oversized freelist, not a hard limit — exposed
/// so callers can tune it.
pub const DEFAULT_OVERSIZED_CAP: usize = 64;

#[derive(Debug)]
pub struct Pool {
  default_size: usize,
  oversized_cap: usize,
  default_buffers: Vec<Buffer>,
  oversized_buffers: Vec<Buffer>,
  default_chunks: Vec<Chunk>,
  oversized_chunks: Vec<Chunk>,
  file_chunks: Vec<Chunk>,
}

fn round_up_to_multiple(n: usize, unit: usize) -> usize {
  n.div_ceil(unit) * unit
}

impl Pool {
  pub fn new() -> PoolHandle {
    Self::with_chunk_size(DEFAULT_CHUNK_BUF_SZ)
  }

  pub fn with_chunk_size(chunk_buf_sz: usize) -> PoolHandle {
    Self::with_chunk_size_and_cap(chunk_buf_sz, DEFAULT_OVERSIZED_CAP)
  }

  pub fn with_chunk_size_and_cap(chunk_buf_sz: usize, oversized_cap: usize) -> PoolHandle {
    Rc::new(RefCell::new(Self {
      default_size: round_chunk_buf_sz(chunk_buf_sz),
      oversized_cap,
      default_buffers: Vec::new(),
      oversized_buffers: Vec::new(),
      default_chunks: Vec::new(),
      oversized_chunks: Vec::new(),
      file_chunks: Vec::new(),
    }))
  }

  pub fn default_chunk_size(&self) -> usize {
    self.default_size
  }

  /// Below a 4 KiB default size the oversized-tracking bookkeeping
  /// isn't worth it.
  fn tracks_oversized(&self) -> bool {
    self.default_size >= 4096
  }

  pub fn acquire_buffer(&mut self, size: usize) -> Buffer {
    if size <= self.default_size {
      if let Some(b) = self.default_buffers.pop() {
        return b;
      }
      return Buffer::with_capacity(self.default_size);
    }
    let rounded = round_up_to_multiple(size, self.default_size);
    if let Some(b) = self.pop_oversized_buffer(rounded) {
      return b;
    }
    Buffer::with_capacity(rounded)
  }

  pub fn release_buffer(&mut self, mut b: Buffer) {
    b.clear();
    let cap = b.capacity();
    if cap == self.default_size {
      self.default_buffers.push(b);
    } else if cap > self.default_size {
      self.push_oversized_buffer(b);
    }
    // smaller than default size: drop, matching chunk_free in the source.
  }

  /// If `b` is oversized, swaps it for a fresh default-size buffer and
  /// recycles the oversized allocation into the pool — relinquishing
  /// idle oversized memory back mid-request without releasing the
  /// whole chunk.
  pub fn yield_buffer(&mut self, b: &mut Buffer) {
    if b.capacity() <= self.default_size {
      return;
    }
    let fresh = self.acquire_buffer(self.default_size);
    let old = std::mem::replace(b, fresh);
    self.release_buffer(old);
  }

  fn pop_oversized_buffer(&mut self, sz: usize) -> Option<Buffer> {
    if !self.tracks_oversized() {
      return None;
    }
    match self.oversized_buffers.first() {
      Some(head) if head.capacity() >= sz => Some(self.oversized_buffers.remove(0)),
      _ => None,
    }
  }

  fn push_oversized_buffer(&mut self, b: Buffer) {
    if !self.tracks_oversized() {
      return;
    }
    if self.oversized_buffers.len() < self.oversized_cap {
      let sz = b.capacity();
      let pos = self
        .oversized_buffers
        .iter()
        .position(|existing| existing.capacity() < sz)
        .unwrap_or(self.oversized_buffers.len());
      self.oversized_buffers.insert(pos, b);
    } else if let Some(head) = self.oversized_buffers.first_mut() {
      if b.capacity() > head.capacity() {
        *head = b;
      }
      // else: b is smaller than everything retained; drop it.
    }
  }

  pub fn acquire_mem_chunk(&mut self, size: usize) -> Chunk {
    if size <= self.default_size {
      if let Some(c) = self.default_chunks.pop() {
        return c;
      }
      return Chunk::new_mem(Buffer::with_capacity(self.default_size));
    }
    let rounded = round_up_to_multiple(size, self.default_size);
    if let Some(c) = self.pop_oversized_chunk(rounded) {
      return c;
    }
    Chunk::new_mem(Buffer::with_capacity(rounded))
  }

  pub fn acquire_file_chunk(&mut self) -> Chunk {
    self.file_chunks.pop().unwrap_or_else(Chunk::new_file_shell)
  }

  pub fn release_chunk(&mut self, mut c: Chunk) {
    if c.is_file() {
      c.reset_file();
      self.file_chunks.push(c);
      return;
    }
    let cap = c.mem_capacity().unwrap();
    if cap == self.default_size {
      c.reset_mem();
      self.default_chunks.push(c);
    } else if cap > self.default_size {
      c.reset_mem();
      self.push_oversized_chunk(c);
    }
    // smaller one-off mem chunks are dropped rather than retained.
  }

  fn pop_oversized_chunk(&mut self, sz: usize) -> Option<Chunk> {
    if !self.tracks_oversized() {
      return None;
    }
    match self.oversized_chunks.first() {
      Some(head) if head.mem_capacity().unwrap() >= sz => Some(self.oversized_chunks.remove(0)),
      _ => None,
    }
  }

  fn push_oversized_chunk(&mut self, c: Chunk) {
    if !self.tracks_oversized() {
      return;
    }
    if self.oversized_chunks.len() < self.oversized_cap {
      let sz = c.mem_capacity().unwrap();
      let pos = self
        .oversized_chunks
        .iter()
        .position(|existing| existing.mem_capacity().unwrap() < sz)
        .unwrap_or(self.oversized_chunks.len());
      self.oversized_chunks.insert(pos, c);
    } else if let Some(head) = self.oversized_chunks.first_mut() {
      if c.mem_capacity().unwrap() > head.mem_capacity().unwrap() {
        *head = c;
      }
    }
  }

  /// Drops all freelist entries.
  pub fn clear(&mut self) {
    self.default_buffers.clear();
    self.oversized_buffers.clear();
    self.default_chunks.clear();
    self.oversized_chunks.clear();
    self.file_chunks.clear();
  }

  /// Full teardown. Identical to `clear` here: there is no separate
  /// lent-out-shell list to additionally reclaim.
  pub fn free(&mut self) {
    self.clear();
  }
}
