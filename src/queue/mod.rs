//! One logical byte stream: an ordered sequence of [`Chunk`]s plus the
//! cumulative `bytes_in`/`bytes_out` counters. Operations are split
//! across sibling modules the same way the design's own headings do:
//! [`append`], [`transfer`], [`spill`], [`writeout`], [`peek`].
//!
//! `VecDeque<Chunk>` stands in for an intrusive singly-linked list;
//! every traversal here walks front-to-back the same way a `first`/
//! `next` chain would.

use std::collections::VecDeque;

use crate::chunk::Chunk;
use crate::config::Config;
use crate::pool::PoolHandle;
use crate::tempdir::TempDirPolicy;

pub mod append;
pub mod peek;
pub mod spill;
pub mod transfer;
pub mod writeout;

pub struct ChunkQueue {
  pub(crate) chunks: VecDeque<Chunk>,
  pub(crate) bytes_in: u64,
  pub(crate) bytes_out: u64,
  pub(crate) pool: PoolHandle,
  pub(crate) tempdirs: TempDirPolicy,
  pub(crate) upload_temp_file_size: u64,
  /// Size of the in-flight `reserve_tail`/`reserve_head` write-pointer
  /// reservation, if any; cleared by the matching `commit_*` call.
  pub(crate) pending_reserve: Option<usize>,
}

impl ChunkQueue {
  pub fn new(pool: PoolHandle, config: &Config) -> Self {
    Self {
      chunks: VecDeque::new(),
      bytes_in: 0,
      bytes_out: 0,
      pool,
      tempdirs: TempDirPolicy::new(config.tempdirs.clone()),
      upload_temp_file_size: config.upload_temp_file_size,
      pending_reserve: None,
    }
  }

  pub fn bytes_in(&self) -> u64 {
    self.bytes_in
  }

  pub fn bytes_out(&self) -> u64 {
    self.bytes_out
  }

  pub fn is_empty(&self) -> bool {
    self.chunks.is_empty()
  }

  pub fn chunk_count(&self) -> usize {
    self.chunks.len()
  }

  /// Front-to-back view of the queue's chunks, for callers that need
  /// to inspect shape (tests, diagnostics) rather than just length.
  pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
    self.chunks.iter()
  }

  /// Sum of remaining lengths of every chunk still queued; equal to
  /// `bytes_in - bytes_out` for a queue whose invariants hold.
  pub fn length(&self) -> u64 {
    self.chunks.iter().map(Chunk::remaining).sum()
  }

  /// Releases every chunk back to the pool and zeroes the counters,
  /// without dropping the queue itself.
  pub fn reset(&mut self) {
    self.drain_to_pool();
    self.bytes_in = 0;
    self.bytes_out = 0;
    self.pending_reserve = None;
  }

  pub(crate) fn release_chunk(&mut self, c: Chunk) {
    self.pool.borrow_mut().release_chunk(c);
  }

  pub(crate) fn drain_to_pool(&mut self) {
    while let Some(c) = self.chunks.pop_front() {
      self.release_chunk(c);
    }
  }
}

impl Drop for ChunkQueue {
  fn drop(&mut self) {
    self.drain_to_pool();
  }
}
