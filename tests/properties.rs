//! Property-based tests for the queue's core invariants: byte
//! identity, conservation, monotonicity, steal equivalence, the spill
//! threshold bound, temp-file cleanup, fd ownership under duplication,
//! and idempotent `compact_mem`.

use std::cell::Cell;
use std::rc::Rc;

use chunkio::chunk::{Chunk, FileFd, RefChangeHook};
use chunkio::config::Config;
use chunkio::pool::Pool;
use chunkio::ChunkQueue;
use proptest::prelude::*;

fn fresh() -> ChunkQueue {
  ChunkQueue::new(Pool::new(), &Config::default())
}

fn small_bytes() -> impl Strategy<Value = Vec<u8>> {
  prop::collection::vec(any::<u8>(), 0..4096)
}

proptest! {
  /// Appending a sequence of mem runs and then peeking a prefix returns
  /// exactly that prefix of the concatenated input, and
  /// `bytes_in - bytes_out` always equals the sum of remaining chunk
  /// lengths.
  #[test]
  fn byte_identity_and_conservation(runs in prop::collection::vec(small_bytes(), 0..8), take_frac in 0.0f64..1.0) {
    let mut cq = fresh();
    let mut expected = Vec::new();
    for run in &runs {
      cq.append_mem(run);
      expected.extend_from_slice(run);
    }

    let remaining: u64 = cq.chunks().map(Chunk::remaining).sum();
    prop_assert_eq!(cq.bytes_in() - cq.bytes_out(), remaining);

    let take = ((expected.len() as f64) * take_frac) as usize;
    let peeked = cq.peek_data(take).unwrap();
    prop_assert_eq!(peeked.len(), take);
    prop_assert_eq!(&peeked[..], &expected[..take]);
    drop(peeked);

    // peek never mutates bytes_out.
    prop_assert_eq!(cq.bytes_out(), 0);
  }

  /// Across an arbitrary interleaving of append and mark_written calls,
  /// both counters only ever increase.
  #[test]
  fn counters_never_decrease(ops in prop::collection::vec((any::<bool>(), 1usize..200), 0..30)) {
    let mut cq = fresh();
    let mut prev_in = 0u64;
    let mut prev_out = 0u64;
    for (is_append, n) in ops {
      if is_append {
        cq.append_mem(&vec![0u8; n]);
      } else {
        let drain = (n as u64).min(cq.length());
        cq.mark_written(drain);
      }
      prop_assert!(cq.bytes_in() >= prev_in);
      prop_assert!(cq.bytes_out() >= prev_out);
      prev_in = cq.bytes_in();
      prev_out = cq.bytes_out();
    }
  }

  /// Stealing `n` bytes from `src` into `dst` produces the same
  /// observable dst contents and src residue as peeking `n` bytes out
  /// of `src` and appending them to `dst` directly, followed by
  /// marking `src` written by `n`.
  #[test]
  fn steal_matches_peek_then_append_then_mark_written(
    runs in prop::collection::vec(small_bytes(), 1..6),
    take_frac in 0.0f64..1.0,
  ) {
    let total: usize = runs.iter().map(Vec::len).sum();
    prop_assume!(total > 0);
    let n = ((total as f64) * take_frac) as u64;

    let build = || {
      let mut cq = fresh();
      for run in &runs {
        cq.append_mem(run);
      }
      cq
    };

    let mut src_a = build();
    let mut dst_a = fresh();
    dst_a.steal(&mut src_a, n).unwrap();

    let mut src_b = build();
    let mut dst_b = fresh();
    let peeked = src_b.peek_data(n as usize).unwrap().into_owned();
    dst_b.append_mem(&peeked);
    src_b.mark_written(n);

    prop_assert_eq!(src_a.length(), src_b.length());
    prop_assert_eq!(src_a.bytes_out(), src_b.bytes_out());
    prop_assert_eq!(dst_a.length(), dst_b.length());

    let out_a = dst_a.peek_data(dst_a.length() as usize).unwrap().into_owned();
    let out_b = dst_b.peek_data(dst_b.length() as usize).unwrap().into_owned();
    prop_assert_eq!(out_a, out_b);
  }

  /// After spilling a total of T bytes with threshold U, the number of
  /// temp chunks created is at most ceil(T/U) + 1, and no MEM chunk
  /// ever precedes a FILE chunk once spilling has begun.
  #[test]
  fn spill_threshold_bounds_temp_chunk_count(total in 1usize..50_000, threshold in 256u64..8192) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::new(8192, vec![dir.path().to_path_buf()], threshold);
    let mut cq = ChunkQueue::new(Pool::new(), &cfg);

    let payload = vec![0xABu8; total];
    cq.append_mem_to_tempfile(&payload).unwrap();

    let max_chunks = total as u64 / threshold + 2; // ceil(T/U) + 1, generous by one for integer rounding
    prop_assert!(cq.chunk_count() as u64 <= max_chunks);
    prop_assert!(cq.chunks().all(Chunk::is_file));
    prop_assert_eq!(cq.length(), total as u64);
  }

  /// Calling `compact_mem(k)` twice in a row is observationally
  /// identical to calling it once.
  #[test]
  fn compact_mem_is_idempotent(runs in prop::collection::vec(small_bytes(), 1..6), k in 0usize..8192) {
    let mut cq = fresh();
    for run in &runs {
      cq.append_mem(run);
    }
    let before = cq.peek_data(cq.length() as usize).unwrap().into_owned();

    cq.compact_mem(k);
    let after_first = cq.peek_data(cq.length() as usize).unwrap().into_owned();
    let count_after_first = cq.chunk_count();

    cq.compact_mem(k);
    let after_second = cq.peek_data(cq.length() as usize).unwrap().into_owned();

    prop_assert_eq!(&before[..], &after_first[..]);
    prop_assert_eq!(&after_first[..], &after_second[..]);
    prop_assert_eq!(count_after_first, cq.chunk_count());
  }
}

/// Releasing a queue that holds temp FILE chunks unlinks exactly those
/// paths from disk.
#[test]
fn dropping_queue_unlinks_its_temp_files() {
  let dir = tempfile::tempdir().unwrap();
  let cfg = Config::new(8192, vec![dir.path().to_path_buf()], 4096);
  let mut cq = ChunkQueue::new(Pool::new(), &cfg);
  cq.append_mem_to_tempfile(&vec![1u8; 10_000]).unwrap();

  let paths: Vec<std::path::PathBuf> = cq.chunks().map(|c| c.as_file().unwrap().path().to_path_buf()).collect();
  assert!(!paths.is_empty());
  for p in &paths {
    assert!(p.exists());
  }

  drop(cq);

  for p in &paths {
    assert!(!p.exists(), "temp file {p:?} should have been unlinked on release");
  }
}

/// Duplicating a FILE chunk without a refchg hook (via `steal`'s
/// partial-chunk split) produces a distinct fd from the original;
/// duplicating one with a hook calls `refchg(+1)` exactly once per
/// duplicate and `refchg(-1)` exactly once per release.
#[test]
fn refcount_hook_fires_once_per_duplicate_and_release() {
  let count = Rc::new(Cell::new(0i32));
  let hook_count = count.clone();
  let hook = RefChangeHook::new(move |delta| hook_count.set(hook_count.get() + delta));

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("shared");
  std::fs::write(&path, vec![9u8; 100]).unwrap();
  let fd = chunkio::platform::open_cloexec(&path, libc::O_RDONLY, 0).unwrap();

  let mut src = fresh();
  src.append_file_refcounted(path, fd, 0, 100, hook);
  assert_eq!(count.get(), 1, "construction should bump the refcount once");

  let mut dst = fresh();
  // Split a partial range out of the refcounted chunk: this duplicates
  // the FileChunk and must bump the hook again, once.
  dst.steal(&mut src, 40).unwrap();
  assert_eq!(count.get(), 2, "partial steal should duplicate and bump refcount once more");

  drop(src);
  assert_eq!(count.get(), 1, "releasing the stolen-from remainder should drop its ref");

  drop(dst);
  assert_eq!(count.get(), 0, "releasing the duplicate should drop its ref too");
}

/// fd duplication without a refchg hook yields a genuinely distinct fd
/// from the original (not a copy of the same descriptor number) — a
/// partial `steal` of an already-open FILE chunk must `dup` it.
#[test]
fn duplicate_without_refcount_hook_gets_a_distinct_fd() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("plain");
  std::fs::write(&path, vec![1u8; 200]).unwrap();
  let opened = chunkio::platform::open_cloexec(&path, libc::O_RDONLY, 0).unwrap();

  let mut src = fresh();
  src.append_file_fd(path, opened, 0, 200);

  let mut dst = fresh();
  dst.steal(&mut src, 50).unwrap();

  let src_fd = match src.chunks().next().unwrap().as_file().unwrap().fd() {
    FileFd::Open(fd) => fd,
    other => panic!("expected src's remainder to still be open, got {other:?}"),
  };
  let dst_fd = match dst.chunks().next().unwrap().as_file().unwrap().fd() {
    FileFd::Open(fd) => fd,
    other => panic!("expected dst's duplicate to be open, got {other:?}"),
  };

  assert_ne!(src_fd, dst_fd, "a plain (non-refcounted) duplicate must get its own fd via dup");
}
