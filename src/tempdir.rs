//! Ordered list of candidate spill directories with a rotating index,
//! consumed by `queue::spill` when a queue needs a fresh temp chunk.

use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::error::TempDirError;
use crate::platform;

const UPLOAD_PREFIX: &str = "chunkio-upload";

#[derive(Debug)]
pub struct TempDirPolicy {
  dirs: Vec<PathBuf>,
  idx: std::cell::Cell<usize>,
}

impl TempDirPolicy {
  pub fn new(dirs: Vec<PathBuf>) -> Self {
    Self { dirs, idx: std::cell::Cell::new(0) }
  }

  pub fn current_dir(&self) -> Option<&Path> {
    self.dirs.get(self.idx.get()).map(PathBuf::as_path)
  }

  fn advance(&self) {
    if !self.dirs.is_empty() {
      self.idx.set((self.idx.get() + 1) % self.dirs.len());
    }
  }

  /// Creates a unique spill file, iterating the configured
  /// directories in order starting from the current rotating index.
  /// Every failure advances the index; all directories must fail for
  /// the whole operation to fail.
  pub fn create_tempfile(&self) -> Result<(RawFd, PathBuf), TempDirError> {
    if self.dirs.is_empty() {
      return Err(TempDirError::NoDirectories);
    }
    let start = self.idx.get();
    let mut last_err: Option<io::Error> = None;
    let mut last_dir = self.dirs[start].clone();
    for _ in 0..self.dirs.len() {
      let dir = &self.dirs[self.idx.get()];
      last_dir = dir.clone();
      match platform::mkostemp_unique(dir, UPLOAD_PREFIX, 0) {
        Ok(ok) => return Ok(ok),
        Err(e) => {
          last_err = Some(e);
          self.advance();
        }
      }
    }
    Err(TempDirError::AllDirectoriesExhausted {
      last_dir,
      source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::Other)),
    })
  }

  /// Called on `ENOSPC`: advances the rotating index without
  /// attempting the failed directory again immediately.
  pub fn advance_on_disk_full(&self) {
    self.advance();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn creates_file_in_first_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let policy = TempDirPolicy::new(vec![dir.path().to_path_buf()]);
    let (fd, path) = policy.create_tempfile().unwrap();
    assert!(path.exists());
    platform::close(fd);
  }

  #[test]
  fn falls_through_to_second_dir_when_first_is_unwritable() {
    let good = tempfile::tempdir().unwrap();
    let bad = PathBuf::from("/nonexistent/path/for/chunkio/tests");
    let policy = TempDirPolicy::new(vec![bad, good.path().to_path_buf()]);
    let (fd, path) = policy.create_tempfile().unwrap();
    assert!(path.starts_with(good.path()));
    platform::close(fd);
  }

  #[test]
  fn all_directories_failing_is_an_error() {
    let policy = TempDirPolicy::new(vec![PathBuf::from("/nonexistent/a"), PathBuf::from("/nonexistent/b")]);
    assert!(policy.create_tempfile().is_err());
  }

  #[test]
  fn advance_on_disk_full_rotates_index() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let policy = TempDirPolicy::new(vec![a.path().to_path_buf(), b.path().to_path_buf()]);
    assert_eq!(policy.current_dir(), Some(a.path()));
    policy.advance_on_disk_full();
    assert_eq!(policy.current_dir(), Some(b.path()));
  }
}
