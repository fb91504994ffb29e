use std::io;
use std::path::PathBuf;

/// All temp directories in the policy failed for one spill attempt.
#[derive(Debug, thiserror::Error)]
pub enum TempDirError {
  #[error("no temp directory available to create an upload spill file")]
  NoDirectories,
  #[error("every configured temp directory failed; last error ({last_dir}): {source}")]
  AllDirectoriesExhausted {
    last_dir: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Errors surfaced by chunk queue operations that are not plain syscall
/// failures (those stay `io::Error` at the point they occur).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("temp file setup failed: {0}")]
  TempDir(#[from] TempDirError),

  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  #[error("file chunk at {path:?} shrank: expected at least {expected} bytes, found {actual}")]
  FileShrunk {
    path: PathBuf,
    expected: u64,
    actual: u64,
  },

  #[error("squash input exceeds the 4 GiB guard ({0} bytes)")]
  SquashTooLarge(u64),
}
