//! A single fragment of a [`crate::queue::ChunkQueue`]'s byte stream:
//! either an in-memory buffer region or a file region. Modeled as a
//! tagged sum with two variants rather than one fused struct with an
//! inline type tag; the enum discriminant carries that role instead.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::error::QueueError;
use crate::platform;

/// An external (+1/−1) reference-count callback for an fd shared with
/// another subsystem. When present on a [`FileChunk`], the fd is never
/// closed directly; `refchg(-1)` is called on reset instead.
#[derive(Clone)]
pub struct RefChangeHook(Rc<dyn Fn(i32)>);

impl RefChangeHook {
  pub fn new(f: impl Fn(i32) + 'static) -> Self {
    Self(Rc::new(f))
  }

  pub(crate) fn change(&self, delta: i32) {
    (self.0)(delta)
  }
}

impl std::fmt::Debug for RefChangeHook {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("RefChangeHook(..)")
  }
}

/// The fd lifecycle of a [`FileChunk`]: not yet opened, open, or
/// already torn down (guards against a double-close after reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFd {
  Unopened,
  Open(RawFd),
  Closed,
}

#[derive(Debug)]
pub(crate) struct MmapWindow {
  pub(crate) ptr: *mut u8,
  pub(crate) map_offset: i64,
  pub(crate) map_len: usize,
}

impl Drop for MmapWindow {
  fn drop(&mut self) {
    platform::munmap(self.ptr, self.map_len);
  }
}

#[derive(Debug)]
pub struct FileChunk {
  pub(crate) path: PathBuf,
  pub(crate) fd: FileFd,
  pub(crate) offset: u64,
  pub(crate) length: u64,
  pub(crate) mmap: Option<MmapWindow>,
  pub(crate) refcount: Option<RefChangeHook>,
  pub(crate) is_temp: bool,
}

impl FileChunk {
  fn blank() -> Self {
    Self {
      path: PathBuf::new(),
      fd: FileFd::Unopened,
      offset: 0,
      length: 0,
      mmap: None,
      refcount: None,
      is_temp: false,
    }
  }

  pub fn path(&self) -> &std::path::Path {
    &self.path
  }

  pub fn fd(&self) -> FileFd {
    self.fd
  }

  pub fn is_temp(&self) -> bool {
    self.is_temp
  }

  pub(crate) fn remaining(&self) -> u64 {
    self.length - self.offset
  }

  /// Releases owned OS resources: closes the fd (unless externally
  /// refcounted, in which case `refchg(-1)` runs instead), drops any
  /// mmap window, and unlinks the backing path if `is_temp` is set.
  /// Idempotent.
  pub(crate) fn teardown(&mut self) {
    self.mmap = None;
    if let Some(hook) = self.refcount.take() {
      hook.change(-1);
    } else if let FileFd::Open(fd) = self.fd {
      platform::close(fd);
    }
    self.fd = FileFd::Closed;
    if self.is_temp {
      self.is_temp = false;
      if !self.path.as_os_str().is_empty() {
        let _ = std::fs::remove_file(&self.path);
      }
    }
  }

  /// Blanks this shell for reuse from the pool's file-chunk freelist;
  /// `path`'s allocation is retained by `clear`-equivalent reuse.
  fn reset_for_reuse(&mut self) {
    self.teardown();
    self.path.clear();
    self.offset = 0;
    self.length = 0;
    self.fd = FileFd::Unopened;
  }

  /// Opens the backing file lazily if needed, returning its fd.
  /// Non-temp files are `fstat`-checked against the chunk's declared
  /// `length` to catch the file having shrunk out from under us; temp
  /// files skip that check since their length is our own bookkeeping.
  pub(crate) fn ensure_open(&mut self) -> Result<RawFd, QueueError> {
    match self.fd {
      FileFd::Open(fd) => Ok(fd),
      FileFd::Closed => Err(QueueError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "file chunk fd already closed",
      ))),
      FileFd::Unopened => {
        let fd = platform::open_cloexec(&self.path, libc::O_RDONLY, 0).map_err(QueueError::Io)?;
        if !self.is_temp {
          let actual = platform::fstat_size(fd).map_err(QueueError::Io)?;
          if actual < self.length {
            platform::close(fd);
            return Err(QueueError::FileShrunk { path: self.path.clone(), expected: self.length, actual });
          }
        }
        self.fd = FileFd::Open(fd);
        Ok(fd)
      }
    }
  }

  /// Duplicates this chunk's fd (or bumps its refcount hook) for a
  /// split during `steal`/`append_cq_range`. The temp-file flag is
  /// never carried to the duplicate, so unlink discipline stays with
  /// whichever half is the original.
  pub(crate) fn duplicate(&self) -> std::io::Result<FileChunk> {
    let fd = match (&self.refcount, self.fd) {
      (Some(hook), fd @ FileFd::Open(_)) => {
        hook.change(1);
        fd
      }
      (Some(_), other) => other,
      (None, FileFd::Open(fd)) => FileFd::Open(platform::dup_cloexec(fd)?),
      (None, other) => other,
    };
    Ok(FileChunk {
      path: self.path.clone(),
      fd,
      offset: self.offset,
      length: self.length,
      mmap: None,
      refcount: self.refcount.clone(),
      is_temp: false,
    })
  }
}

#[derive(Debug)]
pub(crate) enum ChunkBody {
  Mem { buf: Buffer, offset: usize },
  File(FileChunk),
}

#[derive(Debug)]
pub struct Chunk {
  pub(crate) body: ChunkBody,
}

impl Chunk {
  pub fn new_mem(buf: Buffer) -> Self {
    Self { body: ChunkBody::Mem { buf, offset: 0 } }
  }

  pub fn new_file(path: PathBuf, fd: FileFd, offset: u64, length: u64, is_temp: bool) -> Self {
    Self {
      body: ChunkBody::File(FileChunk {
        path,
        fd,
        offset,
        length,
        mmap: None,
        refcount: None,
        is_temp,
      }),
    }
  }

  pub fn new_file_with_refcount(
    path: PathBuf,
    fd: FileFd,
    offset: u64,
    length: u64,
    refcount: RefChangeHook,
  ) -> Self {
    refcount.change(1);
    Self {
      body: ChunkBody::File(FileChunk {
        path,
        fd,
        offset,
        length,
        mmap: None,
        refcount: Some(refcount),
        is_temp: false,
      }),
    }
  }

  pub(crate) fn new_file_shell() -> Self {
    Self { body: ChunkBody::File(FileChunk::blank()) }
  }

  pub fn is_mem(&self) -> bool {
    matches!(self.body, ChunkBody::Mem { .. })
  }

  pub fn is_file(&self) -> bool {
    matches!(self.body, ChunkBody::File(_))
  }

  pub fn as_mem(&self) -> Option<(&Buffer, usize)> {
    match &self.body {
      ChunkBody::Mem { buf, offset } => Some((buf, *offset)),
      ChunkBody::File(_) => None,
    }
  }

  pub fn as_mem_mut(&mut self) -> Option<(&mut Buffer, &mut usize)> {
    match &mut self.body {
      ChunkBody::Mem { buf, offset } => Some((buf, offset)),
      ChunkBody::File(_) => None,
    }
  }

  pub fn as_file(&self) -> Option<&FileChunk> {
    match &self.body {
      ChunkBody::File(f) => Some(f),
      ChunkBody::Mem { .. } => None,
    }
  }

  pub fn as_file_mut(&mut self) -> Option<&mut FileChunk> {
    match &mut self.body {
      ChunkBody::File(f) => Some(f),
      ChunkBody::Mem { .. } => None,
    }
  }

  pub fn remaining(&self) -> u64 {
    match &self.body {
      ChunkBody::Mem { buf, offset } => (buf.used() - *offset) as u64,
      ChunkBody::File(f) => f.remaining(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.remaining() == 0
  }

  /// Advances the read cursor by `n` bytes without releasing the
  /// chunk, used by `mark_written`/`steal` for a partial leading chunk.
  pub(crate) fn advance_offset(&mut self, n: u64) {
    match &mut self.body {
      ChunkBody::Mem { offset, .. } => *offset += n as usize,
      ChunkBody::File(f) => f.offset += n,
    }
  }

  pub(crate) fn mem_capacity(&self) -> Option<usize> {
    match &self.body {
      ChunkBody::Mem { buf, .. } => Some(buf.capacity()),
      ChunkBody::File(_) => None,
    }
  }

  /// Clears the backing buffer and read cursor for recycling into the
  /// pool's mem freelists. Panics if called on a file chunk.
  pub(crate) fn reset_mem(&mut self) {
    match &mut self.body {
      ChunkBody::Mem { buf, offset } => {
        buf.clear();
        *offset = 0;
      }
      ChunkBody::File(_) => unreachable!("reset_mem called on a file chunk"),
    }
  }

  /// Tears down file resources and blanks the shell for recycling into
  /// the pool's file-chunk freelist. Panics if called on a mem chunk.
  pub(crate) fn reset_file(&mut self) {
    match &mut self.body {
      ChunkBody::File(f) => f.reset_for_reuse(),
      ChunkBody::Mem { .. } => unreachable!("reset_file called on a mem chunk"),
    }
  }
}

impl Drop for Chunk {
  fn drop(&mut self) {
    if let ChunkBody::File(f) = &mut self.body {
      f.teardown();
    }
  }
}
