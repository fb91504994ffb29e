//! Zero-copy-capable chunk queue I/O core for assembling, spilling and
//! transferring HTTP request/response byte streams.
//!
//! A [`queue::ChunkQueue`] is an ordered sequence of heterogeneous
//! [`chunk::Chunk`]s — in-memory buffer regions or file regions — that
//! together form one logical byte stream. Producers append bytes or
//! whole files to the tail; the transfer engine moves data between
//! queues, spills it to a temp file once it crosses a size threshold,
//! and finally writes it out to a socket using whatever kernel-assisted
//! path (`sendfile`/`splice`/`mmap`) the platform supports, falling
//! back to a plain read/write loop when none apply.
//!
//! Chunks and their backing buffers are recycled through a per-worker
//! [`pool::Pool`] rather than round-tripping through the allocator on
//! every request.

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub(crate) mod macros;
pub mod platform;
pub mod pool;
pub mod queue;
pub mod tempdir;
pub mod trampoline;

pub use buffer::Buffer;
pub use chunk::{Chunk, FileChunk, FileFd, RefChangeHook};
pub use config::Config;
pub use error::{QueueError, TempDirError};
pub use pool::{Pool, PoolHandle};
pub use queue::ChunkQueue;
pub use tempdir::TempDirPolicy;
