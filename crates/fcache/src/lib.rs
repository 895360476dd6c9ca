#![forbid(unsafe_code)]
//! fcache public API facade.
//!
//! Re-exports the engine, the typed file wrapper and the backing-store
//! traits through one crate. This is the crate downstream consumers (CLI,
//! tools, embedders) depend on.

pub use fcache_core::{
    CacheConfig, CacheMetrics, CacheState, FileState, PageCache, PageState, QueuedOp,
};
pub use fcache_error::{FcError, Result};
pub use fcache_file::CachedFile;
pub use fcache_store::{ByteSource, FileSource, FsOpener, SourceOpener};
pub use fcache_types::{
    CachePolicy, FrameId, Handle, OpenMode, PAGE_SIZE, PageId, Whence,
};
