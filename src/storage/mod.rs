//! Append-only image storage.
//!
//! A [`StorageBackend`] opens one [`ImageSink`] per job. Opening a path that
//! already holds data reopens it and appends after the existing frames. The
//! dataset schema (frame shape and element width) is fixed by the first image
//! appended to a fresh sink.
//!
//! Backends:
//! - [`MemoryBackend`]: always available, keeps frames in process memory.
//! - [`Hdf5Backend`]: chunked, compressed HDF5 datasets. Requires the
//!   `storage_hdf5` feature; without it `open` fails with
//!   `MerlinError::FeatureNotEnabled`.

pub mod hdf5_sink;
pub mod memory;

use std::path::Path;

use crate::error::AppResult;
use crate::frame::Image;

pub use hdf5_sink::Hdf5Backend;
pub use memory::MemoryBackend;

/// An open, append-only image store.
pub trait ImageSink: Send {
    /// Append one image after the frames already stored.
    fn append(&mut self, image: Image) -> AppResult<()>;

    /// Frames appended through this sink (not counting pre-existing ones).
    fn frames_written(&self) -> u64;

    /// Flush and release the underlying store.
    fn close(self: Box<Self>) -> AppResult<()>;
}

/// Factory for [`ImageSink`]s.
pub trait StorageBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create `path`, or reopen it for appending if it exists.
    fn open(&self, path: &Path) -> AppResult<Box<dyn ImageSink>>;
}
