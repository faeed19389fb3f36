//! In-memory storage backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{ImageSink, StorageBackend};
use crate::error::{AppResult, MerlinError};
use crate::frame::{Image, PixelDepth};

#[derive(Debug, Default)]
struct Store {
    files: HashMap<PathBuf, Vec<Image>>,
    open_sinks: usize,
}

/// Keeps every "file" as a vector of images keyed by path.
///
/// Clones share the same store, so a test can hand one clone to the worker
/// and inspect the frames through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Store>> {
        lock_store(&self.store)
    }

    /// Copy of the frames stored at `path`.
    pub fn frames(&self, path: &Path) -> AppResult<Vec<Image>> {
        Ok(self.lock()?.files.get(path).cloned().unwrap_or_default())
    }

    /// Number of frames stored at `path`.
    pub fn frame_count(&self, path: &Path) -> AppResult<usize> {
        Ok(self.lock()?.files.get(path).map_or(0, Vec::len))
    }

    /// Sinks opened and not yet closed.
    pub fn open_sinks(&self) -> AppResult<usize> {
        Ok(self.lock()?.open_sinks)
    }
}

fn lock_store(store: &Mutex<Store>) -> AppResult<MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| MerlinError::Storage("memory store lock poisoned".to_string()))
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &Path) -> AppResult<Box<dyn ImageSink>> {
        let mut store = self.lock()?;
        let existing = store.files.entry(path.to_path_buf()).or_default();
        let depth = existing.first().map(Image::depth);
        debug!(path = %path.display(), existing = existing.len(), "opened memory sink");
        store.open_sinks += 1;

        Ok(Box::new(MemorySink {
            store: Arc::clone(&self.store),
            path: path.to_path_buf(),
            depth,
            written: 0,
        }))
    }
}

struct MemorySink {
    store: Arc<Mutex<Store>>,
    path: PathBuf,
    depth: Option<PixelDepth>,
    written: u64,
}

impl ImageSink for MemorySink {
    fn append(&mut self, image: Image) -> AppResult<()> {
        match self.depth {
            Some(depth) if depth != image.depth() => {
                return Err(MerlinError::Storage(format!(
                    "{} holds {} frames, cannot append {}",
                    self.path.display(),
                    depth.tag(),
                    image.depth().tag()
                )));
            }
            Some(_) => {}
            None => self.depth = Some(image.depth()),
        }

        lock_store(&self.store)?
            .files
            .entry(self.path.clone())
            .or_default()
            .push(image);
        self.written += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }

    fn close(self: Box<Self>) -> AppResult<()> {
        let mut store = lock_store(&self.store)?;
        store.open_sinks = store.open_sinks.saturating_sub(1);
        debug!(path = %self.path.display(), written = self.written, "closed memory sink");
        Ok(())
    }
}
