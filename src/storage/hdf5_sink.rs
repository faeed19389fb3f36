//! HDF5 storage backend.
//!
//! Images go into one resizable 3-D dataset (default
//! `/entry/measurement/Merlin/data`) of shape `(n, 515, 515)`, chunked one
//! frame per chunk with shuffle + deflate compression. The dataset is created
//! on the first append, typed after that image's pixel depth. Reopening an
//! existing file appends after its last frame.

use std::path::Path;

use crate::config::StorageConfig;
use crate::error::AppResult;

use super::{ImageSink, StorageBackend};

/// Opens HDF5 files for appending detector images.
#[derive(Debug, Clone)]
pub struct Hdf5Backend {
    dataset_path: String,
    compression_level: u8,
}

impl Hdf5Backend {
    /// Backend writing to `config.dataset_path` at `config.compression_level`.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dataset_path: config.dataset_path.clone(),
            compression_level: config.compression_level,
        }
    }

    /// Whether this build can actually write HDF5.
    pub fn is_available() -> bool {
        cfg!(feature = "storage_hdf5")
    }
}

impl StorageBackend for Hdf5Backend {
    fn name(&self) -> &'static str {
        "hdf5"
    }

    #[cfg(feature = "storage_hdf5")]
    fn open(&self, path: &Path) -> AppResult<Box<dyn ImageSink>> {
        enabled::Hdf5Sink::open(path, &self.dataset_path, self.compression_level)
            .map(|sink| Box::new(sink) as Box<dyn ImageSink>)
    }

    #[cfg(not(feature = "storage_hdf5"))]
    fn open(&self, path: &Path) -> AppResult<Box<dyn ImageSink>> {
        tracing::error!(
            path = %path.display(),
            dataset = %self.dataset_path,
            compression = self.compression_level,
            "HDF5 storage requested but not compiled in"
        );
        Err(crate::error::MerlinError::FeatureNotEnabled(
            "storage_hdf5".to_string(),
        ))
    }
}

#[cfg(feature = "storage_hdf5")]
mod enabled {
    use std::path::{Path, PathBuf};

    use ::hdf5::{Dataset, File, Group, H5Type};
    use ndarray::ArrayView3;
    use tracing::{debug, info};

    use crate::error::{AppResult, MerlinError};
    use crate::frame::{Image, PixelData, FRAME_HEIGHT, FRAME_WIDTH};
    use crate::storage::ImageSink;

    fn storage_err(context: &str, err: ::hdf5::Error) -> MerlinError {
        MerlinError::Storage(format!("{}: {}", context, err))
    }

    pub(super) struct Hdf5Sink {
        file: File,
        path: PathBuf,
        dataset_path: String,
        compression_level: u8,
        dataset: Option<Dataset>,
        written: u64,
    }

    impl Hdf5Sink {
        pub(super) fn open(path: &Path, dataset_path: &str, compression_level: u8) -> AppResult<Self> {
            let (file, dataset) = if path.exists() {
                let file = File::open_rw(path).map_err(|e| storage_err("reopen", e))?;
                let dataset = file.dataset(dataset_path).ok();
                info!(
                    path = %path.display(),
                    existing_frames = dataset.as_ref().map_or(0, |ds| ds.shape().first().copied().unwrap_or(0)),
                    "Reopened HDF5 file for appending"
                );
                (file, dataset)
            } else {
                let file = File::create(path).map_err(|e| storage_err("create", e))?;
                info!(path = %path.display(), "Created HDF5 file");
                (file, None)
            };

            Ok(Self {
                file,
                path: path.to_path_buf(),
                dataset_path: dataset_path.to_string(),
                compression_level,
                dataset,
                written: 0,
            })
        }

        /// Walk (creating as needed) the groups above the dataset.
        fn parent_group(&self) -> AppResult<(Group, String)> {
            let trimmed = self.dataset_path.trim_matches('/');
            let (parents, name) = match trimmed.rsplit_once('/') {
                Some((parents, name)) => (parents, name),
                None => ("", trimmed),
            };

            let mut group: Group = (*self.file).clone();
            for component in parents.split('/').filter(|c| !c.is_empty()) {
                group = match group.group(component) {
                    Ok(existing) => existing,
                    Err(_) => group
                        .create_group(component)
                        .map_err(|e| storage_err("create group", e))?,
                };
            }
            Ok((group, name.to_string()))
        }

        fn create_dataset<T: H5Type>(&self) -> AppResult<Dataset> {
            let (group, name) = self.parent_group()?;
            let builder = group
                .new_dataset::<T>()
                .chunk((1, FRAME_HEIGHT, FRAME_WIDTH))
                .shape((0.., FRAME_HEIGHT, FRAME_WIDTH));
            let builder = if self.compression_level > 0 {
                builder.shuffle().deflate(self.compression_level)
            } else {
                builder
            };
            let dataset = builder
                .create(name.as_str())
                .map_err(|e| storage_err("create dataset", e))?;
            debug!(dataset = %self.dataset_path, element_bytes = std::mem::size_of::<T>(), "Created image dataset");
            Ok(dataset)
        }

        fn append_typed<T: H5Type>(&mut self, values: &[T]) -> AppResult<()> {
            let dataset = match &self.dataset {
                Some(dataset) => dataset.clone(),
                None => {
                    let dataset = self.create_dataset::<T>()?;
                    self.dataset = Some(dataset.clone());
                    dataset
                }
            };

            let element_size = dataset
                .dtype()
                .map_err(|e| storage_err("read dtype", e))?
                .size();
            if element_size != std::mem::size_of::<T>() {
                return Err(MerlinError::Storage(format!(
                    "{} stores {}-byte pixels, image has {}-byte pixels",
                    self.path.display(),
                    element_size,
                    std::mem::size_of::<T>()
                )));
            }

            let current = dataset.shape().first().copied().unwrap_or(0);
            dataset
                .resize((current + 1, FRAME_HEIGHT, FRAME_WIDTH))
                .map_err(|e| storage_err("resize", e))?;

            let view = ArrayView3::from_shape((1, FRAME_HEIGHT, FRAME_WIDTH), values)
                .map_err(|e| MerlinError::Storage(format!("image shape: {}", e)))?;
            dataset
                .write_slice(view, (current..current + 1, .., ..))
                .map_err(|e| storage_err("write frame", e))?;
            Ok(())
        }
    }

    impl ImageSink for Hdf5Sink {
        fn append(&mut self, image: Image) -> AppResult<()> {
            match image.pixels() {
                PixelData::U16(values) => self.append_typed(values)?,
                PixelData::U32(values) => self.append_typed(values)?,
            }
            self.written += 1;
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.written
        }

        fn close(self: Box<Self>) -> AppResult<()> {
            self.file.flush().map_err(|e| storage_err("flush", e))?;
            info!(path = %self.path.display(), frames = self.written, "Closed HDF5 file");
            Ok(())
        }
    }

}

#[cfg(all(test, not(feature = "storage_hdf5")))]
mod tests {
    use super::*;
    use crate::error::MerlinError;

    #[test]
    fn test_disabled_backend_reports_feature() {
        let backend = Hdf5Backend::new(&StorageConfig::default());
        assert!(!Hdf5Backend::is_available());
        assert!(matches!(
            backend.open(Path::new("scan.h5")),
            Err(MerlinError::FeatureNotEnabled(feature)) if feature == "storage_hdf5"
        ));
    }
}
