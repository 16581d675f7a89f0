//! Dense 2D/3D sample volumes with physical voxel spacing.
//!
//! A [`Volume`] either owns a resident `ndarray` buffer or a memory-mapped backing file.
//! Everything downstream (block extraction, convolution, the Poisson update) works on
//! `ndarray` views and never needs to know which storage is in use.
//!
//! Backing file format: raw native-endian `f32` samples in row-major order, no header.
//! The shape is tracked by the [`Volume`] itself.

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

use crate::error::{DeconvolutionError, Result};

/// A memory-mapped `f32` buffer. The backing file is removed when the buffer is dropped.
#[derive(Debug)]
struct MappedBuffer {
    map: MmapMut,
    path: PathBuf,
}

impl MappedBuffer {
    fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(DeconvolutionError::UnsupportedConfiguration(
                "cannot memory-map an empty volume".to_string(),
            ));
        }
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        // set_len zero-fills the file
        file.set_len((len * size_of::<f32>()) as u64)?;
        let map = unsafe {
            MmapMut::map_mut(&file).map_err(|e| DeconvolutionError::MapBackingFile {
                path: path.to_path_buf(),
                source: e,
            })?
        };
        Ok(MappedBuffer {
            map,
            path: path.to_path_buf(),
        })
    }

    fn samples(&self) -> &[f32] {
        bytemuck::cast_slice(&self.map[..])
    }

    fn samples_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut self.map[..])
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::debug!("could not remove backing file {:?}: {err}", self.path);
        }
    }
}

#[derive(Debug)]
enum Storage {
    Resident(ArrayD<f32>),
    Mapped(MappedBuffer),
}

/// A dense N-dimensional `f32` volume plus its voxel spacing (one value per axis).
#[derive(Debug)]
pub struct Volume {
    storage: Storage,
    shape: Vec<usize>,
    spacing: Vec<f32>,
}

fn check_spacing(shape: &[usize], spacing: &[f32]) -> Result<()> {
    if shape.len() != spacing.len() {
        return Err(DeconvolutionError::mismatch(&[shape.len()], &[spacing.len()]));
    }
    Ok(())
}

impl Volume {
    /// Wraps a resident array.
    ///
    /// # Errors
    /// `DimensionMismatch` if `spacing` does not have one entry per axis.
    pub fn new(data: ArrayD<f32>, spacing: Vec<f32>) -> Result<Self> {
        let shape = data.shape().to_vec();
        check_spacing(&shape, &spacing)?;
        Ok(Volume {
            storage: Storage::Resident(data.as_standard_layout().into_owned()),
            shape,
            spacing,
        })
    }

    /// A zero-filled resident volume.
    pub fn zeros(shape: &[usize], spacing: Vec<f32>) -> Result<Self> {
        Volume::new(ArrayD::zeros(IxDyn(shape)), spacing)
    }

    /// A zero-filled volume backed by a memory-mapped file at `path`.
    ///
    /// The file is created (or truncated) and removed again when the volume is dropped.
    pub fn mapped_zeros(path: &Path, shape: &[usize], spacing: Vec<f32>) -> Result<Self> {
        check_spacing(shape, &spacing)?;
        let len = shape.iter().product();
        let buffer = MappedBuffer::create(path, len)?;
        Ok(Volume {
            storage: Storage::Mapped(buffer),
            shape: shape.to_vec(),
            spacing,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn spacing(&self) -> &[f32] {
        &self.spacing
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_memory_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped(_))
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        match &self.storage {
            Storage::Resident(data) => data.view(),
            Storage::Mapped(buffer) => ArrayViewD::from_shape(IxDyn(&self.shape), buffer.samples())
                .expect("mapped buffer is sized from its shape at allocation"),
        }
    }

    pub fn view_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        match &mut self.storage {
            Storage::Resident(data) => data.view_mut(),
            Storage::Mapped(buffer) => {
                ArrayViewMutD::from_shape(IxDyn(&self.shape), buffer.samples_mut())
                    .expect("mapped buffer is sized from its shape at allocation")
            }
        }
    }

    /// Samples in row-major order. Both storages are contiguous.
    pub fn as_slice(&self) -> &[f32] {
        match &self.storage {
            Storage::Resident(data) => data
                .as_slice()
                .expect("resident volumes are kept in standard layout"),
            Storage::Mapped(buffer) => buffer.samples(),
        }
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        match &mut self.storage {
            Storage::Resident(data) => data
                .as_slice_mut()
                .expect("resident volumes are kept in standard layout"),
            Storage::Mapped(buffer) => buffer.samples_mut(),
        }
    }

    /// Copies `other` into this volume.
    pub fn assign_from(&mut self, other: &Volume) -> Result<()> {
        if self.shape != other.shape {
            return Err(DeconvolutionError::mismatch(&self.shape, &other.shape));
        }
        self.as_slice_mut().copy_from_slice(other.as_slice());
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.as_slice_mut().fill(value);
    }

    /// Sum of all samples, accumulated in `f64`.
    pub fn sum(&self) -> f64 {
        self.as_slice().iter().map(|&v| v as f64).sum()
    }

    /// A resident copy of this volume.
    pub fn to_resident(&self) -> Volume {
        Volume {
            storage: Storage::Resident(self.view().to_owned()),
            shape: self.shape.clone(),
            spacing: self.spacing.clone(),
        }
    }

    /// Consumes the volume and returns its samples as an owned array.
    pub fn into_array(self) -> ArrayD<f32> {
        match self.storage {
            Storage::Resident(data) => data,
            Storage::Mapped(ref buffer) => {
                ArrayViewD::from_shape(IxDyn(&self.shape), buffer.samples())
                    .expect("mapped buffer is sized from its shape at allocation")
                    .to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    #[test]
    fn test_spacing_must_match_rank() {
        let data = ArrayD::<f32>::zeros(IxDyn(&[4, 4]));
        let err = Volume::new(data, vec![1.0, 1.0, 1.0]).unwrap_err();
        assert!(matches!(err, DeconvolutionError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_resident_views_share_samples() {
        let mut volume = Volume::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn(), vec![1.0, 1.0])
            .unwrap();
        volume.view_mut()[[1, 0]] = 7.0;
        assert_eq!(volume.view()[[1, 0]], 7.0);
        assert_eq!(volume.as_slice(), &[1.0, 2.0, 7.0, 4.0]);
        assert_eq!(volume.sum(), 14.0);
        assert!(!volume.is_memory_mapped());
    }

    #[test]
    fn test_mapped_volume_behaves_like_resident() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estimate.dat");
        let mut mapped = Volume::mapped_zeros(&path, &[2, 3, 4], vec![1.0, 0.5, 0.5]).unwrap();
        assert!(mapped.is_memory_mapped());
        assert!(path.exists());
        assert_eq!(mapped.sum(), 0.0);

        let source = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 12 + y * 4 + x) as f32);
        let resident = Volume::new(source.clone().into_dyn(), vec![1.0, 0.5, 0.5]).unwrap();
        mapped.assign_from(&resident).unwrap();

        assert_eq!(mapped.view(), source.view().into_dyn());
        mapped.view_mut()[[1, 2, 3]] = -1.0;
        assert_eq!(mapped.as_slice()[23], -1.0);

        let copy = mapped.to_resident();
        assert!(!copy.is_memory_mapped());
        assert_eq!(copy.spacing(), &[1.0, 0.5, 0.5]);
    }

    #[test]
    fn test_mapped_backing_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.dat");
        let volume = Volume::mapped_zeros(&path, &[8, 8], vec![1.0, 1.0]).unwrap();
        drop(volume);
        assert!(!path.exists());
    }

    #[test]
    fn test_assign_from_rejects_other_shape() {
        let mut a = Volume::zeros(&[4, 4], vec![1.0, 1.0]).unwrap();
        let b = Volume::zeros(&[4, 5], vec![1.0, 1.0]).unwrap();
        assert!(matches!(
            a.assign_from(&b),
            Err(DeconvolutionError::DimensionMismatch { .. })
        ));
    }
}
