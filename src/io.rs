//! File collaborators of a run: `.npy` volumes, intermediate estimates, the diagnostics
//! table and a PNG preview.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use ndarray::{ArrayD, ArrayViewD, Axis, Ix2};
use ndarray_npy::{read_npy, write_npy};

use crate::deconvolution::EstimateWriter;
use crate::diagnostics::Diagnostics;
use crate::error::{check_rank, DeconvolutionError, Result};
use crate::volume::Volume;

/// Loads an `f32` volume from a `.npy` file and attaches `spacing`.
pub fn load_npy_volume(path: &Path, spacing: Vec<f32>) -> Result<Volume> {
    let data: ArrayD<f32> = read_npy(path)?;
    log::info!("loaded {:?} volume from {path:?}", data.shape());
    Volume::new(data, spacing)
}

pub fn save_npy_volume(path: &Path, volume: &Volume) -> Result<()> {
    write_npy(path, &volume.view())?;
    Ok(())
}

pub fn save_npy_u8(path: &Path, data: &ArrayD<u8>) -> Result<()> {
    write_npy(path, data)?;
    Ok(())
}

/// Writes every estimate it receives to `<dir>/estimate_NNNN.npy`, numbered from 1.
#[derive(Debug)]
pub struct NpyWriter {
    dir: PathBuf,
    written: usize,
}

impl NpyWriter {
    /// Creates `dir` if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(NpyWriter {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl EstimateWriter for NpyWriter {
    fn write(&mut self, estimate: &Volume) -> Result<()> {
        let path = self.dir.join(format!("estimate_{:04}.npy", self.written + 1));
        save_npy_volume(&path, estimate)?;
        self.written += 1;
        log::debug!("saved intermediate estimate to {path:?}");
        Ok(())
    }
}

/// Saves an 8-bit rendering as a grayscale PNG. 3D data is reduced to its central slice
/// along the first axis.
pub fn save_preview_png(path: &Path, data: &ArrayViewD<'_, u8>) -> Result<()> {
    check_rank(data.ndim())?;
    let slice = if data.ndim() == 3 {
        data.index_axis(Axis(0), data.len_of(Axis(0)) / 2)
    } else {
        data.view()
    };
    let plane = slice
        .into_dimensionality::<Ix2>()
        .map_err(|_| DeconvolutionError::UnsupportedRank(data.ndim()))?;

    let (height, width) = plane.dim();
    let img = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([plane[[y as usize, x as usize]]])
    });
    img.save(path)?;
    Ok(())
}

pub fn save_diagnostics_csv(path: &Path, diagnostics: &Diagnostics) -> Result<()> {
    let file = File::create(path)?;
    diagnostics.write_csv(BufWriter::new(file))
}
