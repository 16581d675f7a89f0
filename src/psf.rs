//! Point Spread Function preparation.
//!
//! The PSF is delivered on its own voxel grid. Before a run it is resampled onto the image
//! grid, renormalized to unit sum and mirrored through its centre voxel to obtain the
//! adjoint kernel used by the backward blur of the Richardson-Lucy update.

use interp1d::Interp1d;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};

use crate::error::{check_rank, DeconvolutionError, Result};
use crate::volume::Volume;

/// Resampled PSF and its point reflection, both on the image voxel grid.
#[derive(Debug)]
pub struct PreparedPsf {
    pub psf: Volume,
    pub adjoint: Volume,
}

/// Resamples `lane` (samples at integer positions `0..lane.len()`) to `new_len` samples with
/// corner-aligned linear interpolation.
fn resample_lane(lane: &[f32], new_len: usize) -> Result<Vec<f32>> {
    let old_len = lane.len();
    if old_len == 1 {
        return Ok(vec![lane[0]; new_len]);
    }
    let last = (old_len - 1) as f32;
    let knots: Vec<f32> = (0..old_len).map(|i| i as f32).collect();
    let interp = Interp1d::new_unsorted(knots, lane.to_vec()).map_err(|err| {
        DeconvolutionError::UnsupportedConfiguration(format!(
            "PSF interpolation failed: {err:?}"
        ))
    })?;

    if new_len == 1 {
        return Ok(vec![interp.interpolate(last / 2.0)]);
    }
    let step = last / (new_len - 1) as f32;
    Ok((0..new_len)
        .map(|i| interp.interpolate((i as f32 * step).min(last)))
        .collect())
}

/// Zooms `data` along `axis` by `factor`. The output extent is `round(len * factor)`, at
/// least one sample.
fn zoom_axis(data: ArrayViewD<'_, f32>, axis: usize, factor: f32) -> Result<ArrayD<f32>> {
    let old_len = data.len_of(Axis(axis));
    let new_len = ((old_len as f32 * factor).round() as usize).max(1);
    if new_len == old_len {
        return Ok(data.to_owned());
    }

    let mut shape = data.shape().to_vec();
    shape[axis] = new_len;
    let mut zoomed = ArrayD::<f32>::zeros(IxDyn(&shape));

    for (src, mut dst) in data
        .lanes(Axis(axis))
        .into_iter()
        .zip(zoomed.lanes_mut(Axis(axis)))
    {
        let samples: Vec<f32> = src.iter().copied().collect();
        for (out, value) in dst.iter_mut().zip(resample_lane(&samples, new_len)?) {
            *out = value;
        }
    }
    Ok(zoomed)
}

/// Grows every even-length axis by one trailing zero so the kernel has a centre voxel.
fn pad_to_odd_extent(data: ArrayD<f32>) -> ArrayD<f32> {
    if data.shape().iter().all(|len| len % 2 == 1) {
        return data;
    }
    let shape: Vec<usize> = data.shape().iter().map(|len| len | 1).collect();
    let mut padded = ArrayD::<f32>::zeros(IxDyn(&shape));
    padded
        .slice_each_axis_mut(|axis| Slice::from(0..data.len_of(axis.axis)))
        .assign(&data);
    padded
}

/// Mirrors `data` through its centre (reverses every axis).
pub fn point_reflect(data: ArrayViewD<'_, f32>) -> ArrayD<f32> {
    let mut reflected = data.to_owned();
    for axis in 0..reflected.ndim() {
        reflected.invert_axis(Axis(axis));
    }
    reflected.as_standard_layout().into_owned()
}

/// Resamples `psf` onto `target_spacing` and derives its adjoint kernel.
///
/// The zoom factor along each axis is `psf_spacing / target_spacing`. Resampling is
/// separable linear interpolation on corner-aligned grids; an axis with a zoom of exactly
/// one is copied unchanged. Even extents are then grown by one zero sample so the kernel
/// and its point reflection share the same centre voxel, which makes the backward blur
/// the exact transpose of the forward blur. Finally the samples are normalized to sum 1.
///
/// # Errors
/// - `DimensionMismatch` if `target_spacing` does not match the PSF rank.
/// - `UnsupportedRank` for PSFs that are not 2D or 3D.
/// - `UnsupportedConfiguration` for non-positive spacings or a PSF without energy.
pub fn prepare(psf: &Volume, target_spacing: &[f32]) -> Result<PreparedPsf> {
    check_rank(psf.ndim())?;
    if target_spacing.len() != psf.ndim() {
        return Err(DeconvolutionError::mismatch(&[psf.ndim()], &[target_spacing.len()]));
    }

    let mut data = psf.view().to_owned();
    for (axis, (&from, &to)) in psf.spacing().iter().zip(target_spacing).enumerate() {
        let factor = from / to;
        if !factor.is_finite() || factor <= 0.0 {
            return Err(DeconvolutionError::UnsupportedConfiguration(format!(
                "cannot zoom PSF axis {axis} from spacing {from} to {to}"
            )));
        }
        if factor != 1.0 {
            data = zoom_axis(data.view(), axis, factor)?;
        }
    }
    let mut data = pad_to_odd_extent(data);

    let total: f64 = data.iter().map(|&v| v as f64).sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(DeconvolutionError::UnsupportedConfiguration(format!(
            "PSF must have a positive, finite sum, got {total}"
        )));
    }
    data.mapv_inplace(|v| (v as f64 / total) as f32);

    log::debug!(
        "PSF resampled from {:?} to {:?} voxels",
        psf.shape(),
        data.shape()
    );

    let adjoint = point_reflect(data.view());
    Ok(PreparedPsf {
        psf: Volume::new(data, target_spacing.to_vec())?,
        adjoint: Volume::new(adjoint, target_spacing.to_vec())?,
    })
}

/// Separable Gaussian kernel with the given per-axis sigma, normalized to unit sum.
#[cfg(test)]
pub(crate) fn gaussian_kernel(shape: &[usize], sigma: f32) -> ArrayD<f32> {
    let mut kernel = ArrayD::<f32>::from_shape_fn(IxDyn(shape), |index| {
        (0..shape.len())
            .map(|axis| {
                let centre = (shape[axis] as f32 - 1.0) / 2.0;
                let d = index[axis] as f32 - centre;
                (-d * d / (2.0 * sigma * sigma)).exp()
            })
            .product()
    });
    let total = kernel.sum();
    kernel.mapv_inplace(|v| v / total);
    kernel
}
