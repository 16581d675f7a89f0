//! One Richardson-Lucy update of the estimate.
//!
//! Per block: forward blur of the estimate, guarded division of the observation by the
//! blurred estimate, backward blur with the adjoint kernel. The unpadded block centres are
//! assembled into the new-estimate buffer, which then holds a multiplicative correction
//! factor per voxel. The optional TV term rescales that factor, and the Poisson rule
//! finally applies it to the current estimate while tallying the photon statistics.

use std::ops::Add;
use std::sync::Mutex;

use ndarray::{ArrayD, Slice, Zip};
use rayon::prelude::*;

use crate::blocks::{extract_block, BlockGeometry};
use crate::convolution::FftConvolver;
use crate::error::{check_rank, DeconvolutionError, Result};
use crate::psf::PreparedPsf;
use crate::regularization::div_unit_grad;
use crate::volume::Volume;

/// Photon statistics of one update.
///
/// # Fields
/// - `e`: Photons in voxels whose correction was within epsilon of 1 (converged).
/// - `s`: Photons in voxels whose correction shrank them.
/// - `u`: Photons in voxels whose correction grew them (damped).
/// - `n`: Number of voxels rejected for a negative or non-finite correction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoissonStats {
    pub e: f64,
    pub s: f64,
    pub u: f64,
    pub n: u64,
}

impl PoissonStats {
    /// Photons remaining in the estimate after the update.
    pub fn total_photons(&self) -> f64 {
        self.e + self.s + self.u
    }

    /// Less than one photon sits in growing voxels and no voxel was rejected.
    pub fn is_settled(&self) -> bool {
        self.u < 1.0 && self.n == 0
    }
}

impl Add for PoissonStats {
    type Output = PoissonStats;

    fn add(self, other: PoissonStats) -> PoissonStats {
        PoissonStats {
            e: self.e + other.e,
            s: self.s + other.s,
            u: self.u + other.u,
            n: self.n + other.n,
        }
    }
}

/// `image / blurred` with every non-finite quotient replaced by zero.
#[inline]
pub fn guarded_ratio(image: f32, blurred: f32) -> f32 {
    let ratio = image / blurred;
    if ratio.is_finite() {
        ratio
    } else {
        0.0
    }
}

/// Multiplies `estimate` by `correction` voxel by voxel and tallies the statistics.
///
/// Corrections within `epsilon` of 1 and shrinking corrections are applied as is; growing
/// corrections are capped at `1 / epsilon`. A negative or non-finite correction zeroes its
/// voxel and counts as rejected. Negative or non-finite estimate values are treated as 0.
///
/// # Errors
/// `DimensionMismatch` if the two buffers differ in length.
pub fn apply_poisson_rule(
    estimate: &mut [f32],
    correction: &[f32],
    epsilon: f32,
) -> Result<PoissonStats> {
    if estimate.len() != correction.len() {
        return Err(DeconvolutionError::mismatch(
            &[estimate.len()],
            &[correction.len()],
        ));
    }
    let max_growth = 1.0 / epsilon;

    Ok(estimate
        .par_iter_mut()
        .zip(correction.par_iter())
        .fold(PoissonStats::default, |mut stats, (x, &c)| {
            let old = if x.is_finite() && *x > 0.0 { *x } else { 0.0 };
            if !c.is_finite() || c < 0.0 {
                *x = 0.0;
                stats.n += 1;
            } else if (c - 1.0).abs() <= epsilon {
                *x = old * c;
                stats.e += *x as f64;
            } else if c < 1.0 {
                *x = old * c;
                stats.s += *x as f64;
            } else {
                *x = old * c.min(max_growth);
                stats.u += *x as f64;
            }
            stats
        })
        .reduce(PoissonStats::default, |a, b| a + b))
}

/// Applies the Richardson-Lucy update for a fixed block layout and kernel pair.
#[derive(Debug)]
pub struct EstimateUpdater {
    geometry: BlockGeometry,
    pad: usize,
    forward: FftConvolver,
    backward: FftConvolver,
    tv_lambda: f32,
    convergence_epsilon: f32,
    spacing: Vec<f32>,
}

impl EstimateUpdater {
    /// Plans the block convolutions. Kernel spectra are computed here, once per run.
    ///
    /// # Errors
    /// - `UnsupportedRank` if the layout is not 2D or 3D.
    /// - `DimensionMismatch` if the kernel rank differs from the layout rank.
    pub fn new(
        geometry: BlockGeometry,
        pad: usize,
        kernels: &PreparedPsf,
        tv_lambda: f32,
        convergence_epsilon: f32,
    ) -> Result<Self> {
        check_rank(geometry.block_size.len())?;
        let padded_block = geometry.padded_block_size(pad);
        let forward = FftConvolver::new(kernels.psf.view(), &padded_block)?;
        let backward = FftConvolver::new(kernels.adjoint.view(), &padded_block)?;
        Ok(EstimateUpdater {
            geometry,
            pad,
            forward,
            backward,
            tv_lambda,
            convergence_epsilon,
            spacing: kernels.psf.spacing().to_vec(),
        })
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// Computes the correction factor of every voxel into `estimate_new`.
    fn correction(&self, estimate: &Volume, estimate_new: &mut Volume, image: &Volume) -> Result<()> {
        let estimate_view = estimate.view();
        let image_view = image.view();
        let block_size = &self.geometry.block_size;
        let pad = self.pad;
        let target = Mutex::new(estimate_new.view_mut());

        self.geometry
            .block_origins()
            .par_iter()
            .try_for_each(|origin| -> Result<()> {
                let estimate_block = extract_block(&estimate_view, origin, block_size, pad)?;
                let image_block = extract_block(&image_view, origin, block_size, pad)?;

                let mut ratio = self.forward.convolve_same(&estimate_block.view())?;
                Zip::from(&mut ratio)
                    .and(&image_block)
                    .for_each(|b, &i| *b = guarded_ratio(i, b.max(0.0)));
                let mut correction = self.backward.convolve_same(&ratio.view())?;
                // FFT round-off leaves tiny negatives where the exact result is zero
                correction.mapv_inplace(|v| v.max(0.0));

                let centre = correction.slice_each_axis(|axis| {
                    let a = axis.axis.index();
                    Slice::from(pad..pad + block_size[a])
                });
                let mut target = target.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                target
                    .slice_each_axis_mut(|axis| {
                        let a = axis.axis.index();
                        Slice::from(origin[a]..origin[a] + block_size[a])
                    })
                    .assign(&centre);
                Ok(())
            })
    }

    /// Divides the correction by `1 - tv_lambda * div(grad x / |grad x|)` of the current
    /// estimate `x`.
    fn regularize(&self, estimate: &Volume, estimate_new: &mut Volume) -> Result<()> {
        let divergence: ArrayD<f32> = div_unit_grad(&estimate.view(), &self.spacing)?;
        let lambda = self.tv_lambda;
        Zip::from(estimate_new.view_mut())
            .and(&divergence)
            .for_each(|c, &d| {
                let scaled = *c / (1.0 - lambda * d);
                *c = if scaled.is_finite() { scaled } else { 0.0 };
            });
        Ok(())
    }

    /// Runs one update. On return `estimate` holds the new estimate and `estimate_new` the
    /// correction factors that produced it.
    ///
    /// The TV term is skipped on the `first_iteration`.
    ///
    /// # Errors
    /// `DimensionMismatch` if any buffer is not shaped like the padded working volume.
    pub fn update(
        &self,
        estimate: &mut Volume,
        estimate_new: &mut Volume,
        image: &Volume,
        first_iteration: bool,
    ) -> Result<PoissonStats> {
        let expected = &self.geometry.padded_image_size;
        for buffer in [&*estimate, &*estimate_new, image] {
            check_rank(buffer.ndim())?;
            if buffer.shape() != expected.as_slice() {
                return Err(DeconvolutionError::mismatch(expected, buffer.shape()));
            }
        }

        self.correction(estimate, estimate_new, image)?;
        if self.tv_lambda > 0.0 && !first_iteration {
            self.regularize(estimate, estimate_new)?;
        }
        apply_poisson_rule(
            estimate.as_slice_mut(),
            estimate_new.as_slice(),
            self.convergence_epsilon,
        )
    }
}
