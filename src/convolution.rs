//! "Same"-mode N-dimensional convolution in the frequency domain.
//!
//! A [`FftConvolver`] is built once per kernel and block shape: it plans the per-axis FFTs
//! for the linear-convolution size `block + kernel - 1` and caches the kernel spectrum.
//! The plans are immutable and shared, so one convolver can serve every block of an
//! iteration from several rayon workers at once.

use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use num_complex::Complex32;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};

use crate::error::{DeconvolutionError, Result};

/// Cached FFT convolution of fixed-shape inputs with a fixed kernel.
pub struct FftConvolver {
    input_shape: Vec<usize>,
    kernel_shape: Vec<usize>,
    full_shape: Vec<usize>,
    forward: Vec<Arc<dyn Fft<f32>>>,
    inverse: Vec<Arc<dyn Fft<f32>>>,
    kernel_spectrum: ArrayD<Complex32>,
}

impl std::fmt::Debug for FftConvolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftConvolver")
            .field("input_shape", &self.input_shape)
            .field("kernel_shape", &self.kernel_shape)
            .field("full_shape", &self.full_shape)
            .finish()
    }
}

/// Runs the planned 1D transform over every lane of every axis.
fn transform(data: &mut ArrayD<Complex32>, plans: &[Arc<dyn Fft<f32>>]) {
    for (axis, plan) in plans.iter().enumerate() {
        let len = data.len_of(Axis(axis));
        let mut buffer = vec![Complex32::zero(); len];
        let mut scratch = vec![Complex32::zero(); plan.get_inplace_scratch_len()];
        for mut lane in data.lanes_mut(Axis(axis)) {
            for (b, v) in buffer.iter_mut().zip(lane.iter()) {
                *b = *v;
            }
            plan.process_with_scratch(&mut buffer, &mut scratch);
            for (v, b) in lane.iter_mut().zip(&buffer) {
                *v = *b;
            }
        }
    }
}

/// Copies `real` into the leading corner of a zeroed complex array of `shape`.
fn zero_padded(real: &ArrayViewD<'_, f32>, shape: &[usize]) -> ArrayD<Complex32> {
    let mut padded = ArrayD::<Complex32>::zeros(IxDyn(shape));
    padded
        .slice_each_axis_mut(|axis| Slice::from(0..real.len_of(axis.axis)))
        .zip_mut_with(real, |c, &r| *c = Complex32::new(r, 0.0));
    padded
}

impl FftConvolver {
    /// Plans the convolution of inputs shaped `input_shape` with `kernel`.
    ///
    /// # Errors
    /// `DimensionMismatch` if the kernel rank differs from the input rank.
    pub fn new(kernel: ArrayViewD<'_, f32>, input_shape: &[usize]) -> Result<Self> {
        if kernel.ndim() != input_shape.len() {
            return Err(DeconvolutionError::mismatch(
                &[input_shape.len()],
                &[kernel.ndim()],
            ));
        }
        let kernel_shape = kernel.shape().to_vec();
        let full_shape: Vec<usize> = input_shape
            .iter()
            .zip(&kernel_shape)
            .map(|(&n, &k)| n + k - 1)
            .collect();

        let mut planner = FftPlanner::<f32>::new();
        let forward: Vec<_> = full_shape.iter().map(|&n| planner.plan_fft_forward(n)).collect();
        let inverse: Vec<_> = full_shape.iter().map(|&n| planner.plan_fft_inverse(n)).collect();

        let mut kernel_spectrum = zero_padded(&kernel, &full_shape);
        transform(&mut kernel_spectrum, &forward);

        Ok(FftConvolver {
            input_shape: input_shape.to_vec(),
            kernel_shape,
            full_shape,
            forward,
            inverse,
            kernel_spectrum,
        })
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Convolves `input` with the kernel and returns the central part of the full linear
    /// convolution, with the same shape as `input`.
    ///
    /// # Errors
    /// `DimensionMismatch` if `input` does not have the planned shape.
    pub fn convolve_same(&self, input: &ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        if input.shape() != self.input_shape.as_slice() {
            return Err(DeconvolutionError::mismatch(&self.input_shape, input.shape()));
        }

        let mut spectrum = zero_padded(input, &self.full_shape);
        transform(&mut spectrum, &self.forward);
        spectrum.zip_mut_with(&self.kernel_spectrum, |s, k| *s *= *k);
        transform(&mut spectrum, &self.inverse);

        let scale = 1.0 / self.full_shape.iter().product::<usize>() as f32;
        let centre = spectrum.slice_each_axis(|axis| {
            let a = axis.axis.index();
            let start = (self.kernel_shape[a] - 1) / 2;
            Slice::from(start..start + self.input_shape[a])
        });
        Ok(centre.mapv(|c| c.re * scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};

    /// Direct "same" convolution for reference.
    fn direct_same_2d(input: &Array2<f32>, kernel: &Array2<f32>) -> Array2<f32> {
        let (h, w) = input.dim();
        let (kh, kw) = kernel.dim();
        let (oy, ox) = ((kh - 1) / 2, (kw - 1) / 2);
        Array2::from_shape_fn((h, w), |(y, x)| {
            let mut acc = 0.0;
            for ky in 0..kh {
                for kx in 0..kw {
                    let iy = (y + oy) as isize - ky as isize;
                    let ix = (x + ox) as isize - kx as isize;
                    if iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w {
                        acc += input[[iy as usize, ix as usize]] * kernel[[ky, kx]];
                    }
                }
            }
            acc
        })
    }

    #[test]
    fn test_impulse_kernel_is_identity() {
        let input = Array3::from_shape_fn((4, 5, 6), |(z, y, x)| (z * 30 + y * 6 + x) as f32);
        let mut kernel = ArrayD::<f32>::zeros(IxDyn(&[3, 3, 3]));
        kernel[[1, 1, 1]] = 1.0;
        let convolver = FftConvolver::new(kernel.view(), &[4, 5, 6]).unwrap();
        let output = convolver.convolve_same(&input.view().into_dyn()).unwrap();
        assert_eq!(output.shape(), &[4, 5, 6]);
        for (a, b) in output.iter().zip(input.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_matches_direct_convolution() {
        let input = Array2::from_shape_fn((9, 7), |(y, x)| ((y * 7 + x) % 5) as f32 + 0.5);
        let kernel = Array2::from_shape_fn((3, 5), |(y, x)| (1 + y + 2 * x) as f32 / 10.0);
        let expected = direct_same_2d(&input, &kernel);

        let convolver = FftConvolver::new(kernel.view().into_dyn(), &[9, 7]).unwrap();
        let output = convolver.convolve_same(&input.view().into_dyn()).unwrap();
        for (a, b) in output.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_shifted_impulse_shifts_image() {
        // kernel mass one voxel right of centre moves content one voxel right
        let input = Array2::from_shape_fn((5, 5), |(y, x)| (y * 5 + x) as f32);
        let mut kernel = ArrayD::<f32>::zeros(IxDyn(&[3, 3]));
        kernel[[1, 2]] = 1.0;
        let convolver = FftConvolver::new(kernel.view(), &[5, 5]).unwrap();
        let output = convolver.convolve_same(&input.view().into_dyn()).unwrap();
        assert_abs_diff_eq!(output[[2, 0]], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(output[[2, 3]], input[[2, 2]], epsilon = 1e-4);
    }

    #[test]
    fn test_rejects_unplanned_shape() {
        let kernel = ArrayD::<f32>::ones(IxDyn(&[3, 3]));
        let convolver = FftConvolver::new(kernel.view(), &[8, 8]).unwrap();
        let input = ArrayD::<f32>::zeros(IxDyn(&[8, 9]));
        assert!(matches!(
            convolver.convolve_same(&input.view()),
            Err(DeconvolutionError::DimensionMismatch { .. })
        ));
        assert!(FftConvolver::new(kernel.view(), &[8, 8, 8]).is_err());
    }
}
