//! 8-bit rendering of an estimate for quick inspection.

use ndarray::{ArrayD, ArrayViewD};
use rayon::prelude::*;

/// Median of a slice, `0.0` for an empty one.
fn median_slice(data: &mut [f32]) -> f32 {
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if n % 2 == 1 {
        data[n / 2]
    } else {
        (data[n / 2 - 1] + data[n / 2]) / 2.0
    }
}

/// Median filter with a window of three samples along every axis.
///
/// Samples outside the volume count as zeros, so edge voxels are pulled towards zero.
pub fn median_filter_3(data: &ArrayViewD<'_, f32>) -> ArrayD<f32> {
    let shape = data.shape().to_vec();
    let ndim = shape.len();
    let window = 3usize.pow(ndim as u32);
    let mut filtered = ArrayD::<f32>::zeros(data.raw_dim());

    filtered
        .as_slice_mut()
        .expect("freshly allocated arrays are in standard layout")
        .par_iter_mut()
        .enumerate()
        .for_each(|(flat, out)| {
            // row-major unravel of the flat sample index
            let mut index = vec![0usize; ndim];
            let mut rest = flat;
            for axis in (0..ndim).rev() {
                index[axis] = rest % shape[axis];
                rest /= shape[axis];
            }

            let mut samples = Vec::with_capacity(window);
            let mut offset = vec![0usize; ndim];
            let mut position = vec![0usize; ndim];
            for _ in 0..window {
                let mut inside = true;
                for axis in 0..ndim {
                    // offset 0, 1, 2 maps to -1, 0, +1
                    let p = index[axis] as isize + offset[axis] as isize - 1;
                    if p < 0 || p >= shape[axis] as isize {
                        inside = false;
                        break;
                    }
                    position[axis] = p as usize;
                }
                samples.push(if inside { data[position.as_slice()] } else { 0.0 });

                for axis in (0..ndim).rev() {
                    offset[axis] += 1;
                    if offset[axis] < 3 {
                        break;
                    }
                    offset[axis] = 0;
                }
            }
            *out = median_slice(&mut samples);
        });
    filtered
}

/// Renders `data` to 8 bits: optional 3-wide median denoising, scaling so the maximum maps
/// to 255, negative values clamped to 0.
///
/// A volume without a positive maximum renders as all zeros.
pub fn to_8bit(data: &ArrayViewD<'_, f32>, denoise: bool) -> ArrayD<u8> {
    let image = if denoise {
        median_filter_3(data)
    } else {
        data.to_owned()
    };

    let max = image
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::MIN, f32::max);
    if max <= 0.0 {
        return ArrayD::zeros(image.raw_dim());
    }

    let scale = 255.0 / max;
    image.mapv(|v| {
        let scaled = v * scale;
        if scaled.is_finite() && scaled > 0.0 {
            scaled.min(255.0) as u8
        } else {
            0
        }
    })
}
