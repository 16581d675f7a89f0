//! Total-variation regularization term.
//!
//! Differences are taken with physical voxel spacing: central differences in the interior,
//! one-sided differences on the two edge samples and zero along axes of length one.

use ndarray::{ArrayD, ArrayViewD, Axis, Zip};

use crate::error::{DeconvolutionError, Result};

/// Derivative of `data` along `axis` for samples `spacing` apart.
pub fn gradient_along(data: &ArrayViewD<'_, f32>, axis: usize, spacing: f32) -> ArrayD<f32> {
    let mut derivative = ArrayD::<f32>::zeros(data.raw_dim());
    let len = data.len_of(Axis(axis));
    if len < 2 {
        return derivative;
    }

    for (lane, mut out) in data
        .lanes(Axis(axis))
        .into_iter()
        .zip(derivative.lanes_mut(Axis(axis)))
    {
        out[0] = (lane[1] - lane[0]) / spacing;
        out[len - 1] = (lane[len - 1] - lane[len - 2]) / spacing;
        for i in 1..len - 1 {
            out[i] = (lane[i + 1] - lane[i - 1]) / (2.0 * spacing);
        }
    }
    derivative
}

/// Divergence of the unit gradient field of `data`, `div(grad u / |grad u|)`.
///
/// Voxels with a zero gradient contribute a zero unit vector.
///
/// # Errors
/// `DimensionMismatch` if `spacing` does not have one entry per axis.
pub fn div_unit_grad(data: &ArrayViewD<'_, f32>, spacing: &[f32]) -> Result<ArrayD<f32>> {
    if spacing.len() != data.ndim() {
        return Err(DeconvolutionError::mismatch(&[data.ndim()], &[spacing.len()]));
    }

    let mut components: Vec<ArrayD<f32>> = spacing
        .iter()
        .enumerate()
        .map(|(axis, &h)| gradient_along(data, axis, h))
        .collect();

    let mut magnitude = ArrayD::<f32>::zeros(data.raw_dim());
    for component in &components {
        Zip::from(&mut magnitude)
            .and(component)
            .for_each(|m, &g| *m += g * g);
    }
    magnitude.mapv_inplace(f32::sqrt);

    for component in &mut components {
        Zip::from(component).and(&magnitude).for_each(|g, &m| {
            *g = if m > 0.0 { *g / m } else { 0.0 };
        });
    }

    let mut divergence = ArrayD::<f32>::zeros(data.raw_dim());
    for (axis, (component, &h)) in components.iter().zip(spacing).enumerate() {
        divergence += &gradient_along(&component.view(), axis, h);
    }
    Ok(divergence)
}
