//! Block decomposition of a volume.
//!
//! The planner grows the working volume so it tiles exactly into a fixed number of blocks,
//! and the extractor cuts (optionally padded) blocks out of a buffer. Voxels of a padded
//! window that fall outside the buffer are zero; edges are neither mirrored nor wrapped.

use ndarray::{ArrayD, ArrayViewD, CowArray, IxDyn, Slice};

use crate::error::{check_rank, DeconvolutionError, Result};

/// Block counts with a known per-axis factorization.
pub const SUPPORTED_BLOCK_COUNTS: [usize; 10] = [1, 2, 4, 8, 12, 24, 48, 64, 96, 144];

/// Per-axis block multipliers for a requested block count.
fn multipliers(count: usize, rank: usize) -> Result<&'static [usize]> {
    check_rank(rank)?;
    let (rank3, rank2): (&'static [usize], &'static [usize]) = match count {
        1 => (&[1, 1, 1], &[1, 1]),
        2 => (&[2, 1, 1], &[2, 1]),
        4 => (&[4, 1, 1], &[2, 2]),
        8 => (&[4, 2, 1], &[4, 2]),
        // a 3D volume asked for 12 blocks is split into 16
        12 => (&[4, 2, 2], &[4, 3]),
        24 => (&[4, 3, 2], &[6, 4]),
        48 => (&[4, 4, 3], &[8, 6]),
        64 => (&[4, 4, 4], &[8, 8]),
        96 => (&[6, 4, 4], &[12, 8]),
        144 => (&[4, 6, 6], &[12, 12]),
        other => {
            return Err(DeconvolutionError::UnsupportedConfiguration(format!(
                "{other} blocks are not supported, use one of {SUPPORTED_BLOCK_COUNTS:?}"
            )))
        }
    };
    Ok(if rank == 3 { rank3 } else { rank2 })
}

/// Block layout of the working volume.
///
/// # Fields
/// - `block_size`: Unpadded block extent per axis.
/// - `padded_image_size`: Working volume extent, an exact multiple of `block_size`.
/// - `blocks_per_axis`: Number of blocks along each axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGeometry {
    pub block_size: Vec<usize>,
    pub padded_image_size: Vec<usize>,
    pub blocks_per_axis: Vec<usize>,
}

impl BlockGeometry {
    /// Total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks_per_axis.iter().product()
    }

    /// Shape of a block including `pad` voxels of context on every side.
    pub fn padded_block_size(&self, pad: usize) -> Vec<usize> {
        self.block_size.iter().map(|b| b + 2 * pad).collect()
    }

    /// Block origins in lexicographic order, first axis outermost.
    pub fn block_origins(&self) -> Vec<Vec<usize>> {
        let mut origins: Vec<Vec<usize>> = vec![Vec::with_capacity(self.block_size.len())];
        for (&count, &size) in self.blocks_per_axis.iter().zip(&self.block_size) {
            origins = origins
                .into_iter()
                .flat_map(|prefix| {
                    (0..count).map(move |i| {
                        let mut origin = prefix.clone();
                        origin.push(i * size);
                        origin
                    })
                })
                .collect();
        }
        origins
    }
}

/// Computes the block size and padded working size for `requested_block_count` blocks.
///
/// `block_size[a] = ceil(image_size[a] / multiplier[a])` and the working size is
/// `multiplier[a] * block_size[a]`, the smallest exact tiling that covers the image.
///
/// # Errors
/// - `UnsupportedRank` if the image is not 2D or 3D.
/// - `UnsupportedConfiguration` for an unsupported block count or an empty axis.
pub fn plan(image_size: &[usize], requested_block_count: usize) -> Result<BlockGeometry> {
    let multiplier = multipliers(requested_block_count, image_size.len())?;
    if image_size.contains(&0) {
        return Err(DeconvolutionError::UnsupportedConfiguration(format!(
            "cannot split an empty volume {image_size:?} into blocks"
        )));
    }

    let block_size: Vec<usize> = image_size
        .iter()
        .zip(multiplier)
        .map(|(&size, &m)| size.div_ceil(m))
        .collect();
    let padded_image_size = block_size
        .iter()
        .zip(multiplier)
        .map(|(&b, &m)| b * m)
        .collect();

    Ok(BlockGeometry {
        block_size,
        padded_image_size,
        blocks_per_axis: multiplier.to_vec(),
    })
}

/// Extracts the block at `origin` with `pad` voxels of context on every side.
///
/// The returned block always has the shape `block_size + 2 * pad`. When the padded window
/// lies inside `buffer` the block borrows from it; otherwise a zero-filled block is
/// allocated and the in-bounds overlap is copied to its relative offset.
///
/// # Errors
/// `DimensionMismatch` if `origin` or `block_size` do not have one entry per axis.
pub fn extract_block<'a>(
    buffer: &ArrayViewD<'a, f32>,
    origin: &[usize],
    block_size: &[usize],
    pad: usize,
) -> Result<CowArray<'a, f32, IxDyn>> {
    let ndim = buffer.ndim();
    if origin.len() != ndim {
        return Err(DeconvolutionError::mismatch(&[ndim], &[origin.len()]));
    }
    if block_size.len() != ndim {
        return Err(DeconvolutionError::mismatch(&[ndim], &[block_size.len()]));
    }

    let start: Vec<isize> = origin.iter().map(|&o| o as isize - pad as isize).collect();
    let extent: Vec<usize> = block_size.iter().map(|&b| b + 2 * pad).collect();
    let fits = start
        .iter()
        .zip(&extent)
        .zip(buffer.shape())
        .all(|((&s, &e), &len)| s >= 0 && s as usize + e <= len);

    if fits {
        let mut view = buffer.clone();
        view.slice_each_axis_inplace(|axis| {
            let i = axis.axis.index();
            let s = start[i] as usize;
            Slice::from(s..s + extent[i])
        });
        return Ok(CowArray::from(view));
    }

    let mut block = ArrayD::<f32>::zeros(IxDyn(&extent));
    let mut src = Vec::with_capacity(ndim);
    let mut dst = Vec::with_capacity(ndim);
    for axis in 0..ndim {
        let len = buffer.shape()[axis] as isize;
        let lo = start[axis].max(0);
        let hi = (start[axis] + extent[axis] as isize).min(len);
        if hi <= lo {
            // window misses the buffer entirely on this axis
            return Ok(CowArray::from(block));
        }
        src.push(lo as usize..hi as usize);
        dst.push((lo - start[axis]) as usize..(hi - start[axis]) as usize);
    }

    let source = buffer.slice_each_axis(|axis| Slice::from(src[axis.axis.index()].clone()));
    block
        .slice_each_axis_mut(|axis| Slice::from(dst[axis.axis.index()].clone()))
        .assign(&source);
    Ok(CowArray::from(block))
}
