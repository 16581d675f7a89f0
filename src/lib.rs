//! # rl_fusion
//!
//! Block-wise Richardson-Lucy deconvolution of 2D and 3D microscopy volumes.
//!
//! A run splits the working volume into a fixed number of blocks, blurs each block with
//! the PSF in the frequency domain, divides the observation by the blurred estimate and
//! blurs the quotient back with the point-reflected PSF. The resulting correction factor is
//! applied under a damped Poisson rule until the estimate converges, the iteration budget
//! is spent or the caller raises an abort flag.
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use rl_fusion::{io, DeconvolutionConfig, RichardsonLucy};
//!
//! # fn main() -> rl_fusion::Result<()> {
//! let image = io::load_npy_volume("image.npy".as_ref(), vec![0.2, 0.05, 0.05])?;
//! let psf = io::load_npy_volume("psf.npy".as_ref(), vec![0.1, 0.025, 0.025])?;
//! let mut run = RichardsonLucy::new(&image, &psf, DeconvolutionConfig::default(), None)?;
//! let state = run.execute(&AtomicBool::new(false))?;
//! println!("{state}: {:?}", run.result()?.shape());
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod config;
pub mod convolution;
pub mod deconvolution;
pub mod diagnostics;
pub mod error;
pub mod io;
pub mod preview;
pub mod psf;
pub mod regularization;
pub mod update;
pub mod volume;

pub use config::{DeconvolutionConfig, FirstEstimate};
pub use deconvolution::{EstimateWriter, RichardsonLucy, RunState};
pub use diagnostics::{Diagnostics, IterationRecord};
pub use error::{DeconvolutionError, Result};
pub use volume::Volume;
