//! Run configuration for the deconvolution engine.
//!
//! The configuration is built once (from defaults, a JSON job file or code), validated and
//! then handed to [`crate::deconvolution::RichardsonLucy::new`]. It is never mutated
//! during a run.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::blocks::SUPPORTED_BLOCK_COUNTS;
use crate::error::{DeconvolutionError, Result};

/// Strategy used to seed the first estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum FirstEstimate {
    /// A copy of the observed image.
    #[default]
    Image,
    /// A constant field equal to the mean of the observed image.
    ImageMean,
    /// A constant field equal to `estimate_constant`.
    Constant,
}

impl Display for FirstEstimate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FirstEstimate::Image => write!(f, "image"),
            FirstEstimate::ImageMean => write!(f, "image_mean"),
            FirstEstimate::Constant => write!(f, "constant"),
        }
    }
}

impl FromStr for FirstEstimate {
    type Err = DeconvolutionError;

    fn from_str(token: &str) -> Result<Self> {
        match token {
            "image" => Ok(FirstEstimate::Image),
            "image_mean" => Ok(FirstEstimate::ImageMean),
            "constant" => Ok(FirstEstimate::Constant),
            other => Err(DeconvolutionError::UnsupportedConfiguration(format!(
                "unknown first estimate strategy {other:?}"
            ))),
        }
    }
}

impl TryFrom<String> for FirstEstimate {
    type Error = DeconvolutionError;

    fn try_from(token: String) -> Result<Self> {
        token.parse()
    }
}

/// Parameters of a Richardson-Lucy run.
///
/// # Fields
/// - `max_iterations`: Hard upper bound on the number of iterations.
/// - `convergence_epsilon`: Half-width of the window around a correction factor of 1.0
///   within which a voxel update is accepted as converged.
/// - `first_estimate`: How the first estimate is seeded.
/// - `estimate_constant`: Seed value for [`FirstEstimate::Constant`].
/// - `num_blocks`: Number of blocks the volume is split into per iteration. A 3D volume
///   asked for 12 blocks is split into 16 (4x2x2).
/// - `block_pad`: Voxels of context added on every side of a block.
/// - `stop_tau`: Relative-change threshold of the tau1 stopping rule.
/// - `disable_tau1`: Disables the tau1 rule (and the previous-estimate buffer).
/// - `tv_lambda`: Total-variation weight, `0.0` disables regularization.
/// - `memmap_estimates`: Keeps the estimate buffers in memory-mapped files.
/// - `save_intermediate_results`: Streams every iteration's estimate to the writer.
/// - `output_cast`: Additionally stores the result as an 8-bit rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionConfig {
    pub max_iterations: usize,
    pub convergence_epsilon: f32,
    pub first_estimate: FirstEstimate,
    pub estimate_constant: f32,
    pub num_blocks: usize,
    pub block_pad: usize,
    pub stop_tau: f32,
    pub disable_tau1: bool,
    pub tv_lambda: f32,
    pub memmap_estimates: bool,
    pub save_intermediate_results: bool,
    pub output_cast: bool,
}

impl Default for DeconvolutionConfig {
    fn default() -> Self {
        DeconvolutionConfig {
            max_iterations: 100,
            convergence_epsilon: 0.05,
            first_estimate: FirstEstimate::Image,
            estimate_constant: 1.0,
            num_blocks: 1,
            block_pad: 0,
            stop_tau: 0.002,
            disable_tau1: false,
            tv_lambda: 0.0,
            memmap_estimates: false,
            save_intermediate_results: false,
            output_cast: false,
        }
    }
}

impl DeconvolutionConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DeconvolutionError::UnsupportedConfiguration(msg));

        if self.max_iterations == 0 {
            return invalid("max_iterations must be > 0".to_string());
        }
        if !self.convergence_epsilon.is_finite() || self.convergence_epsilon <= 0.0 {
            return invalid(format!(
                "convergence_epsilon must be a positive number, got {}",
                self.convergence_epsilon
            ));
        }
        if !SUPPORTED_BLOCK_COUNTS.contains(&self.num_blocks) {
            return invalid(format!(
                "num_blocks must be one of {SUPPORTED_BLOCK_COUNTS:?}, got {}",
                self.num_blocks
            ));
        }
        if !self.tv_lambda.is_finite() || self.tv_lambda < 0.0 {
            return invalid(format!("tv_lambda must be >= 0, got {}", self.tv_lambda));
        }
        if !self.stop_tau.is_finite() {
            return invalid("stop_tau must be finite".to_string());
        }
        if !self.estimate_constant.is_finite() {
            return invalid("estimate_constant must be finite".to_string());
        }
        Ok(())
    }

    /// Whether the relative-change (tau1) stopping rule is active.
    pub fn tau1_enabled(&self) -> bool {
        !self.disable_tau1
    }
}
