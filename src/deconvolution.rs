//! Richardson-Lucy iteration controller.
//!
//! [`RichardsonLucy`] owns the estimate buffers and drives the update loop as an explicit
//! state machine:
//!
//! ```text
//! Initializing -> Iterating -> Converged | MaxIterationsReached | UserInterrupted -> Closed
//!                          \-> Failed -> Closed
//! ```
//!
//! Every iteration is committed as a whole. An abort request is honoured between
//! iterations only, and the diagnostics gathered up to that point are kept.

use std::fmt::{Display, Formatter};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use cancellable_loops::{loop_cancellable, LoopExit};
use ndarray::{ArrayD, Slice};
use tempfile::TempDir;

use crate::blocks::{plan, BlockGeometry};
use crate::config::{DeconvolutionConfig, FirstEstimate};
use crate::diagnostics::{Diagnostics, IterationRecord};
use crate::error::{check_rank, DeconvolutionError, Result};
use crate::preview::to_8bit;
use crate::psf::prepare;
use crate::update::EstimateUpdater;
use crate::volume::Volume;

/// Lifecycle of a deconvolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Iterating,
    Converged,
    MaxIterationsReached,
    UserInterrupted,
    /// An update or the estimate writer returned an error.
    Failed,
    Closed,
}

impl RunState {
    /// Whether the run has stopped iterating.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Converged
                | RunState::MaxIterationsReached
                | RunState::UserInterrupted
                | RunState::Failed
                | RunState::Closed
        )
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Initializing => write!(f, "initializing"),
            RunState::Iterating => write!(f, "iterating"),
            RunState::Converged => write!(f, "converged"),
            RunState::MaxIterationsReached => write!(f, "maximum number of iterations reached"),
            RunState::UserInterrupted => write!(f, "interrupted by user"),
            RunState::Failed => write!(f, "failed"),
            RunState::Closed => write!(f, "closed"),
        }
    }
}

/// Receives the estimate after every iteration when intermediate results are saved.
pub trait EstimateWriter: Send {
    /// Persists `estimate`, already cropped to the original image size.
    fn write(&mut self, estimate: &Volume) -> Result<()>;
}

/// Estimate buffers of a run, all shaped like the padded working volume.
///
/// The scratch directory is declared last so mapped files are unmapped and removed
/// before the directory itself.
#[derive(Debug)]
struct Buffers {
    image: Volume,
    estimate: Volume,
    estimate_new: Volume,
    prev_estimate: Option<Volume>,
    scratch_dir: Option<TempDir>,
}

/// Copies the leading `size` corner of `volume` into a new resident volume.
fn crop_to(volume: &Volume, size: &[usize]) -> Result<Volume> {
    let cropped = volume
        .view()
        .slice_each_axis(|axis| Slice::from(0..size[axis.axis.index()]))
        .to_owned();
    Volume::new(cropped, volume.spacing().to_vec())
}

/// `sum |estimate - previous| / sum |previous|`.
fn relative_change(estimate: &Volume, previous: &Volume) -> f64 {
    let (diff, norm) = estimate
        .as_slice()
        .iter()
        .zip(previous.as_slice())
        .fold((0.0f64, 0.0f64), |(diff, norm), (&x, &p)| {
            (diff + (x - p).abs() as f64, norm + p.abs() as f64)
        });
    if norm > 0.0 {
        diff / norm
    } else if diff == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

/// A Richardson-Lucy deconvolution run over one observed volume.
pub struct RichardsonLucy {
    config: DeconvolutionConfig,
    image_size: Vec<usize>,
    updater: EstimateUpdater,
    buffers: Option<Buffers>,
    diagnostics: Diagnostics,
    writer: Option<Box<dyn EstimateWriter>>,
    state: RunState,
    iteration_count: usize,
    initial_photons: f64,
}

impl RichardsonLucy {
    /// Prepares a run: validates `config`, plans the block layout, resamples the PSF to the
    /// image spacing, allocates the estimate buffers and seeds the first estimate.
    ///
    /// `writer` receives every iteration's estimate when `save_intermediate_results` is set.
    ///
    /// # Errors
    /// - `UnsupportedConfiguration` for invalid settings, or intermediate results requested
    ///   without a writer.
    /// - `UnsupportedRank` / `DimensionMismatch` for unsupported or disagreeing volumes.
    /// - `Io` / `MapBackingFile` if memory-mapped buffers cannot be created.
    pub fn new(
        image: &Volume,
        psf: &Volume,
        config: DeconvolutionConfig,
        writer: Option<Box<dyn EstimateWriter>>,
    ) -> Result<Self> {
        config.validate()?;
        check_rank(image.ndim())?;
        if psf.ndim() != image.ndim() {
            return Err(DeconvolutionError::mismatch(&[image.ndim()], &[psf.ndim()]));
        }
        if config.save_intermediate_results && writer.is_none() {
            return Err(DeconvolutionError::UnsupportedConfiguration(
                "save_intermediate_results requires an estimate writer".to_string(),
            ));
        }

        let geometry = plan(image.shape(), config.num_blocks)?;
        let kernels = prepare(psf, image.spacing())?;

        log::info!(
            "The original image size is {:?}, the working size is {:?}",
            image.shape(),
            geometry.padded_image_size
        );
        log::info!(
            "The deconvolution runs in {} block(s), internal block size {:?}",
            geometry.num_blocks(),
            geometry.padded_block_size(config.block_pad)
        );

        let updater = EstimateUpdater::new(
            geometry,
            config.block_pad,
            &kernels,
            config.tv_lambda,
            config.convergence_epsilon,
        )?;
        let buffers = Self::allocate(image, updater.geometry(), &config)?;

        Ok(RichardsonLucy {
            diagnostics: Diagnostics::with_capacity(config.max_iterations),
            image_size: image.shape().to_vec(),
            initial_photons: image.sum(),
            config,
            updater,
            buffers: Some(buffers),
            writer,
            state: RunState::Initializing,
            iteration_count: 0,
        })
    }

    fn allocate(image: &Volume, geometry: &BlockGeometry, config: &DeconvolutionConfig) -> Result<Buffers> {
        let shape = &geometry.padded_image_size;
        let spacing = image.spacing().to_vec();

        let mut padded_image = Volume::zeros(shape, spacing.clone())?;
        padded_image
            .view_mut()
            .slice_each_axis_mut(|axis| Slice::from(0..image.shape()[axis.axis.index()]))
            .assign(&image.view());

        let scratch_dir = if config.memmap_estimates {
            Some(tempfile::Builder::new().prefix("rl-fusion-").tempdir()?)
        } else {
            None
        };
        let buffer = |name: &str| -> Result<Volume> {
            match &scratch_dir {
                Some(dir) => Volume::mapped_zeros(&dir.path().join(name), shape, spacing.clone()),
                None => Volume::zeros(shape, spacing.clone()),
            }
        };

        let mut estimate = buffer("estimate.dat")?;
        let estimate_new = buffer("estimate_new.dat")?;
        let prev_estimate = if config.tau1_enabled() {
            Some(buffer("prev_estimate.dat")?)
        } else {
            None
        };

        match config.first_estimate {
            FirstEstimate::Image => estimate.assign_from(&padded_image)?,
            FirstEstimate::ImageMean => {
                let mean = if image.is_empty() {
                    0.0
                } else {
                    image.sum() / image.len() as f64
                };
                estimate.fill(mean as f32);
            }
            FirstEstimate::Constant => estimate.fill(config.estimate_constant),
        }
        log::debug!("first estimate: {}", config.first_estimate);

        Ok(Buffers {
            image: padded_image,
            estimate,
            estimate_new,
            prev_estimate,
            scratch_dir,
        })
    }

    /// Runs iterations until a stop condition holds or `abort_flag` is raised.
    ///
    /// The flag is polled between iterations. Returns the terminal state.
    ///
    /// # Errors
    /// - `Closed` after [`RichardsonLucy::close`].
    /// - `UnsupportedConfiguration` if the run has already been executed.
    /// - Any error of the update or the estimate writer. The run is left `Failed`, with the
    ///   diagnostics of every iteration that finished its update.
    pub fn execute(&mut self, abort_flag: &AtomicBool) -> Result<RunState> {
        match self.state {
            RunState::Initializing => {}
            RunState::Closed => return Err(DeconvolutionError::Closed),
            other => {
                return Err(DeconvolutionError::UnsupportedConfiguration(format!(
                    "cannot execute a run that is {other}"
                )))
            }
        }
        self.state = RunState::Iterating;

        let started = Instant::now();
        let exit = match loop_cancellable(abort_flag, |_| self.iterate()) {
            Ok(exit) => exit,
            Err(err) => {
                self.state = RunState::Failed;
                log::error!(
                    "Deconvolution failed after {} iteration(s): {err}",
                    self.iteration_count
                );
                return Err(err);
            }
        };
        self.state = match exit {
            LoopExit::Finished(state) => state,
            LoopExit::Cancelled { completed } => {
                log::warn!("Deconvolution interrupted after {completed} iteration(s)");
                RunState::UserInterrupted
            }
        };

        log::info!(
            "Deconvolution stopped ({}) after {} iteration(s) in {:.2} s",
            self.state,
            self.iteration_count,
            started.elapsed().as_secs_f64()
        );
        Ok(self.state)
    }

    /// One full iteration: update, bookkeeping, intermediate output and stop evaluation.
    fn iterate(&mut self) -> Result<ControlFlow<RunState>> {
        let buffers = self.buffers.as_mut().ok_or(DeconvolutionError::Closed)?;
        let started = Instant::now();

        if let Some(prev) = buffers.prev_estimate.as_mut() {
            prev.assign_from(&buffers.estimate)?;
        }
        let stats = self.updater.update(
            &mut buffers.estimate,
            &mut buffers.estimate_new,
            &buffers.image,
            self.iteration_count == 0,
        )?;
        self.iteration_count += 1;

        let photons = stats.total_photons();
        let leak = if self.initial_photons > 0.0 {
            1.0 - photons / self.initial_photons
        } else {
            0.0
        };
        let u_esu = if photons > 0.0 { stats.u / photons } else { 0.0 };
        let tau1 = match &buffers.prev_estimate {
            Some(prev) => relative_change(&buffers.estimate, prev),
            None => 0.0,
        };

        let record = IterationRecord {
            iteration: self.iteration_count,
            t: started.elapsed().as_secs_f64(),
            tau1,
            leak: 100.0 * leak,
            e: stats.e,
            s: stats.s,
            u: stats.u,
            n: stats.n,
            u_esu,
        };
        log::info!(
            "[{}/{}] E={:.3e} S={:.3e} U={:.3e} N={} LEAK={:.3}% U/ESU={:.4} TAU1={:.5} t={:.2}s",
            record.iteration,
            self.config.max_iterations,
            record.e,
            record.s,
            record.u,
            record.n,
            record.leak,
            record.u_esu,
            record.tau1,
            record.t
        );
        self.diagnostics.push(record);

        if self.config.save_intermediate_results {
            if let Some(writer) = self.writer.as_mut() {
                writer.write(&crop_to(&buffers.estimate, &self.image_size)?)?;
            }
        }

        if stats.is_settled() {
            log::info!("Optimal solution found");
            return Ok(ControlFlow::Break(RunState::Converged));
        }
        if self.iteration_count >= self.config.max_iterations {
            log::info!("The number of iterations reached the maximum");
            return Ok(ControlFlow::Break(RunState::MaxIterationsReached));
        }
        if self.config.tau1_enabled() && tau1 <= self.config.stop_tau as f64 {
            log::info!("tau1 {tau1:.5} fell below the stop threshold {}", self.config.stop_tau);
            return Ok(ControlFlow::Break(RunState::Converged));
        }
        Ok(ControlFlow::Continue(()))
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    pub fn config(&self) -> &DeconvolutionConfig {
        &self.config
    }

    pub fn geometry(&self) -> &BlockGeometry {
        self.updater.geometry()
    }

    /// Directory holding the memory-mapped estimate files, if any.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.buffers
            .as_ref()
            .and_then(|buffers| buffers.scratch_dir.as_ref())
            .map(|dir| dir.path())
    }

    /// The current estimate cropped to the original image size.
    pub fn result(&self) -> Result<Volume> {
        let buffers = self.buffers.as_ref().ok_or(DeconvolutionError::Closed)?;
        crop_to(&buffers.estimate, &self.image_size)
    }

    pub fn diagnostics(&self) -> Result<&Diagnostics> {
        if self.state == RunState::Closed {
            return Err(DeconvolutionError::Closed);
        }
        Ok(&self.diagnostics)
    }

    /// 8-bit rendering of [`RichardsonLucy::result`], see [`crate::preview::to_8bit`].
    pub fn preview_8bit(&self, denoise: bool) -> Result<ArrayD<u8>> {
        let result = self.result()?;
        Ok(to_8bit(&result.view(), denoise))
    }

    /// Releases the buffers (removing memory-mapped files) and the diagnostics.
    pub fn close(&mut self) {
        self.buffers = None;
        self.diagnostics = Diagnostics::default();
        self.writer = None;
        self.state = RunState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::gaussian_kernel;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, IxDyn};
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    fn gaussian_psf() -> Volume {
        Volume::new(gaussian_kernel(&[8, 8], 1.5), vec![1.0, 1.0]).unwrap()
    }

    fn impulse_psf() -> Volume {
        let mut kernel = ArrayD::<f32>::zeros(IxDyn(&[3, 3]));
        kernel[[1, 1]] = 1.0;
        Volume::new(kernel, vec![1.0, 1.0]).unwrap()
    }

    fn blob(shape: (usize, usize)) -> Volume {
        let image = Array2::from_shape_fn(shape, |(y, x)| {
            let d2 = (y as f32 - 10.0).powi(2) + (x as f32 - 12.0).powi(2);
            1.0 + 80.0 * (-d2 / 10.0).exp()
        });
        Volume::new(image.into_dyn(), vec![1.0, 1.0]).unwrap()
    }

    /// Keeps every estimate it receives and raises `abort` after `stop_after` writes.
    struct RecordingWriter {
        written: Arc<Mutex<Vec<ArrayD<f32>>>>,
        abort: Arc<AtomicBool>,
        stop_after: usize,
    }

    impl EstimateWriter for RecordingWriter {
        fn write(&mut self, estimate: &Volume) -> Result<()> {
            let mut written = self.written.lock().unwrap();
            written.push(estimate.view().to_owned());
            if written.len() == self.stop_after {
                self.abort.store(true, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    /// Fails on every write.
    struct FailingWriter;

    impl EstimateWriter for FailingWriter {
        fn write(&mut self, _estimate: &Volume) -> Result<()> {
            Err(DeconvolutionError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_constant_image_runs_to_max_iterations() {
        let image = Volume::new(ArrayD::from_elem(IxDyn(&[64, 64]), 10.0), vec![1.0, 1.0]).unwrap();
        let config = DeconvolutionConfig {
            max_iterations: 5,
            ..Default::default()
        };
        let mut run = RichardsonLucy::new(&image, &gaussian_psf(), config, None).unwrap();
        assert_eq!(run.state(), RunState::Initializing);

        let state = run.execute(&AtomicBool::new(false)).unwrap();
        assert_eq!(state, RunState::MaxIterationsReached);
        assert_eq!(run.iteration_count(), 5);

        let diagnostics = run.diagnostics().unwrap();
        assert_eq!(diagnostics.len(), 5);
        for (i, record) in diagnostics.records().iter().enumerate() {
            assert_eq!(record.iteration, i + 1);
            assert!(record.leak > -1e-3, "leak {} at iteration {}", record.leak, i + 1);
            assert!(record.tau1.is_finite() && record.tau1 >= 0.0);
        }

        let result = run.result().unwrap();
        assert_eq!(result.shape(), &[64, 64]);
        assert!(result.as_slice().iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn test_fixed_point_converges_in_one_iteration() {
        let image = blob((20, 24));
        let mut run = RichardsonLucy::new(&image, &impulse_psf(), DeconvolutionConfig::default(), None)
            .unwrap();
        let state = run.execute(&AtomicBool::new(false)).unwrap();
        assert_eq!(state, RunState::Converged);
        assert_eq!(run.diagnostics().unwrap().len(), 1);

        let result = run.result().unwrap();
        for (a, b) in result.as_slice().iter().zip(image.as_slice()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_interruption_keeps_completed_iterations() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let abort = Arc::new(AtomicBool::new(false));
        let writer = RecordingWriter {
            written: written.clone(),
            abort: abort.clone(),
            stop_after: 2,
        };
        let config = DeconvolutionConfig {
            max_iterations: 10,
            convergence_epsilon: 1e-4,
            disable_tau1: true,
            save_intermediate_results: true,
            ..Default::default()
        };
        let mut run =
            RichardsonLucy::new(&blob((24, 24)), &gaussian_psf(), config, Some(Box::new(writer)))
                .unwrap();

        let state = run.execute(&abort).unwrap();
        assert_eq!(state, RunState::UserInterrupted);
        assert_eq!(run.iteration_count(), 2);
        assert_eq!(run.diagnostics().unwrap().len(), 2);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(run.result().unwrap().view(), written[1].view());
    }

    #[test]
    fn test_block_padding_crops_result_to_image() {
        let image = blob((21, 23));
        let config = DeconvolutionConfig {
            max_iterations: 2,
            num_blocks: 8,
            block_pad: 4,
            ..Default::default()
        };
        let mut run = RichardsonLucy::new(&image, &gaussian_psf(), config, None).unwrap();
        assert_eq!(run.geometry().padded_image_size, vec![24, 24]);
        run.execute(&AtomicBool::new(false)).unwrap();
        let result = run.result().unwrap();
        assert_eq!(result.shape(), &[21, 23]);
        assert_eq!(result.spacing(), &[1.0, 1.0]);
    }

    #[test]
    fn test_memory_mapped_run_matches_resident_run() {
        let image = blob((20, 20));
        let config = DeconvolutionConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let mapped_config = DeconvolutionConfig {
            memmap_estimates: true,
            ..config.clone()
        };

        let mut resident = RichardsonLucy::new(&image, &gaussian_psf(), config, None).unwrap();
        let mut mapped = RichardsonLucy::new(&image, &gaussian_psf(), mapped_config, None).unwrap();
        assert!(resident.scratch_dir().is_none());
        let dir = mapped.scratch_dir().unwrap().to_path_buf();
        assert!(dir.join("estimate.dat").exists());
        assert!(dir.join("prev_estimate.dat").exists());

        resident.execute(&AtomicBool::new(false)).unwrap();
        mapped.execute(&AtomicBool::new(false)).unwrap();
        assert_eq!(resident.result().unwrap().view(), mapped.result().unwrap().view());

        mapped.close();
        assert!(!dir.exists());
    }

    #[test]
    fn test_first_estimate_strategies() {
        let image = Volume::new(
            Array2::from_shape_fn((4, 4), |(y, _)| y as f32).into_dyn(),
            vec![1.0, 1.0],
        )
        .unwrap();

        let config = DeconvolutionConfig {
            first_estimate: FirstEstimate::ImageMean,
            ..Default::default()
        };
        let run = RichardsonLucy::new(&image, &impulse_psf(), config, None).unwrap();
        assert!(run.result().unwrap().as_slice().iter().all(|&v| v == 1.5));

        let config = DeconvolutionConfig {
            first_estimate: FirstEstimate::Constant,
            estimate_constant: 0.25,
            ..Default::default()
        };
        let run = RichardsonLucy::new(&image, &impulse_psf(), config, None).unwrap();
        assert!(run.result().unwrap().as_slice().iter().all(|&v| v == 0.25));

        let run = RichardsonLucy::new(&image, &impulse_psf(), DeconvolutionConfig::default(), None)
            .unwrap();
        assert_eq!(run.result().unwrap().as_slice(), image.as_slice());
    }

    #[test]
    fn test_closed_run_rejects_operations() {
        let mut run =
            RichardsonLucy::new(&blob((16, 16)), &impulse_psf(), DeconvolutionConfig::default(), None)
                .unwrap();
        run.close();
        assert_eq!(run.state(), RunState::Closed);
        assert!(matches!(run.result(), Err(DeconvolutionError::Closed)));
        assert!(matches!(run.diagnostics(), Err(DeconvolutionError::Closed)));
        assert!(matches!(run.preview_8bit(true), Err(DeconvolutionError::Closed)));
        assert!(matches!(
            run.execute(&AtomicBool::new(false)),
            Err(DeconvolutionError::Closed)
        ));
    }

    #[test]
    fn test_finished_run_cannot_execute_again() {
        let mut run =
            RichardsonLucy::new(&blob((16, 16)), &impulse_psf(), DeconvolutionConfig::default(), None)
                .unwrap();
        run.execute(&AtomicBool::new(false)).unwrap();
        assert!(run.state().is_terminal());
        assert!(run.execute(&AtomicBool::new(false)).is_err());
        // the result stays available in a terminal state
        assert_eq!(run.preview_8bit(false).unwrap().shape(), &[16, 16]);
    }

    #[test]
    fn test_construction_errors() {
        let image = blob((16, 16));
        let config = DeconvolutionConfig {
            save_intermediate_results: true,
            ..Default::default()
        };
        assert!(matches!(
            RichardsonLucy::new(&image, &impulse_psf(), config, None),
            Err(DeconvolutionError::UnsupportedConfiguration(_))
        ));

        let psf_3d = Volume::new(gaussian_kernel(&[3, 3, 3], 1.0), vec![1.0; 3]).unwrap();
        assert!(matches!(
            RichardsonLucy::new(&image, &psf_3d, DeconvolutionConfig::default(), None),
            Err(DeconvolutionError::DimensionMismatch { .. })
        ));

        let line = Volume::new(ArrayD::from_elem(IxDyn(&[16]), 1.0), vec![1.0]).unwrap();
        assert!(matches!(
            RichardsonLucy::new(&line, &line, DeconvolutionConfig::default(), None),
            Err(DeconvolutionError::UnsupportedRank(1))
        ));
    }

    #[test]
    fn test_pre_aborted_run_is_interrupted_without_records() {
        let mut run =
            RichardsonLucy::new(&blob((16, 16)), &gaussian_psf(), DeconvolutionConfig::default(), None)
                .unwrap();
        let state = run.execute(&AtomicBool::new(true)).unwrap();
        assert_eq!(state, RunState::UserInterrupted);
        assert!(run.diagnostics().unwrap().is_empty());
    }

    #[test]
    fn test_writer_error_fails_the_run_and_keeps_diagnostics() {
        let config = DeconvolutionConfig {
            max_iterations: 10,
            save_intermediate_results: true,
            ..Default::default()
        };
        let mut run = RichardsonLucy::new(
            &blob((24, 24)),
            &gaussian_psf(),
            config,
            Some(Box::new(FailingWriter)),
        )
        .unwrap();

        assert!(matches!(
            run.execute(&AtomicBool::new(false)),
            Err(DeconvolutionError::Io(_))
        ));
        assert_eq!(run.state(), RunState::Failed);
        assert!(run.state().is_terminal());
        assert_eq!(run.iteration_count(), 1);
        assert_eq!(run.diagnostics().unwrap().len(), 1);
        assert_eq!(run.result().unwrap().shape(), &[24, 24]);

        assert!(matches!(
            run.execute(&AtomicBool::new(false)),
            Err(DeconvolutionError::UnsupportedConfiguration(_))
        ));
        run.close();
        assert_eq!(run.state(), RunState::Closed);
    }
}
