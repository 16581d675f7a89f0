//! Headless runner: `rl-fusion <job.json> <image.npy> <psf.npy> <output_dir>`.
//!
//! The job file holds the voxel spacings of both volumes and the run configuration:
//!
//! ```json
//! {
//!   "image_spacing": [0.2, 0.05, 0.05],
//!   "psf_spacing": [0.1, 0.025, 0.025],
//!   "deconvolution": { "max_iterations": 50, "num_blocks": 8, "block_pad": 16 }
//! }
//! ```
//!
//! Writes `result.npy`, `diagnostics.csv` and `preview.png` to the output directory, plus
//! `result_8bit.npy` with `output_cast` and `intermediate/estimate_NNNN.npy` with
//! `save_intermediate_results`. Ctrl-C stops the run after the current iteration, and the
//! outputs of the iterations completed so far are still written.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flexi_logger::Logger;
use rl_fusion::deconvolution::EstimateWriter;
use rl_fusion::io::{
    load_npy_volume, save_diagnostics_csv, save_npy_u8, save_npy_volume, save_preview_png,
    NpyWriter,
};
use rl_fusion::{DeconvolutionConfig, DeconvolutionError, Result, RichardsonLucy, RunState};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Job {
    image_spacing: Vec<f32>,
    psf_spacing: Vec<f32>,
    #[serde(default)]
    deconvolution: DeconvolutionConfig,
}

struct Paths {
    job: PathBuf,
    image: PathBuf,
    psf: PathBuf,
    output: PathBuf,
}

fn parse_args() -> Option<Paths> {
    let mut args = std::env::args_os().skip(1);
    let paths = Paths {
        job: args.next()?.into(),
        image: args.next()?.into(),
        psf: args.next()?.into(),
        output: args.next()?.into(),
    };
    args.next().is_none().then_some(paths)
}

/// Reads a job file. Well-formed JSON with bad contents is a configuration error.
fn parse_job<R: Read>(reader: R) -> Result<Job> {
    serde_json::from_reader(reader).map_err(|err| match err.classify() {
        serde_json::error::Category::Data => {
            DeconvolutionError::UnsupportedConfiguration(err.to_string())
        }
        _ => err.into(),
    })
}

fn run(paths: &Paths, abort_flag: &AtomicBool) -> Result<RunState> {
    let job = parse_job(std::fs::File::open(&paths.job)?)?;
    let config = job.deconvolution;
    log::debug!("{config:?}");

    let image = load_npy_volume(&paths.image, job.image_spacing)?;
    let psf = load_npy_volume(&paths.psf, job.psf_spacing)?;
    std::fs::create_dir_all(&paths.output)?;

    let writer: Option<Box<dyn EstimateWriter>> = if config.save_intermediate_results {
        Some(Box::new(NpyWriter::new(&paths.output.join("intermediate"))?))
    } else {
        None
    };
    let output_cast = config.output_cast;

    let mut deconvolution = RichardsonLucy::new(&image, &psf, config, writer)?;
    let state = deconvolution.execute(abort_flag)?;

    let output: &Path = &paths.output;
    save_npy_volume(&output.join("result.npy"), &deconvolution.result()?)?;
    save_diagnostics_csv(&output.join("diagnostics.csv"), deconvolution.diagnostics()?)?;

    let preview = deconvolution.preview_8bit(true)?;
    save_preview_png(&output.join("preview.png"), &preview.view())?;
    if output_cast {
        save_npy_u8(
            &output.join("result_8bit.npy"),
            &deconvolution.preview_8bit(false)?,
        )?;
    }

    log::info!(
        "{state} after {} iteration(s), results written to {output:?}",
        deconvolution.iteration_count()
    );
    deconvolution.close();
    Ok(state)
}

fn main() -> ExitCode {
    // the handle has to outlive the run, dropping it stops the logger
    let _logger = match Logger::try_with_env_or_str("info").and_then(|logger| logger.start()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("logger initialization failed: {err}");
            None
        }
    };
    log::info!(
        "rl-fusion {} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_BRANCH"),
        env!("GIT_HASH")
    );

    let Some(paths) = parse_args() else {
        eprintln!("usage: rl-fusion <job.json> <image.npy> <psf.npy> <output_dir>");
        return ExitCode::from(2);
    };

    let abort_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = abort_flag.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        log::warn!("Interrupt received, stopping after the current iteration");
        handler_flag.store(true, Ordering::Relaxed);
    }) {
        log::warn!("cannot install the Ctrl-C handler: {err}");
    }

    match run(&paths, &abort_flag) {
        Ok(_) => ExitCode::SUCCESS,
        Err(DeconvolutionError::UnsupportedConfiguration(msg)) => {
            log::error!("invalid configuration: {msg}");
            ExitCode::from(2)
        }
        Err(err) => {
            log::error!("deconvolution failed: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, ArrayD, IxDyn};
    use ndarray_npy::read_npy;

    fn write_inputs(dir: &Path, job: &str) -> Paths {
        let image = Array2::from_shape_fn((12, 12), |(y, x)| 1.0 + (y * 12 + x) as f32);
        let mut psf = Array2::<f32>::zeros((3, 3));
        psf[[1, 1]] = 1.0;
        ndarray_npy::write_npy(dir.join("image.npy"), &image).unwrap();
        ndarray_npy::write_npy(dir.join("psf.npy"), &psf).unwrap();
        std::fs::write(dir.join("job.json"), job).unwrap();
        Paths {
            job: dir.join("job.json"),
            image: dir.join("image.npy"),
            psf: dir.join("psf.npy"),
            output: dir.join("out"),
        }
    }

    #[test]
    fn test_unknown_first_estimate_is_a_configuration_error() {
        let job = br#"{"image_spacing": [1, 1], "psf_spacing": [1, 1],
            "deconvolution": {"first_estimate": "zeros"}}"#;
        match parse_job(&job[..]) {
            Err(DeconvolutionError::UnsupportedConfiguration(msg)) => {
                assert!(msg.contains("zeros"), "{msg}")
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_job_is_a_json_error() {
        assert!(matches!(
            parse_job(&b"{\"image_spacing\": [1, 1"[..]),
            Err(DeconvolutionError::Json(_))
        ));
    }

    #[test]
    fn test_interrupted_run_still_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_inputs(
            dir.path(),
            r#"{"image_spacing": [1, 1], "psf_spacing": [1, 1],
                "deconvolution": {"max_iterations": 5}}"#,
        );

        let state = run(&paths, &AtomicBool::new(true)).unwrap();
        assert_eq!(state, RunState::UserInterrupted);

        let result: ArrayD<f32> = read_npy(paths.output.join("result.npy")).unwrap();
        assert_eq!(result.raw_dim(), IxDyn(&[12, 12]));
        assert!(paths.output.join("diagnostics.csv").exists());
        assert!(paths.output.join("preview.png").exists());
    }
}
