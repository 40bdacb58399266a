use super::CliError;
use super::synthetic::{SyntheticDetector, SyntheticRampSource};
use anyhow::Context;
use rampcal_core::CalibError;
use rampcal_core::common::PipelineConfig;
use rampcal_core::detector::ChannelOffsetCorrector;
use rampcal_core::pipelines::{CalibrationReport, CalibrationSession};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(clap::Args)]
pub(super) struct SimulateArgs {
    /// Pipeline configuration JSON; an optional "synthetic" object tunes the injected detector
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed of the synthetic ensemble
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Number of ramps in the ensemble
    #[arg(long, default_value_t = 8)]
    ramps: usize,

    /// Frames per ramp; defaults to the configured group count
    #[arg(long)]
    frames: Option<usize>,

    /// JSON report output path; stdout when absent
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct ShowConfigArgs {
    /// Pipeline configuration JSON; defaults when absent
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Pipeline configuration plus the synthetic detector description.
#[derive(Debug, Default, Deserialize)]
struct SimulationFile {
    #[serde(flatten)]
    pipeline: PipelineConfig,
    #[serde(default)]
    synthetic: SyntheticDetector,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    seed: u64,
    ramps: usize,
    frames: usize,
    hot_pixels: usize,
    injected: SyntheticDetector,
    calibration: CalibrationReport,
}

pub(super) fn run_simulate_command(args: SimulateArgs) -> Result<i32, CliError> {
    if args.ramps < 2 {
        return Err(CliError::Usage(format!(
            "--ramps must be at least 2, got {}",
            args.ramps
        )));
    }
    let file = match &args.config {
        Some(path) => parse_simulation_file(&read_text(path)?)?,
        None => SimulationFile::default(),
    };
    let config = file.pipeline;
    let frames = args.frames.unwrap_or(config.timing.group_count);

    let source = SyntheticRampSource::new(
        &config.geometry,
        &config.timing,
        file.synthetic.clone(),
        args.ramps,
        frames,
        args.seed,
    )
    .map_err(CliError::Compute)?;
    let corrector = ChannelOffsetCorrector::new(config.geometry);
    tracing::info!(
        ramps = args.ramps,
        frames,
        seed = args.seed,
        "synthetic ensemble ready"
    );

    let hot_pixels = source.hot_pixel_count();
    let session = CalibrationSession::new(config).map_err(CliError::Compute)?;
    let calibration = session
        .run_all(&source, &corrector)
        .map_err(CliError::Compute)?;

    let report = SimulationReport {
        seed: args.seed,
        ramps: args.ramps,
        frames,
        hot_pixels,
        injected: file.synthetic,
        calibration,
    };
    let rendered = serde_json::to_string_pretty(&report).context("failed to render report")?;
    write_or_print(args.output.as_deref(), &rendered)?;
    Ok(0)
}

pub(super) fn run_show_config_command(args: ShowConfigArgs) -> Result<i32, CliError> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_str(&read_text(path)?).map_err(CliError::Compute)?,
        None => PipelineConfig::default(),
    };
    let rendered = config.to_json_pretty().map_err(CliError::Compute)?;
    println!("{rendered}");
    Ok(0)
}

fn read_text(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration '{}'", path.display()))
        .map_err(CliError::from)
}

fn parse_simulation_file(text: &str) -> Result<SimulationFile, CliError> {
    let file: SimulationFile = serde_json::from_str(text).map_err(|error| {
        CliError::Compute(CalibError::invalid_configuration(
            "CONFIG.PARSE",
            format!("simulation configuration is not valid JSON: {error}"),
        ))
    })?;
    file.pipeline.validate().map_err(CliError::Compute)?;
    Ok(file)
}

fn write_or_print(output: Option<&Path>, rendered: &str) -> Result<(), CliError> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create report directory '{}'", parent.display())
                })?;
            }
            fs::write(path, format!("{rendered}\n"))
                .with_context(|| format!("failed to write report '{}'", path.display()))?;
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
