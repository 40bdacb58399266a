mod commands;
mod synthetic;

use clap::Parser;
use rampcal_core::CalibError;
use tracing_subscriber::EnvFilter;

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let calib_error = error.as_calib_error();
            eprintln!("{}", calib_error.diagnostic_line());
            if let Some(summary_line) = calib_error.fatal_exit_line() {
                eprintln!("{}", summary_line);
            }
            calib_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("rampcal".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => {
            init_tracing(cli.log_level.as_deref())?;
            dispatch_parsed(cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

/// Logs go to stderr so stdout stays machine-readable. `--log-level` wins over
/// `RUST_LOG`; without either the level is `info`.
fn init_tracing(log_level: Option<&str>) -> Result<(), CliError> {
    let filter = match log_level {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|error| CliError::Usage(format!("invalid --log-level '{directive}': {error}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // A subscriber installed by an embedding process is kept.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

#[derive(Parser)]
#[command(name = "rampcal", version, about = "Dark-ramp calibration of multi-frame detectors")]
struct Cli {
    /// Tracing filter directive, e.g. "warn" or "rampcal_core=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Calibrate a synthetic ramp ensemble and print the JSON report
    Simulate(commands::SimulateArgs),
    /// Print the effective pipeline configuration
    ShowConfig(commands::ShowConfigArgs),
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Simulate(args) => commands::run_simulate_command(args),
        CliCommand::ShowConfig(args) => commands::run_show_config_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(CalibError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_calib_error(&self) -> CalibError {
        match self {
            Self::Usage(message) => {
                CalibError::invalid_configuration("CONFIG.CLI_USAGE", message.clone())
            }
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => CalibError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}
