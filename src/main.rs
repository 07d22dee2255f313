use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use timewarp::cli::Cli;
use timewarp::error::{TimewarpError, EXIT_FAILURE};
use timewarp::{host, shim, Options, VirtualClockScheduler};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber; `-v` flags raise the default level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let options = Options::from(cli);
    let commands = cli
        .commands()
        .map_err(TimewarpError::Config)
        .context("invalid command line")?;

    host::pin_cpu().context("failed to pin CPU")?;

    if options.preload {
        let dir = shim::locate_libpath(&options)?;
        shim::extend_ld_preload(&dir);
    }

    info!(programs = commands.len(), "--- timewarp ---");
    let scheduler = VirtualClockScheduler::new(&options, commands).context("failed to set up tracing")?;
    Ok(scheduler.run()?)
}

/// Exit code for a failed run, taken from the innermost timewarp error
fn failure_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TimewarpError>())
        .map_or(EXIT_FAILURE, TimewarpError::exit_code) as u8
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_FAILURE } else { 0 };
            let _ = err.print();
            return ExitCode::from(code as u8);
        }
    };

    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(status) => ExitCode::from(status.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("timewarp: {:#}", err);
            ExitCode::from(failure_code(&err))
        }
    }
}
