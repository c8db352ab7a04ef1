mod cli;
mod commands;
mod error;
mod logging;

use clap::Parser;
use std::process::ExitCode;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_format)?;

    let output = commands::run(&cli).await?;
    commands::render(&output.data, cli.pretty)?;

    // Some subjects failed; their cached values were kept.
    if output.failures > 0 {
        return Ok(ExitCode::from(3));
    }

    Ok(ExitCode::SUCCESS)
}
