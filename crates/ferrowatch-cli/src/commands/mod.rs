mod config;
mod fields;
mod jobs;
mod run;

use std::io::Write;

use ferrowatch_core::SyncConfig;
use ferrowatch_warehouse::Warehouse;
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandOutput {
    pub data: Value,
    /// Subjects that failed during polling.
    pub failures: usize,
}

impl CommandOutput {
    pub fn ok(data: Value) -> Self {
        Self { data, failures: 0 }
    }

    pub fn with_failures(mut self, failures: usize) -> Self {
        self.failures = failures;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutput, CliError> {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Run(args) => run::run(args, &config).await,
        Command::Jobs(args) => jobs::run(&args.command, &config),
        Command::Fields(args) => fields::run(args, &config),
        Command::Config(args) => config::run(&args.command, &config),
    }
}

/// File and environment configuration with `--db` applied on top.
pub fn load_config(cli: &Cli) -> Result<SyncConfig, CliError> {
    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.warehouse.path = Some(db.clone());
    }
    Ok(config)
}

fn open_warehouse(config: &SyncConfig) -> Result<Warehouse, CliError> {
    Ok(Warehouse::open(config.warehouse_config())?)
}

/// Register every configured job so listing and toggling see it.
fn register_jobs(warehouse: &Warehouse, config: &SyncConfig) -> Result<(), CliError> {
    for schedule in config.schedules() {
        let interval_ms = u64::try_from(schedule.interval.as_millis()).unwrap_or(u64::MAX);
        warehouse.ensure_job(schedule.name, interval_ms)?;
    }
    Ok(())
}

pub fn render(data: &Value, pretty: bool) -> Result<(), CliError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(data)?
    } else {
        serde_json::to_string(data)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    Ok(())
}
