use ferrowatch_core::SyncConfig;
use serde_json::json;

use crate::cli::JobsCommand;
use crate::error::CliError;

use super::{open_warehouse, register_jobs, CommandOutput};

pub fn run(command: &JobsCommand, config: &SyncConfig) -> Result<CommandOutput, CliError> {
    let warehouse = open_warehouse(config)?;
    register_jobs(&warehouse, config)?;

    match command {
        JobsCommand::List => Ok(CommandOutput::ok(json!({ "jobs": warehouse.jobs()? }))),
        JobsCommand::Enable(args) => toggle(&warehouse, config, &args.name, true),
        JobsCommand::Disable(args) => toggle(&warehouse, config, &args.name, false),
    }
}

fn toggle(
    warehouse: &ferrowatch_warehouse::Warehouse,
    config: &SyncConfig,
    name: &str,
    enabled: bool,
) -> Result<CommandOutput, CliError> {
    if !config.schedules().iter().any(|schedule| schedule.name == name) {
        return Err(CliError::Command(format!("unknown job '{name}'")));
    }

    let changed = warehouse.set_job_enabled(name, enabled)?;
    Ok(CommandOutput::ok(json!({
        "job": name,
        "enabled": enabled,
        "changed": changed,
    })))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::cli::JobNameArgs;

    fn config_in(dir: &std::path::Path) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.warehouse.path = Some(dir.join("ferrowatch.duckdb"));
        config
    }

    fn named(name: &str) -> JobNameArgs {
        JobNameArgs {
            name: name.to_owned(),
        }
    }

    #[test]
    fn disabling_a_job_shows_in_listing() {
        let temp = tempdir().expect("tempdir");
        let config = config_in(temp.path());

        let disabled = run(&JobsCommand::Disable(named("market_watch")), &config).expect("ok");
        assert_eq!(disabled.data["changed"], true);

        let listed = run(&JobsCommand::List, &config).expect("ok");
        let jobs = listed.data["jobs"].as_array().expect("array");
        assert_eq!(jobs.len(), 3);
        let market = jobs
            .iter()
            .find(|job| job["name"] == "market_watch")
            .expect("registered");
        assert_eq!(market["enabled"], false);
        assert_eq!(market["interval_ms"], 30_000);
    }

    #[test]
    fn unknown_job_is_a_command_error() {
        let temp = tempdir().expect("tempdir");

        let error = run(&JobsCommand::Enable(named("nope")), &config_in(temp.path()))
            .err()
            .expect("must fail");
        assert!(matches!(error, CliError::Command(_)));
        assert_eq!(error.exit_code(), 2);
    }
}
