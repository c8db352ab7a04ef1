use ferrowatch_core::SyncConfig;
use serde_json::json;

use crate::cli::ConfigCommand;
use crate::error::CliError;

use super::CommandOutput;

const REDACTED: &str = "<redacted>";

pub fn run(command: &ConfigCommand, config: &SyncConfig) -> Result<CommandOutput, CliError> {
    match command {
        ConfigCommand::Show => Ok(CommandOutput::ok(serde_json::to_value(redacted(config))?)),
        ConfigCommand::Check => {
            // Loading already validated; report what would be scheduled.
            let jobs = config.schedules().to_vec();
            Ok(CommandOutput::ok(json!({
                "valid": true,
                "warehouse": config.warehouse_config().db_path,
                "jobs": jobs,
            })))
        }
    }
}

fn redacted(config: &SyncConfig) -> SyncConfig {
    let mut config = config.clone();
    let jobs = &mut config.jobs;

    for user in &mut jobs.user_status.users {
        user.api_key = REDACTED.to_owned();
    }
    for faction in &mut jobs.faction_chain.factions {
        for key in &mut faction.member_keys {
            *key = REDACTED.to_owned();
        }
    }
    for key in &mut jobs.market_watch.pool_keys {
        *key = REDACTED.to_owned();
    }
    config
}

#[cfg(test)]
mod tests {
    use ferrowatch_core::jobs::{FactionWatch, UserWatch};

    use super::*;

    #[test]
    fn show_never_prints_api_keys() {
        let mut config = SyncConfig::default();
        config.jobs.user_status.users.push(UserWatch {
            user_id: 42,
            api_key: String::from("user-secret"),
        });
        config.jobs.faction_chain.factions.push(FactionWatch {
            faction_id: 9,
            member_keys: vec![String::from("member-secret")],
            deliver_to: None,
            warn_below_secs: 90,
            min_chain: 10,
        });
        config.jobs.market_watch.pool_keys.push(String::from("pool-secret"));

        let output = run(&ConfigCommand::Show, &config).expect("renders");
        let rendered = output.data.to_string();

        assert!(!rendered.contains("secret"));
        assert_eq!(output.data["jobs"]["user_status"]["users"][0]["user_id"], 42);
    }

    #[test]
    fn check_lists_schedules() {
        let output = run(&ConfigCommand::Check, &SyncConfig::default()).expect("renders");

        assert_eq!(output.data["valid"], true);
        assert_eq!(output.data["jobs"][1]["name"], "faction_chain");
        assert_eq!(output.failures, 0);
    }
}
