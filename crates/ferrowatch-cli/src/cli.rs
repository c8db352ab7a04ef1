//! CLI argument definitions for ferrowatch.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Poll configured jobs until interrupted |
//! | `jobs` | List, enable or disable jobs |
//! | `fields` | Inspect stored field snapshots |
//! | `config` | Show or check the effective configuration |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | JSON configuration file |
//! | `--db` | `$FERROWATCH_HOME/warehouse.duckdb` | Warehouse database file |
//! | `--log-format` | `pretty` | Log output format (pretty, json, compact) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! # Poll every enabled job
//! ferrowatch run --config ferrowatch.json
//!
//! # One cycle of each job, alerts logged instead of sent
//! ferrowatch run --once --dry-run
//!
//! # Pause the market watcher
//! ferrowatch jobs disable market_watch
//!
//! # Last ten chain readings of a faction
//! ferrowatch fields faction:9 --history chain --limit 10 --pretty
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::LogFormat;

/// Rate-limited poller and alerting for a partner game API.
#[derive(Debug, Parser)]
#[command(name = "ferrowatch", author, version, about)]
pub struct Cli {
    /// JSON configuration file. Every section is optional.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Warehouse database file. Overrides the configuration.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log output format. Logs go to stderr; filter with RUST_LOG.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll enabled jobs on their intervals until Ctrl-C.
    ///
    /// # Examples
    ///
    ///   ferrowatch run
    ///   ferrowatch run --once --dry-run
    Run(RunArgs),

    /// Inspect and toggle job descriptors.
    Jobs(JobsArgs),

    /// Show stored field snapshots of a subject.
    ///
    /// # Examples
    ///
    ///   ferrowatch fields user:42
    ///   ferrowatch fields item:206 --history market_price --limit 5
    Fields(FieldsArgs),

    /// Show or validate the effective configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Log alerts instead of delivering them.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Run a single cycle of every enabled job and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommand,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List job descriptors with their last run.
    List,

    /// Let the job run again on its next tick.
    Enable(JobNameArgs),

    /// Skip the job's cycles until enabled again.
    Disable(JobNameArgs),
}

#[derive(Debug, Args)]
pub struct JobNameArgs {
    /// Job name (user_status, faction_chain, market_watch).
    pub name: String,
}

#[derive(Debug, Args)]
pub struct FieldsArgs {
    /// Subject key, e.g. user:42, faction:9 or item:206.
    pub subject: String,

    /// Show snapshots of this field over time instead of the latest values.
    #[arg(long)]
    pub history: Option<String>,

    /// Maximum number of history entries.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration with keys redacted.
    Show,

    /// Validate the configuration and list job schedules.
    Check,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_apply_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ferrowatch",
            "fields",
            "faction:9",
            "--history",
            "chain",
            "--db",
            "/tmp/fw.duckdb",
            "--log-format",
            "json",
        ])
        .expect("parses");

        assert_eq!(cli.db, Some(PathBuf::from("/tmp/fw.duckdb")));
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Fields(args) => {
                assert_eq!(args.subject, "faction:9");
                assert_eq!(args.history.as_deref(), Some("chain"));
                assert_eq!(args.limit, 20);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_flags_default_to_off() {
        let cli = Cli::try_parse_from(["ferrowatch", "run"]).expect("parses");
        match cli.command {
            Command::Run(args) => assert!(!args.dry_run && !args.once),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
