use std::sync::Arc;

use ferrowatch_core::runtime::{
    build_context, build_scheduler, partner_api, webhook_sink, Collaborators,
};
use ferrowatch_core::{
    AlertSink, FieldStore, HttpClient, JobRegistry, LogSink, ReqwestHttpClient, SyncConfig,
    SystemClock,
};
use serde_json::json;
use tracing::info;

use crate::cli::RunArgs;
use crate::error::CliError;

use super::{open_warehouse, register_jobs, CommandOutput};

pub async fn run(args: &RunArgs, config: &SyncConfig) -> Result<CommandOutput, CliError> {
    let warehouse = open_warehouse(config)?;
    register_jobs(&warehouse, config)?;

    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
    let sink: Arc<dyn AlertSink> = if args.dry_run {
        Arc::new(LogSink)
    } else {
        Arc::new(webhook_sink(config, Arc::clone(&http)))
    };
    let store: Arc<dyn FieldStore> = Arc::new(warehouse.clone());
    let registry: Arc<dyn JobRegistry> = Arc::new(warehouse);

    let ctx = build_context(
        config,
        Collaborators {
            api: Arc::new(partner_api(config, http)),
            store,
            sink,
            registry,
            clock: Arc::new(SystemClock),
        },
    )?;
    let scheduler = build_scheduler(config, &ctx);
    if scheduler.is_empty() {
        return Err(CliError::Command(String::from(
            "no jobs enabled in configuration",
        )));
    }

    if args.once {
        let reports = scheduler.run_once().await;
        let failures = reports.iter().map(|report| report.failed).sum();
        return Ok(CommandOutput::ok(json!({ "cycles": reports })).with_failures(failures));
    }

    let jobs: Vec<String> = scheduler
        .job_names()
        .into_iter()
        .map(str::to_owned)
        .collect();
    let handle = scheduler.start();
    info!(?jobs, dry_run = args.dry_run, "ferrowatch running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down, waiting for running cycles");
    handle.shutdown().await;

    Ok(CommandOutput::ok(json!({ "stopped": true, "jobs": jobs })))
}
