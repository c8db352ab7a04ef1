use ferrowatch_core::{FieldKind, SubjectKey, SyncConfig};
use ferrowatch_warehouse::FieldRecord;
use serde_json::{json, Value};

use crate::cli::FieldsArgs;
use crate::error::CliError;

use super::{open_warehouse, CommandOutput};

pub fn run(args: &FieldsArgs, config: &SyncConfig) -> Result<CommandOutput, CliError> {
    let subject = SubjectKey::parse(&args.subject)?;
    let warehouse = open_warehouse(config)?;
    let subject_key = subject.to_string();

    let (records, field) = match &args.history {
        Some(raw) => {
            let field: FieldKind = raw.parse()?;
            let records = warehouse.field_history(&subject_key, field.as_str(), args.limit)?;
            (records, Some(field))
        }
        None => (warehouse.subject_fields(&subject_key)?, None),
    };

    let rows = records
        .iter()
        .map(render_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CommandOutput::ok(json!({
        "subject": subject_key,
        "field": field,
        "records": rows,
    })))
}

fn render_record(record: &FieldRecord) -> Result<Value, CliError> {
    Ok(json!({
        "field": record.field,
        "policy": record.policy,
        "active": record.active,
        "last_fetched": record.last_fetched,
        "value": serde_json::from_str::<Value>(&record.value_json)?,
        "metadata": serde_json::from_str::<Value>(&record.metadata_json)?,
    }))
}
