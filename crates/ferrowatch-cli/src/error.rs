use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ferrowatch_core::ValidationError),

    #[error(transparent)]
    Config(#[from] ferrowatch_core::ConfigError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Warehouse(#[from] ferrowatch_warehouse::WarehouseError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cannot install logger: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Command(_) => 2,
            Self::Serialization(_) => 4,
            Self::Warehouse(_) => 7,
            Self::Io(_) => 10,
            Self::Logging(_) => 11,
        }
    }
}
