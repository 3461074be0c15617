use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Validation failed for {subject}: {details}")]
    ValidationError { subject: String, details: String },

    #[error("Unknown meter: {0}")]
    UnknownMeter(String),

    #[error("Unknown tariff structure: {0}")]
    UnknownTariff(String),

    #[error("Meter {0} has no tariff structure assigned")]
    NoTariffAssigned(String),

    #[error("No applicable energy rate in tariff '{tariff}' for the {season} season")]
    NoApplicableRate { tariff: String, season: String },

    #[error("No time-of-use period in tariff '{tariff}' covers {timestamp}")]
    UncoveredTimeOfUse { tariff: String, timestamp: String },

    #[error("Meter hierarchy error: {0}")]
    HierarchyError(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Energy balance violation for {meter}: supply ({supply}) vs consumption ({consumption}) differs by {difference}")]
    EnergyBalanceViolation {
        meter: String,
        supply: f64,
        consumption: f64,
        difference: f64,
    },

    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Operation cancelled after {completed} of {total} meters")]
    Cancelled { completed: usize, total: usize },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReconciliationError>;
