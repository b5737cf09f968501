use thiserror::Error;

pub type ReportResult<T> = Result<T, ReportError>;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("QR reconciliation exhausted after {attempts} attempts")]
    ReconciliationExhausted { attempts: u32 },

    #[error("Extractor '{extractor}' failed: {message}")]
    ExtractorFailure { extractor: String, message: String },

    #[error("Invalid report request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
