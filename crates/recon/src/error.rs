use thiserror::Error;

/// Engine-level failures.
///
/// Per-group conditions (missing references, amount disagreements) are not
/// errors; they are classified into a result. Only conditions that stop a
/// group or a whole chunk from producing a result live here.
#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Config validation error (unknown source, short pipeline, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// A pipeline references a source that is not declared.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// Chunk parameters that cannot be interpreted.
    #[error("invalid chunk request: {0}")]
    InvalidRequest(String),

    /// The ledger store could not be reached after all retries.
    #[error("source '{source_name}' unavailable after {attempts} attempt(s): {message}")]
    SourceUnavailable {
        source_name: String,
        attempts: u32,
        message: String,
    },

    /// The ledger store returned a page sequence that cannot be followed.
    #[error("source '{source_name}' pagination error: {message}")]
    Pagination { source_name: String, message: String },

    /// Decimal arithmetic left the representable range.
    #[error("group '{group}': amount overflow while summing {stage} records")]
    AmountOverflow { group: String, stage: String },

    /// Subtracting one stage total from another left the representable range.
    #[error("group '{group}': variance overflow comparing {upstream}->{downstream}")]
    VarianceOverflow {
        group: String,
        upstream: String,
        downstream: String,
    },

    /// The downstream queue rejected a result.
    #[error("publish failed for '{unique_key}': {message}")]
    PublishFailure { unique_key: String, message: String },

    /// The result store lookup failed.
    #[error("result store error for '{unique_key}': {message}")]
    ResultStore { unique_key: String, message: String },

    /// Job tracking store failure.
    #[error("job '{job_id}': {message}")]
    Tracker { job_id: String, message: String },

    /// IO error (file read, etc.).
    #[error("IO error: {0}")]
    Io(String),
}
