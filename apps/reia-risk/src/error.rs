use crate::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("aggregation tag {name:?} is not registered for exposure model {exposure_model_id}")]
    UnknownTag { name: String, exposure_model_id: i64 },

    /// `committed_chunks` > 0 means a parallel load left rows behind that need
    /// manual cleanup (drop the calculation partition).
    #[error("bulk load into {table} failed after {committed_chunks} committed chunk(s): {reason}")]
    BulkLoad {
        table: String,
        committed_chunks: usize,
        reason: String,
    },

    #[error("invalid status transition: {from} -> {to}. Valid transitions from {from} are: {allowed}")]
    InvalidTransition {
        from: Status,
        to: Status,
        allowed: String,
    },

    #[error("malformed result datastore: {0}")]
    MalformedResult(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine api error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RiskError {
    pub fn bulk_load(table: &str, committed_chunks: usize, reason: impl ToString) -> Self {
        RiskError::BulkLoad {
            table: table.to_string(),
            committed_chunks,
            reason: reason.to_string(),
        }
    }

    pub fn is_partial_load(&self) -> bool {
        matches!(
            self,
            RiskError::BulkLoad {
                committed_chunks, ..
            } if *committed_chunks > 0
        )
    }
}

pub type Result<T> = std::result::Result<T, RiskError>;
