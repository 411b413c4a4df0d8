use std::time::Duration;

use thiserror::Error;

/// Failures reported by the generation backend, classified by how callers react.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The backend asked us to slow down. Triggers the rate limiter cooldown.
    #[error("upstream throttled: {0}")]
    Throttled(String),
    /// Transient outage; callers may retry on their own schedule.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream rejected input: {0}")]
    InvalidInput(String),
    /// Content was refused by the backend's safety policy.
    #[error("upstream blocked request: {0}")]
    Blocked(String),
}

impl UpstreamError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("write failed ({0}); storage may be full, delete old versions and try again")]
    WriteFailed(String),

    #[error("{table} record not found: {id}")]
    ItemNotFound { table: &'static str, id: String },

    #[error("rate limited; retry in {} seconds", retry_after_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("cannot {action} item {id} while it is {status}")]
    InvalidTransition {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

fn retry_after_secs(retry_after: &Duration) -> u64 {
    let millis = retry_after.as_millis();
    u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
}

impl CoreError {
    /// Maps an engine error raised inside a write transaction.
    pub(crate) fn write(err: rusqlite::Error) -> Self {
        Self::WriteFailed(err.to_string())
    }

    /// Maps an engine error raised while opening or reading.
    pub(crate) fn unavailable(err: rusqlite::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}
