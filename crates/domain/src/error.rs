/// Shared error type used across the execution core.
///
/// Variants map onto the error taxonomy: validation failures are surfaced
/// synchronously, capacity/liveness/cancellation/timeout failures drive task
/// status transitions, and `NotFound`/`Stale`/`Forbidden` replace
/// exception-driven "not found" handling with a typed result.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("capacity: {0}")]
    Capacity(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("stale: {0}")]
    Stale(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("execution: {0}")]
    Execution(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
