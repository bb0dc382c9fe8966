/// Shared error taxonomy used across all swarm-engine crates.
///
/// Each variant corresponds to one entry of the error taxonomy: what surfaces
/// to the event stream as `error`, what is folded into workflow state instead
/// of failing the task, and what is fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("admission refused: at capacity")]
    AdmissionRefused,

    #[error("all {key_count} credentials exhausted: {last_error}")]
    AllKeysExhausted { key_count: usize, last_error: String },

    #[error("transient provider error: {0}")]
    TransientProviderError(String),

    #[error("provider blocked output: {0}")]
    SafetyBlocked(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
