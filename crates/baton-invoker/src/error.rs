use thiserror::Error;

/// Failures of the subprocess plumbing itself, before the backend's own
/// answer can be judged.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {0}")]
    Process(String),
}
