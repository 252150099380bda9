/// Returned in place of a result when work was cancelled by a shutdown signal, either from the
/// operator or because the run's deadline passed.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct ShutdownSignalError {
    msg: String,
}

impl Default for ShutdownSignalError {
    fn default() -> Self {
        Self {
            msg: "Execution cancelled by shutdown signal".to_string(),
        }
    }
}

/// Returned when a unit, or the async work it delegates to an executor, runs past its deadline.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct DeadlineExceededError {
    msg: String,
}

impl Default for DeadlineExceededError {
    fn default() -> Self {
        Self {
            msg: "Deadline exceeded".to_string(),
        }
    }
}
