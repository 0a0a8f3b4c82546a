//! Error types for the container runtime layer.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur when driving the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The named instance does not exist.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// A runtime command exited non-zero.
    #[error("runtime command failed ({command}): {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// An exec inside the instance exited non-zero.
    #[error("exec failed in '{container}' (exit {exit_code}): {output}")]
    ExecFailed {
        container: String,
        exit_code: i32,
        output: String,
    },

    /// Runtime output could not be parsed.
    #[error("unparseable runtime output: {0}")]
    Malformed(String),

    /// Pseudo-terminal allocation or shell spawn failed.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// I/O error talking to the runtime.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::NotFound("dotmachine-3".to_string());
        assert_eq!(err.to_string(), "instance not found: dotmachine-3");

        let err = RuntimeError::ExecFailed {
            container: "dotmachine-1".to_string(),
            exit_code: 2,
            output: "no such file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "exec failed in 'dotmachine-1' (exit 2): no such file"
        );
    }
}
