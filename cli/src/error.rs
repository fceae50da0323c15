//! CLI error types

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Process error: {0}")]
    Process(#[from] procfan_core::ProcError),
}

impl CliError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CliError::InvalidArgument(_) => "CLI002",
            CliError::ConfigError(_) => "CLI003",
            CliError::Process(_) => "CLI004",
        }
    }
}

/// CLI-specific result type
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CliError::InvalidArgument("test".to_string()).code(), "CLI002");
        assert_eq!(CliError::ConfigError("test".to_string()).code(), "CLI003");
        assert_eq!(
            CliError::from(procfan_core::ProcError::NotStarted).code(),
            "CLI004"
        );
    }

    #[test]
    fn test_error_display() {
        let error = CliError::InvalidArgument("no command given".to_string());
        assert_eq!(error.to_string(), "Invalid argument: no command given");
    }
}
