//! Core error types and utilities

use crate::registry::Direction;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the process supervisor
#[derive(Error, Debug)]
pub enum ProcError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process {pid}: {message}")]
    Wait { pid: u32, message: String },

    #[error("process {pid} exited unsuccessfully: {state}")]
    ExitStatus { pid: u32, state: crate::ExitState },

    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::errno::Errno,
    },

    /// Write failure on the child's stdin, tagged with the input subscriber
    #[error("{name}: {source}")]
    Pipe {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{direction} read failed: {source}")]
    Read {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    #[error("{name}: dispatch pool saturated")]
    PoolSaturated { name: String },

    #[error("{name}: dispatch pool released")]
    PoolReleased { name: String },

    #[error("shutdown wait deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Stats error: {0}")]
    Stats(String),

    #[error("background task failed to join: {0}")]
    TaskJoin(String),

    #[error("process not started")]
    NotStarted,

    #[error("process already started")]
    AlreadyStarted,

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("{}", joined(.0))]
    Multiple(Vec<ProcError>),
}

/// Renders joined errors one per line
fn joined(errors: &[ProcError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ProcError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            ProcError::ConfigurationError(_) => "PROC001",
            ProcError::Spawn { .. } => "PROC002",
            ProcError::Wait { .. } => "PROC003",
            ProcError::ExitStatus { .. } => "PROC004",
            ProcError::Signal { .. } => "PROC005",
            ProcError::Pipe { .. } => "PROC006",
            ProcError::Read { .. } => "PROC007",
            ProcError::PoolSaturated { .. } => "PROC008",
            ProcError::PoolReleased { .. } => "PROC009",
            ProcError::DeadlineExceeded(_) => "PROC010",
            ProcError::Stats(_) => "PROC011",
            ProcError::TaskJoin(_) => "PROC012",
            ProcError::NotStarted => "PROC013",
            ProcError::AlreadyStarted => "PROC014",
            ProcError::InitializationError(_) => "PROC016",
            ProcError::Multiple(_) => "PROC999",
        }
    }

    /// Combine independent failures so that none of them hides another.
    ///
    /// Returns `Ok(())` when every input is `None`, the error itself when
    /// exactly one is present, and [`ProcError::Multiple`] otherwise. Nested
    /// `Multiple` values are flattened.
    pub fn join<I>(errors: I) -> Result<()>
    where
        I: IntoIterator<Item = Option<ProcError>>,
    {
        let mut flat = Vec::new();
        for err in errors.into_iter().flatten() {
            match err {
                ProcError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(ProcError::Multiple(flat)),
        }
    }

    /// Whether this error (or any error joined into it) is a shutdown deadline
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            ProcError::DeadlineExceeded(_) => true,
            ProcError::Multiple(inner) => inner.iter().any(ProcError::is_deadline_exceeded),
            _ => false,
        }
    }

    /// Iterate over the individual errors (a single error yields itself)
    pub fn iter(&self) -> Box<dyn Iterator<Item = &ProcError> + '_> {
        match self {
            ProcError::Multiple(inner) => Box::new(inner.iter().flat_map(ProcError::iter)),
            other => Box::new(std::iter::once(other)),
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, ProcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ProcError::ConfigurationError("test".to_string()).code(), "PROC001");
        assert_eq!(ProcError::NotStarted.code(), "PROC013");
        assert_eq!(ProcError::DeadlineExceeded(Duration::from_secs(1)).code(), "PROC010");
        assert_eq!(
            ProcError::PoolSaturated { name: "a".to_string() }.code(),
            "PROC008"
        );
        assert_eq!(ProcError::Multiple(vec![]).code(), "PROC999");
    }

    #[test]
    fn test_error_display() {
        let error = ProcError::Pipe {
            name: "in".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert_eq!(error.to_string(), "in: broken pipe");

        let error = ProcError::Read {
            direction: Direction::Stdout,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "too long"),
        };
        assert_eq!(error.to_string(), "stdout read failed: too long");
    }

    #[test]
    fn test_join_none_is_ok() {
        assert!(ProcError::join([None, None]).is_ok());
    }

    #[test]
    fn test_join_single_is_unwrapped() {
        let err = ProcError::join([None, Some(ProcError::NotStarted)]).unwrap_err();
        assert!(matches!(err, ProcError::NotStarted));
    }

    #[test]
    fn test_join_keeps_both_and_flattens() {
        let shutdown = ProcError::join([
            Some(ProcError::DeadlineExceeded(Duration::from_secs(1))),
            Some(ProcError::Stats("gone".to_string())),
        ])
        .unwrap_err();
        let err = ProcError::join([Some(shutdown), Some(ProcError::AlreadyStarted)]).unwrap_err();

        let codes: Vec<_> = err.iter().map(ProcError::code).collect();
        assert_eq!(codes, vec!["PROC010", "PROC011", "PROC014"]);
        assert!(err.is_deadline_exceeded());
        assert_eq!(
            err.to_string(),
            "shutdown wait deadline of 1s exceeded\nStats error: gone\nprocess already started"
        );
    }
}
