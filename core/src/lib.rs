//! Core functionality for procfan
//!
//! This crate supervises a single child process and fans its standard
//! streams out to any number of named subscribers. See [`Process`] for the
//! entry point and [`ProcessConfig`] for the options.

pub mod channel;
pub mod config;
mod dispatch;
pub mod error;
mod group;
#[cfg(unix)]
pub mod process;
pub mod registry;
pub mod stats;
mod stdin;
#[cfg(unix)]
pub mod supervisor;

pub use channel::{Channel, SendError, Stream, TrySendError};
pub use config::ProcessConfig;
pub use error::{ProcError, Result};
pub use nix::sys::signal::Signal;
pub use registry::Direction;
pub use stats::{IoCounters, MemoryInfo, ProcessStats, StatsProvider};
#[cfg(unix)]
pub use supervisor::{ExitState, Lifecycle, Process, ProcessBuilder, EXIT_CODE_UNKNOWN};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level` when set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::ProcError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
