//! Resource statistics for the supervised child
//!
//! The supervisor attaches a [`ProcessStats`] handle right after spawning and
//! forwards its stats accessors to it. On Linux the handle reads `/proc`
//! through the `procfs` crate; other platforms get
//! [`UnsupportedStatsProvider`].

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::ProcfsStatsProvider;

use crate::{ProcError, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Memory usage in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Resident set size
    pub rss: u64,
    /// Virtual memory size
    pub vms: u64,
    /// Peak resident set size
    pub hwm: u64,
    pub data: u64,
    pub stack: u64,
    pub locked: u64,
    pub swap: u64,
}

/// Cumulative I/O counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    /// Read syscalls
    pub read_count: u64,
    /// Write syscalls
    pub write_count: u64,
    /// Bytes fetched from storage
    pub read_bytes: u64,
    /// Bytes sent to storage
    pub write_bytes: u64,
    /// Bytes passed to read-like syscalls, storage or not
    pub read_chars: u64,
    /// Bytes passed to write-like syscalls, storage or not
    pub write_chars: u64,
}

/// Live view of one process
pub trait ProcessStats: Send + Sync {
    fn cwd(&self) -> Result<PathBuf>;
    fn exe(&self) -> Result<PathBuf>;
    /// Whether the attached process still exists and is not a zombie
    fn is_running(&self) -> Result<bool>;
    fn memory_info(&self) -> Result<MemoryInfo>;
    /// CPU time used as a percentage of the wall time since attach
    fn cpu_percent(&self) -> Result<f64>;
    fn io_counters(&self) -> Result<IoCounters>;
    /// Open socket descriptors
    fn num_connections(&self) -> Result<usize>;
    fn num_fds(&self) -> Result<usize>;
    fn num_threads(&self) -> Result<usize>;
}

/// Creates [`ProcessStats`] handles for freshly spawned children
pub trait StatsProvider: Send + Sync {
    fn attach(&self, pid: u32) -> Result<Arc<dyn ProcessStats>>;
}

/// Provider for platforms without a stats backend; every attach fails
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedStatsProvider;

impl StatsProvider for UnsupportedStatsProvider {
    fn attach(&self, pid: u32) -> Result<Arc<dyn ProcessStats>> {
        Err(ProcError::Stats(format!(
            "process stats are not supported on this platform (pid {})",
            pid
        )))
    }
}

/// The stats backend for the current platform
pub fn default_provider() -> Arc<dyn StatsProvider> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsStatsProvider::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedStatsProvider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_provider_fails_attach() {
        let err = UnsupportedStatsProvider.attach(1).err().unwrap();
        assert_eq!(err.code(), "PROC011");
    }
}
