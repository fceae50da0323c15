use super::{IoCounters, MemoryInfo, ProcessStats, StatsProvider};
use crate::{ProcError, Result};
use procfs::process::{FDTarget, Process};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const KIB: u64 = 1024;

/// Reads process statistics from `/proc`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsStatsProvider;

impl ProcfsStatsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl StatsProvider for ProcfsStatsProvider {
    fn attach(&self, pid: u32) -> Result<Arc<dyn ProcessStats>> {
        let process = Process::new(pid as i32).map_err(|e| stats_error(pid, e))?;
        let stat = process.stat().map_err(|e| stats_error(pid, e))?;
        debug!("Attached stats to process {}", pid);
        Ok(Arc::new(ProcfsStats {
            pid,
            start_time: stat.starttime,
            attached_at: Instant::now(),
            cpu_ticks_at_attach: stat.utime + stat.stime,
            process,
        }))
    }
}

fn stats_error(pid: u32, e: procfs::ProcError) -> ProcError {
    ProcError::Stats(format!("process {}: {}", pid, e))
}

struct ProcfsStats {
    pid: u32,
    /// Start time in clock ticks after boot, used to detect pid reuse
    start_time: u64,
    attached_at: Instant,
    cpu_ticks_at_attach: u64,
    process: Process,
}

impl ProcfsStats {
    fn err(&self, e: procfs::ProcError) -> ProcError {
        stats_error(self.pid, e)
    }
}

impl ProcessStats for ProcfsStats {
    fn cwd(&self) -> Result<PathBuf> {
        self.process.cwd().map_err(|e| self.err(e))
    }

    fn exe(&self) -> Result<PathBuf> {
        self.process.exe().map_err(|e| self.err(e))
    }

    fn is_running(&self) -> Result<bool> {
        match self.process.stat() {
            Ok(stat) => Ok(stat.starttime == self.start_time && !matches!(stat.state, 'Z' | 'X')),
            Err(procfs::ProcError::NotFound(_)) => Ok(false),
            Err(procfs::ProcError::Io(e, _)) if e.raw_os_error() == Some(libc::ESRCH) => Ok(false),
            Err(e) => Err(self.err(e)),
        }
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        let status = self.process.status().map_err(|e| self.err(e))?;
        let kib = |value: Option<u64>| value.unwrap_or(0) * KIB;
        Ok(MemoryInfo {
            rss: kib(status.vmrss),
            vms: kib(status.vmsize),
            hwm: kib(status.vmhwm),
            data: kib(status.vmdata),
            stack: kib(status.vmstk),
            locked: kib(status.vmlck),
            swap: kib(status.vmswap),
        })
    }

    fn cpu_percent(&self) -> Result<f64> {
        let stat = self.process.stat().map_err(|e| self.err(e))?;
        let elapsed = self.attached_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return Ok(0.0);
        }
        let ticks = (stat.utime + stat.stime).saturating_sub(self.cpu_ticks_at_attach);
        let cpu_seconds = ticks as f64 / procfs::ticks_per_second() as f64;
        Ok(cpu_seconds / elapsed * 100.0)
    }

    fn io_counters(&self) -> Result<IoCounters> {
        let io = self.process.io().map_err(|e| self.err(e))?;
        Ok(IoCounters {
            read_count: io.syscr,
            write_count: io.syscw,
            read_bytes: io.read_bytes,
            write_bytes: io.write_bytes,
            read_chars: io.rchar,
            write_chars: io.wchar,
        })
    }

    fn num_connections(&self) -> Result<usize> {
        let fds = self.process.fd().map_err(|e| self.err(e))?;
        Ok(fds
            .filter_map(|fd| fd.ok())
            .filter(|fd| matches!(fd.target, FDTarget::Socket(_)))
            .count())
    }

    fn num_fds(&self) -> Result<usize> {
        self.process.fd_count().map_err(|e| self.err(e))
    }

    fn num_threads(&self) -> Result<usize> {
        let stat = self.process.stat().map_err(|e| self.err(e))?;
        Ok(stat.num_threads.max(0) as usize)
    }
}
