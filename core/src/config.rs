//! Configuration for a supervised process
//!
//! [`ProcessConfig`] can be assembled in code with the builder methods or
//! parsed from TOML. Serde defaults fill every optional field, and
//! [`ProcessConfig::validate`] rejects values the supervisor cannot run with.
//!
//! ```toml
//! command = "sh"
//! args = ["-c", "echo hello"]
//! stdout = true
//! maxWaitMs = 1000
//! ```

use crate::{ProcError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of fan-out delivery workers shared by stdout and stderr
pub const DEFAULT_DISPATCH_POOL_SIZE: usize = 20;
/// Default number of lines queued for one output subscriber
pub const DEFAULT_DISPATCH_BACKLOG: usize = 4096;
/// Default per-subscriber delivery deadline
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 20_000;
/// Default initial line buffer (256 KiB)
pub const DEFAULT_LINE_BUFFER_SIZE: usize = 256 * 1024;
/// Default longest accepted line (512 KiB)
pub const DEFAULT_MAX_LINE_SIZE: usize = 512 * 1024;
/// Default wait for the exit after a termination signal
pub const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 5_000;

/// Options for launching and supervising one child process.
///
/// ## Sentinel values
/// - `max_wait_ms = 0` → shutdown waits for the background tasks without a deadline
/// - `stream_capacity = 0` → every bound stream is a rendezvous channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ProcessConfig {
    /// Executable to run (looked up in `PATH` unless it contains a slash)
    pub command: String,
    /// Arguments passed to the executable
    pub args: Vec<String>,
    /// Working directory of the child
    pub working_directory: Option<PathBuf>,
    /// Environment of the child; when non-empty it replaces the inherited one
    pub environment: BTreeMap<String, String>,
    /// Pipe the child's stdin and allow input subscribers
    pub stdin: bool,
    /// Pipe the child's stdout and allow output subscribers
    pub stdout: bool,
    /// Pipe the child's stderr and allow output subscribers
    pub stderr: bool,
    /// Longest the shutdown sequence waits for the child, in milliseconds
    pub max_wait_ms: u64,
    /// Capacity of each bound stream
    pub stream_capacity: usize,
    /// Fan-out delivery workers shared by stdout and stderr, one per output
    /// subscriber
    pub dispatch_pool_size: usize,
    /// Lines queued for one output subscriber before further lines are
    /// dropped for it
    pub dispatch_backlog: usize,
    /// How long one chunk may wait on one subscriber before it is dropped
    pub send_timeout_ms: u64,
    /// Initial size of the output line buffer
    pub line_buffer_size: usize,
    /// Longest output line accepted before the read fails
    pub max_line_size: usize,
    /// Start the child in its own session and signal the whole group
    pub process_group: bool,
    /// How long Terminate/Interrupt/Kill wait for the exit after signalling
    /// when no `max_wait_ms` is set
    pub settle_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_directory: None,
            environment: BTreeMap::new(),
            stdin: false,
            stdout: false,
            stderr: false,
            max_wait_ms: 0,
            stream_capacity: 0,
            dispatch_pool_size: DEFAULT_DISPATCH_POOL_SIZE,
            dispatch_backlog: DEFAULT_DISPATCH_BACKLOG,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            line_buffer_size: DEFAULT_LINE_BUFFER_SIZE,
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            process_group: false,
            settle_timeout_ms: DEFAULT_SETTLE_TIMEOUT_MS,
        }
    }
}

impl ProcessConfig {
    /// Start a configuration for `command` with every direction disabled
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Set one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn stdout(mut self) -> Self {
        self.stdout = true;
        self
    }

    pub fn stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Bound the shutdown wait; `Duration::ZERO` removes the bound
    pub fn max_wait(mut self, limit: Duration) -> Self {
        self.max_wait_ms = duration_ms(limit);
        self
    }

    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    pub fn dispatch_pool_size(mut self, size: usize) -> Self {
        self.dispatch_pool_size = size;
        self
    }

    pub fn dispatch_backlog(mut self, lines: usize) -> Self {
        self.dispatch_backlog = lines;
        self
    }

    pub fn send_timeout(mut self, limit: Duration) -> Self {
        self.send_timeout_ms = duration_ms(limit);
        self
    }

    /// Set the initial and maximum output line sizes
    pub fn line_limits(mut self, initial: usize, max: usize) -> Self {
        self.line_buffer_size = initial;
        self.max_line_size = max;
        self
    }

    pub fn process_group(mut self) -> Self {
        self.process_group = true;
        self
    }

    pub fn settle_timeout(mut self, limit: Duration) -> Self {
        self.settle_timeout_ms = duration_ms(limit);
        self
    }

    /// Shutdown wait deadline, `None` when unbounded
    #[inline]
    pub fn max_wait_time(&self) -> Option<Duration> {
        if self.max_wait_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.max_wait_ms))
        }
    }

    #[inline]
    pub fn send_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Post-signal wait: the shutdown deadline when set, the settle timeout otherwise
    #[inline]
    pub fn settle_duration(&self) -> Duration {
        self.max_wait_time()
            .unwrap_or_else(|| Duration::from_millis(self.settle_timeout_ms))
    }

    /// Validate the configuration, reporting the offending field
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ProcError::ConfigurationError(
                "command: cannot be empty".to_string(),
            ));
        }
        if let Some(dir) = &self.working_directory {
            if dir.as_os_str().is_empty() {
                return Err(ProcError::ConfigurationError(
                    "workingDirectory: cannot be empty".to_string(),
                ));
            }
        }
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ProcError::ConfigurationError(format!(
                    "environment: invalid variable name '{}'",
                    key
                )));
            }
        }
        if self.dispatch_pool_size == 0 {
            return Err(ProcError::ConfigurationError(
                "dispatchPoolSize: must be greater than 0".to_string(),
            ));
        }
        if self.dispatch_backlog == 0 {
            return Err(ProcError::ConfigurationError(
                "dispatchBacklog: must be greater than 0".to_string(),
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(ProcError::ConfigurationError(
                "sendTimeoutMs: must be greater than 0".to_string(),
            ));
        }
        if self.line_buffer_size == 0 {
            return Err(ProcError::ConfigurationError(
                "lineBufferSize: must be greater than 0".to_string(),
            ));
        }
        if self.max_line_size < self.line_buffer_size {
            return Err(ProcError::ConfigurationError(format!(
                "maxLineSize: must be at least lineBufferSize ({})",
                self.line_buffer_size
            )));
        }
        Ok(())
    }
}

fn duration_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

/// Load a process configuration from a TOML file path
pub fn load_from_toml_path(path: impl AsRef<Path>) -> Result<ProcessConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        ProcError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_from_toml_str(&data)
}

/// Load a process configuration from a TOML string
pub fn load_from_toml_str(input: &str) -> Result<ProcessConfig> {
    let cfg: ProcessConfig = toml::from_str(input)
        .map_err(|e| ProcError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
