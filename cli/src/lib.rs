//! Library side of the `procfan` binary
//!
//! [`resolve_config`] merges a config file with command line overrides and
//! [`run_process`] supervises the child, copying its streams to the console
//! until it exits or a shutdown is requested.

pub mod error;

pub use error::{CliError, Result};

use procfan_core::config::{load_from_toml_path, ProcessConfig};
use procfan_core::{Direction, Process, Stream};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subscriber name used for every console stream
pub const CONSOLE: &str = "console";

/// Command line settings applied on top of the config file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    /// Command and arguments; replaces the configured command when non-empty
    pub command: Vec<String>,
    pub stdin: bool,
    pub no_stdout: bool,
    pub no_stderr: bool,
    pub max_wait_ms: Option<u64>,
    pub process_group: bool,
}

/// Build the process configuration for `procfan run`.
///
/// Without a file, stdout and stderr are enabled. Overrides only ever switch
/// a direction on (`stdin`) or off (`no_stdout`, `no_stderr`).
pub fn resolve_config(file: Option<&Path>, overrides: &Overrides) -> Result<ProcessConfig> {
    let mut config = match file {
        Some(path) => load_from_toml_path(path).map_err(|e| CliError::ConfigError(e.to_string()))?,
        None => {
            let mut config = ProcessConfig::default();
            config.stdout = true;
            config.stderr = true;
            config
        }
    };

    if let Some((command, args)) = overrides.command.split_first() {
        config.command = command.clone();
        config.args = args.to_vec();
    }
    if config.command.is_empty() {
        return Err(CliError::InvalidArgument(
            "no command given and none configured".to_string(),
        ));
    }

    config.stdin |= overrides.stdin;
    config.stdout &= !overrides.no_stdout;
    config.stderr &= !overrides.no_stderr;
    config.process_group |= overrides.process_group;
    if let Some(ms) = overrides.max_wait_ms {
        config.max_wait_ms = ms;
    }

    config
        .validate()
        .map_err(|e| CliError::ConfigError(e.to_string()))?;
    Ok(config)
}

/// Where the child's output goes
pub struct Console<O, E> {
    pub stdout: O,
    pub stderr: E,
    /// Prefix every line with its direction
    pub prefix: bool,
}

/// Map an exit to a shell-style code: the exit code, or 128 + signal
pub fn shell_exit_code(process: &Process) -> i32 {
    match process.exit_state() {
        Some(state) => state.signal().map_or(state.code(), |signal| 128 + signal),
        None => 1,
    }
}

/// Run the configured command until it exits.
///
/// Lines read from `input` are forwarded to the child's stdin when stdin is
/// enabled. When `shutdown` resolves first the child is terminated. Returns
/// the shell-style exit code of the child.
pub async fn run_process<O, E, I, S>(
    config: ProcessConfig,
    console: Console<O, E>,
    input: Option<I>,
    shutdown: S,
) -> Result<i32>
where
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
    I: AsyncRead + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let process = Arc::new(Process::new(config)?);
    let prefix = console.prefix;

    let mut printers = Vec::new();
    if let Some(stream) = process.bind_stdout(CONSOLE) {
        printers.push(print_stream(stream, console.stdout, Direction::Stdout, prefix));
    }
    if let Some(stream) = process.bind_stderr(CONSOLE) {
        printers.push(print_stream(stream, console.stderr, Direction::Stderr, prefix));
    }
    let forwarder = match (input, process.bind_stdin(CONSOLE)) {
        (Some(input), Some(stream)) => Some(forward_input(input, stream)),
        _ => None,
    };

    process.start()?;
    info!(
        "Running {} (pid {})",
        process.cmdline().join(" "),
        process.pid().unwrap_or_default()
    );

    tokio::pin!(shutdown);
    let waited = tokio::select! {
        waited = process.wait() => waited,
        _ = &mut shutdown => {
            info!("Shutdown requested, terminating {}", process.name());
            if let Err(e) = process.terminate().await {
                warn!("Terminate reported: {}", e);
            }
            process.wait().await
        }
    };
    if let Err(e) = &waited {
        debug!("{}", e);
    }

    for printer in printers {
        match printer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Console output failed: {}", e),
            Err(e) => warn!("Console printer stopped: {}", e),
        }
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }

    // joins the background tasks; signalling is a no-op once exited
    if let Err(e) = process.terminate().await {
        warn!("Shutdown after exit reported: {}", e);
    }

    Ok(shell_exit_code(&process))
}

fn print_stream<W>(
    stream: Arc<Stream>,
    mut writer: W,
    direction: Direction,
    prefix: bool,
) -> JoinHandle<io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(mut line) = stream.recv().await {
            if prefix {
                writer.write_all(format!("[{}] ", direction).as_bytes()).await?;
            }
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        writer.shutdown().await
    })
}

fn forward_input<I>(input: I, stream: Arc<Stream>) -> JoinHandle<()>
where
    I: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut chunk = line.into_bytes();
                    chunk.push(b'\n');
                    if stream.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Console input reached EOF");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    })
}

/// Load and validate a config file, returning a one-line summary
pub fn check_config(path: &Path) -> Result<String> {
    let config = load_from_toml_path(path).map_err(|e| CliError::ConfigError(e.to_string()))?;
    let directions: Vec<&str> = [
        (config.stdin, "stdin"),
        (config.stdout, "stdout"),
        (config.stderr, "stderr"),
    ]
    .iter()
    .filter(|(enabled, _)| *enabled)
    .map(|(_, name)| *name)
    .collect();

    Ok(format!(
        "{}: command '{}' with {} args, streams [{}], max wait {}",
        path.display(),
        config.command,
        config.args.len(),
        directions.join(", "),
        config
            .max_wait_time()
            .map_or_else(|| "unbounded".to_string(), |d: Duration| format!("{:?}", d))
    ))
}
