//! Unix spawn and signal delivery
//!
//! [`spawn`] applies a [`ProcessConfig`] to a `tokio::process::Command`:
//! enabled directions are piped, disabled ones are connected to `/dev/null`.
//! When the config asks for a process group the child calls `setsid()` before
//! `exec`, so [`send_signal`] can address the whole tree through `killpg`.

// setsid() in pre_exec needs unsafe
#![allow(unsafe_code)]

use crate::config::ProcessConfig;
use crate::{ProcError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error};

/// A spawned child and the pipes not yet claimed
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    group: bool,
    child: Child,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child leads its own process group
    pub fn is_group_leader(&self) -> bool {
        self.group
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|e| ProcError::Wait {
            pid: self.pid,
            message: e.to_string(),
        })
    }
}

fn stdio(enabled: bool) -> Stdio {
    if enabled {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Spawn the configured command.
///
/// A non-empty `environment` replaces the inherited environment entirely.
/// Spawn failures carry the OS error unchanged.
///
/// ```rust,no_run
/// use procfan_core::config::ProcessConfig;
/// use procfan_core::process::unix::spawn;
///
/// # #[tokio::main] async fn main() -> procfan_core::Result<()> {
/// let config = ProcessConfig::new("echo").arg("hello").stdout();
/// let mut child = spawn(&config)?;
/// assert!(child.take_stdout().is_some());
/// # Ok(()) }
/// ```
pub fn spawn(config: &ProcessConfig) -> Result<ChildProcess> {
    debug!("Spawning process: {} {:?}", config.command, config.args);

    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .stdin(stdio(config.stdin))
        .stdout(stdio(config.stdout))
        .stderr(stdio(config.stderr));
    if let Some(dir) = &config.working_directory {
        command.current_dir(dir);
    }
    if !config.environment.is_empty() {
        command.env_clear().envs(&config.environment);
    }

    if config.process_group {
        // Safety: setsid() is async-signal-safe and runs in the child before exec
        #[deny(unsafe_op_in_unsafe_fn)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = command.spawn().map_err(|source| {
        error!("Failed to spawn process '{}': {}", config.command, source);
        ProcError::Spawn {
            command: config.command.clone(),
            source,
        }
    })?;

    let pid = child.id().ok_or_else(|| ProcError::Spawn {
        command: config.command.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "spawned child has no pid"),
    })?;
    debug!(
        "Spawned process {}{}",
        pid,
        if config.process_group {
            " in new process group"
        } else {
            ""
        }
    );

    Ok(ChildProcess {
        pid,
        group: config.process_group,
        child,
    })
}

/// Deliver `signal` to `pid`, or to its process group when `group` is set.
///
/// A target that no longer exists (`ESRCH`) counts as delivered. For groups
/// `EPERM` is treated the same way, since it is what `killpg` reports once
/// only zombies remain in the group.
pub fn send_signal(pid: u32, signal: Signal, group: bool) -> Result<()> {
    let target = Pid::from_raw(pid as i32);
    debug!(
        "Sending {} to {} {}",
        signal,
        if group { "process group" } else { "process" },
        pid
    );

    let sent = if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    match sent {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("Process {} already exited", pid);
            Ok(())
        }
        Err(Errno::EPERM) if group => {
            debug!(
                "Permission denied signaling process group {} (likely already exited)",
                pid
            );
            Ok(())
        }
        Err(source) => {
            error!("Failed to send {} to process {}: {}", signal, pid, source);
            Err(ProcError::Signal {
                pid,
                signal,
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_spawn_pipes_only_enabled_directions() {
        let config = ProcessConfig::new("echo").arg("hello").stdout();
        let mut child = spawn(&config).expect("Failed to spawn echo");
        assert!(child.pid() > 0);
        assert!(!child.is_group_leader());
        assert!(child.take_stdin().is_none());
        assert!(child.take_stderr().is_none());

        let mut out = String::new();
        child
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_environment_replaces_inherited() {
        let config = ProcessConfig::new("/bin/sh")
            .args(["-c", "echo \"$ONLY:${HOME:-unset}\""])
            .env("ONLY", "me")
            .stdout();
        let mut child = spawn(&config).unwrap();
        let mut out = String::new();
        child
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "me:unset");
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessConfig::new("pwd")
            .working_directory(dir.path())
            .stdout();
        let mut child = spawn(&config).unwrap();
        let mut out = String::new();
        child
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(out.trim()).canonicalize().unwrap(), expected);
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let err = spawn(&ProcessConfig::new("nonexistent_command_12345")).unwrap_err();
        match err {
            ProcError::Spawn { command, source } => {
                assert_eq!(command, "nonexistent_command_12345");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            e => panic!("Expected Spawn error, got: {}", e),
        }
    }

    #[tokio::test]
    async fn test_signal_group_leader() {
        let config = ProcessConfig::new("sleep").arg("30").process_group();
        let mut child = spawn(&config).unwrap();
        assert!(child.is_group_leader());
        assert_eq!(
            nix::unistd::getpgid(Some(Pid::from_raw(child.pid() as i32))).unwrap(),
            Pid::from_raw(child.pid() as i32)
        );

        send_signal(child.pid(), Signal::SIGTERM, true).unwrap();
        let status = child.wait().await.unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_signal_exited_process_is_ok() {
        let mut child = spawn(&ProcessConfig::new("true")).unwrap();
        let pid = child.pid();
        child.wait().await.unwrap();
        assert!(send_signal(pid, Signal::SIGTERM, false).is_ok());
        assert!(send_signal(pid, Signal::SIGKILL, true).is_ok());
    }
}
