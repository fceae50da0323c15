//! Exit state and lifecycle of a supervised child

use nix::sys::signal::Signal;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Exit code reported while the exit is unknown or the child died by a signal
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Exited normally with a code
    Exited(i32),
    /// Terminated by a signal number
    Signaled(i32),
}

impl ExitState {
    /// Exit code, or [`EXIT_CODE_UNKNOWN`] when killed by a signal
    pub fn code(&self) -> i32 {
        match self {
            ExitState::Exited(code) => *code,
            ExitState::Signaled(_) => EXIT_CODE_UNKNOWN,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitState::Exited(_) => None,
            ExitState::Signaled(signal) => Some(*signal),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited(0))
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitState::Exited(code),
            None => ExitState::Signaled(status.signal().unwrap_or_default()),
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit status {}", code),
            ExitState::Signaled(number) => match Signal::try_from(*number) {
                Ok(signal) => write!(f, "signal: {}", signal),
                Err(_) => write!(f, "signal: {}", number),
            },
        }
    }
}

/// Where a [`Process`](super::Process) is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, streams may still be bound
    Created,
    /// Child spawned and not yet reaped
    Running,
    /// Child reaped, shutdown not yet run
    Exited,
    /// Shutdown sequence has run
    Closed,
}
