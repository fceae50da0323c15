//! Process supervisor with multiplexed stdio streams
//!
//! A [`Process`] launches exactly one child and exposes its standard streams
//! as named, independently consumed [`Stream`]s. Subscribers are bound before
//! [`Process::start`]; after that the set is fixed.
//!
//! ## Architecture
//!
//! ```text
//!   stdin subscribers ──► pump tasks ──► (lock) ──► child stdin
//!   child stdout ──► FanOut ──► worker pool ──► stdout subscribers
//!   child stderr ──► FanOut ──► worker pool ──► stderr subscribers
//!   child ──► reaper (only OS wait) ──► exit state ──► wait()/exit_code()
//! ```
//!
//! Every background task races a single cancellation scope, which is
//! cancelled once by the shutdown sequence run from [`Process::terminate`],
//! [`Process::interrupt`] and [`Process::kill`]:
//!
//! ```text
//! Created → Running → Exited → Closed
//! ```

use crate::channel::Stream;
use crate::config::ProcessConfig;
use crate::dispatch::{FanOut, WorkerPool};
use crate::group::TaskGroup;
use crate::process::{self, ChildProcess};
use crate::registry::{Direction, StreamRegistry};
use crate::stats::{self, IoCounters, MemoryInfo, ProcessStats, StatsProvider};
use crate::stdin::{self, SharedWriter};
use crate::{ProcError, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod exit;


pub use exit::{ExitState, Lifecycle, EXIT_CODE_UNKNOWN};

/// Exit outcome published by the reaper; the error is the wait failure message
type ExitOutcome = std::result::Result<ExitState, String>;

struct RunState {
    lifecycle: Lifecycle,
    pid: Option<u32>,
    created_at: Option<DateTime<Utc>>,
}

/// Builder for a [`Process`] with non-default collaborators
pub struct ProcessBuilder {
    config: ProcessConfig,
    stats_provider: Option<Arc<dyn StatsProvider>>,
    parent: Option<CancellationToken>,
}

impl ProcessBuilder {
    /// Use `provider` instead of the platform stats backend
    pub fn stats_provider(mut self, provider: Arc<dyn StatsProvider>) -> Self {
        self.stats_provider = Some(provider);
        self
    }

    /// Kill the child when `token` is cancelled
    pub fn parent(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    /// Validate the configuration and create the supervisor
    pub fn build(self) -> Result<Process> {
        self.config.validate()?;

        let scope = self
            .parent
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let capacity = self.config.stream_capacity;
        debug!(
            "Creating process supervisor for '{}' (stdin={}, stdout={}, stderr={})",
            self.config.command, self.config.stdin, self.config.stdout, self.config.stderr
        );

        Ok(Process {
            stdin_streams: StreamRegistry::new(Direction::Stdin, self.config.stdin, capacity),
            stdout_streams: StreamRegistry::new(Direction::Stdout, self.config.stdout, capacity),
            stderr_streams: StreamRegistry::new(Direction::Stderr, self.config.stderr, capacity),
            stdin_closer: scope.child_token(),
            stdout_closer: scope.child_token(),
            stderr_closer: scope.child_token(),
            scope,
            parent: self.parent,
            pool: WorkerPool::new(self.config.dispatch_pool_size),
            tasks: TaskGroup::new(),
            stdin_pipe: OnceLock::new(),
            state: Mutex::new(RunState {
                lifecycle: Lifecycle::Created,
                pid: None,
                created_at: None,
            }),
            exit: Arc::new(watch::channel(None).0),
            stats: OnceLock::new(),
            stats_provider: self
                .stats_provider
                .unwrap_or_else(stats::default_provider),
            stop_lock: tokio::sync::Mutex::new(()),
            config: self.config,
        })
    }
}

/// A supervised child process.
///
/// All methods take `&self`, so a `Process` can be shared through an `Arc`
/// between a task waiting on it and a task stopping it.
///
/// ```rust,no_run
/// use procfan_core::{Process, ProcessConfig};
///
/// # #[tokio::main] async fn main() -> procfan_core::Result<()> {
/// let process = Process::new(ProcessConfig::new("echo").arg("hello").stdout())?;
/// let out = process.bind_stdout("out").expect("stdout is enabled");
/// process.start()?;
/// while let Some(line) = out.recv().await {
///     println!("{}", String::from_utf8_lossy(&line));
/// }
/// process.wait().await?;
/// # Ok(()) }
/// ```
pub struct Process {
    config: ProcessConfig,
    stdin_streams: StreamRegistry,
    stdout_streams: StreamRegistry,
    stderr_streams: StreamRegistry,
    scope: CancellationToken,
    stdin_closer: CancellationToken,
    stdout_closer: CancellationToken,
    stderr_closer: CancellationToken,
    parent: Option<CancellationToken>,
    pool: WorkerPool,
    tasks: TaskGroup,
    stdin_pipe: OnceLock<SharedWriter<ChildStdin>>,
    state: Mutex<RunState>,
    exit: Arc<watch::Sender<Option<ExitOutcome>>>,
    stats: OnceLock<Arc<dyn ProcessStats>>,
    stats_provider: Arc<dyn StatsProvider>,
    stop_lock: tokio::sync::Mutex<()>,
}

impl Process {
    /// Create a supervisor with the platform stats backend
    pub fn new(config: ProcessConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ProcessConfig) -> ProcessBuilder {
        ProcessBuilder {
            config,
            stats_provider: None,
            parent: None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self, registry: &StreamRegistry, name: &str) -> Option<Arc<Stream>> {
        // held across the bind so start() cannot snapshot subscribers in between
        let state = self.lock_state();
        if state.lifecycle != Lifecycle::Created {
            drop(state);
            panic!("bind pipe after process started: {}", name);
        }
        registry.bind(name)
    }

    /// Bind an input subscriber; everything sent on it is written to the
    /// child's stdin. `None` when stdin is not enabled.
    ///
    /// # Panics
    ///
    /// When called after [`start`](Self::start).
    pub fn bind_stdin(&self, name: &str) -> Option<Arc<Stream>> {
        self.bind(&self.stdin_streams, name)
    }

    /// Bind an output subscriber that receives every stdout line.
    /// `None` when stdout is not enabled.
    ///
    /// # Panics
    ///
    /// When called after [`start`](Self::start).
    pub fn bind_stdout(&self, name: &str) -> Option<Arc<Stream>> {
        self.bind(&self.stdout_streams, name)
    }

    /// Bind an output subscriber that receives every stderr line.
    /// `None` when stderr is not enabled.
    ///
    /// # Panics
    ///
    /// When called after [`start`](Self::start).
    pub fn bind_stderr(&self, name: &str) -> Option<Arc<Stream>> {
        self.bind(&self.stderr_streams, name)
    }

    /// Spawn the child and its background tasks without waiting for it.
    ///
    /// Must be called from within a Tokio runtime. A spawn failure leaves the
    /// supervisor unstarted; starting twice is an error.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.lifecycle != Lifecycle::Created {
            return Err(ProcError::AlreadyStarted);
        }

        let mut child = process::spawn(&self.config)?;
        let pid = child.pid();
        state.pid = Some(pid);
        state.created_at = Some(Utc::now());
        state.lifecycle = Lifecycle::Running;
        drop(state);
        info!("Started process {} {:?}", pid, self.cmdline());

        match self.stats_provider.attach(pid) {
            Ok(handle) => {
                let _ = self.stats.set(handle);
            }
            Err(e) => warn!("Stats unavailable for process {}: {}", pid, e),
        }

        self.listen_stdin(&mut child);
        self.listen_output(Direction::Stdout, &mut child);
        self.listen_output(Direction::Stderr, &mut child);
        self.spawn_reaper(child);
        Ok(())
    }

    fn listen_stdin(&self, child: &mut ChildProcess) {
        let Some(pipe) = child.take_stdin() else {
            return;
        };
        let writer = stdin::shared(pipe);
        let _ = self.stdin_pipe.set(Arc::clone(&writer));

        for (name, stream) in self.stdin_streams.subscribers() {
            let pump = stdin::pump(
                name,
                stream,
                Arc::clone(&writer),
                self.scope.clone(),
                self.stdin_closer.clone(),
            );
            self.tasks.spawn(async move {
                pump.await.map_err(|e| {
                    error!("stdin writer failed: {}", e);
                    e
                })
            });
        }
    }

    fn listen_output(&self, direction: Direction, child: &mut ChildProcess) {
        let (registry, closer) = match direction {
            Direction::Stdout => (&self.stdout_streams, &self.stdout_closer),
            Direction::Stderr => (&self.stderr_streams, &self.stderr_closer),
            Direction::Stdin => return,
        };
        let fan_out = FanOut::new(
            direction,
            registry.subscribers(),
            self.pool.clone(),
            &self.config,
            self.scope.clone(),
            closer.clone(),
        );
        debug!("{} has {} subscribers", direction, registry.len());

        match direction {
            Direction::Stdout => {
                if let Some(pipe) = child.take_stdout() {
                    self.tasks.spawn(log_failure(direction, fan_out.run(pipe)));
                }
            }
            _ => {
                if let Some(pipe) = child.take_stderr() {
                    self.tasks.spawn(log_failure(direction, fan_out.run(pipe)));
                }
            }
        }
    }

    fn spawn_reaper(&self, mut child: ChildProcess) {
        let exit = Arc::clone(&self.exit);
        let parent = self.parent.clone();
        let pid = child.pid();
        let group = child.is_group_leader();

        tokio::spawn(async move {
            let waited = match &parent {
                Some(parent) => tokio::select! {
                    status = child.wait() => Some(status),
                    _ = parent.cancelled() => None,
                },
                None => Some(child.wait().await),
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    debug!("Parent scope cancelled, killing process {}", pid);
                    if let Err(e) = process::send_signal(pid, Signal::SIGKILL, group) {
                        warn!("{}", e);
                    }
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(status) => {
                    let state = ExitState::from(status);
                    info!("Process {} exited: {}", pid, state);
                    Ok(state)
                }
                Err(e) => {
                    error!("{}", e);
                    Err(e.to_string())
                }
            };
            exit.send_replace(Some(outcome));
        });
    }

    async fn exit_outcome(&self) -> ExitOutcome {
        let mut exit = self.exit.subscribe();
        let outcome = match exit.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err("exit state was never recorded".to_string()))
    }

    /// Wait for the child to exit.
    ///
    /// Only observes the exit recorded by the supervisor, so it can be called
    /// any number of times, concurrently. A non-zero exit or a signal death is
    /// [`ProcError::ExitStatus`].
    pub async fn wait(&self) -> Result<()> {
        let pid = self.pid().ok_or(ProcError::NotStarted)?;
        match self.exit_outcome().await {
            Ok(state) if state.success() => Ok(()),
            Ok(state) => Err(ProcError::ExitStatus { pid, state }),
            Err(message) => Err(ProcError::Wait { pid, message }),
        }
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Send `signal` to the child (or its group); a no-op before start and
    /// after the exit has been recorded.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.pid() else {
            debug!("Not signalling '{}', process not started", self.name());
            return Ok(());
        };
        if self.has_exited() {
            debug!("Not signalling process {}, already exited", pid);
            return Ok(());
        }
        process::send_signal(pid, signal, self.config.process_group)
    }

    /// Shut down and send SIGTERM
    pub async fn terminate(&self) -> Result<()> {
        self.stop(Signal::SIGTERM).await
    }

    /// Shut down and send SIGINT
    pub async fn interrupt(&self) -> Result<()> {
        self.stop(Signal::SIGINT).await
    }

    /// Shut down and send SIGKILL
    pub async fn kill(&self) -> Result<()> {
        self.stop(Signal::SIGKILL).await
    }

    async fn stop(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        let _stopping = self.stop_lock.lock().await;

        let shutdown = self.shutdown().await.err();
        let signalled = self.signal(signal);
        if signalled.is_ok() {
            let limit = self.config.settle_duration();
            if timeout(limit, self.exit_outcome()).await.is_err() {
                warn!(
                    "Process {} still running {:?} after {}",
                    pid, limit, signal
                );
            }
        }
        ProcError::join([shutdown, signalled.err()])
    }

    /// Close every stream, stop the background tasks and wait for them.
    ///
    /// Each step runs even when an earlier one fails. With a maximum wait
    /// configured the final wait (tasks, then the exit) is bounded, and
    /// running out of time is [`ProcError::DeadlineExceeded`]; the child is
    /// left running.
    async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down process '{}'", self.name());

        self.stdin_streams.close_all();
        self.stdin_closer.cancel();
        if let Some(pipe) = self.stdin_pipe.get() {
            stdin::close(pipe).await;
        }

        self.stdout_streams.close_all();
        self.stdout_closer.cancel();

        self.stderr_streams.close_all();
        self.stderr_closer.cancel();

        debug!("Releasing dispatch pool ({} workers idle)", self.pool.available());
        self.pool.release();
        self.scope.cancel();

        debug!("Waiting for {} background tasks", self.tasks.len());

        let result = match self.config.max_wait_time() {
            None => self.tasks.wait().await,
            Some(limit) => {
                let bounded = timeout(limit, async {
                    let joined = self.tasks.wait().await;
                    let _ = self.exit_outcome().await;
                    joined
                })
                .await;
                match bounded {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Process '{}' did not stop within {:?}", self.name(), limit);
                        Err(ProcError::DeadlineExceeded(limit))
                    }
                }
            }
        };

        self.lock_state().lifecycle = Lifecycle::Closed;
        debug!("Shutdown of '{}' complete", self.name());
        result
    }

    /// Child pid, `None` before a successful start
    pub fn pid(&self) -> Option<u32> {
        self.lock_state().pid
    }

    /// The configured command
    pub fn name(&self) -> &str {
        &self.config.command
    }

    /// The command followed by its arguments
    pub fn cmdline(&self) -> Vec<String> {
        std::iter::once(&self.config.command)
            .chain(&self.config.args)
            .cloned()
            .collect()
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Exit code, [`EXIT_CODE_UNKNOWN`] until exited or when killed by a signal
    pub fn exit_code(&self) -> i32 {
        self.exit_state().map_or(EXIT_CODE_UNKNOWN, |state| state.code())
    }

    /// Recorded exit, `None` while running or when the wait itself failed
    pub fn exit_state(&self) -> Option<ExitState> {
        match &*self.exit.borrow() {
            Some(Ok(state)) => Some(*state),
            _ => None,
        }
    }

    /// When the child was spawned
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().created_at
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let lifecycle = self.lock_state().lifecycle;
        if lifecycle == Lifecycle::Running && self.has_exited() {
            Lifecycle::Exited
        } else {
            lifecycle
        }
    }

    fn stats(&self) -> Option<&Arc<dyn ProcessStats>> {
        self.stats.get()
    }

    pub fn cwd(&self) -> Result<PathBuf> {
        self.stats().map_or(Ok(PathBuf::new()), |s| s.cwd())
    }

    pub fn exe(&self) -> Result<PathBuf> {
        self.stats().map_or(Ok(PathBuf::new()), |s| s.exe())
    }

    /// False before start and once the exit has been recorded
    pub fn is_running(&self) -> Result<bool> {
        if self.pid().is_none() || self.has_exited() {
            return Ok(false);
        }
        self.stats().map_or(Ok(true), |s| s.is_running())
    }

    pub fn memory_info(&self) -> Result<MemoryInfo> {
        self.stats()
            .map_or(Ok(MemoryInfo::default()), |s| s.memory_info())
    }

    pub fn cpu_percent(&self) -> Result<f64> {
        self.stats().map_or(Ok(0.0), |s| s.cpu_percent())
    }

    pub fn io_counters(&self) -> Result<IoCounters> {
        self.stats()
            .map_or(Ok(IoCounters::default()), |s| s.io_counters())
    }

    pub fn num_connections(&self) -> Result<usize> {
        self.stats().map_or(Ok(0), |s| s.num_connections())
    }

    pub fn num_fds(&self) -> Result<usize> {
        self.stats().map_or(Ok(0), |s| s.num_fds())
    }

    pub fn num_threads(&self) -> Result<usize> {
        self.stats().map_or(Ok(0), |s| s.num_threads())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.scope.cancel();
        self.stdin_streams.close_all();
        self.stdout_streams.close_all();
        self.stderr_streams.close_all();
    }
}

async fn log_failure<F>(direction: Direction, task: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    task.await.map_err(|e| {
        error!("{} fan-out failed: {}", direction, e);
        e
    })
}
