//! Fan-out of the child's output to named subscribers
//!
//! Output is split into lines by [`LineReader`]. Every line is copied once per
//! subscriber into that subscriber's bounded backlog, which one delivery
//! worker from the shared [`WorkerPool`] drains in order. A line that cannot
//! be delivered before its deadline, or that finds the backlog full, is
//! dropped for that subscriber only, so a stalled consumer never holds up the
//! reader or the other consumers.

use crate::channel::Stream;
use crate::config::ProcessConfig;
use crate::registry::Direction;
use crate::{ProcError, Result};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Splits a byte stream into lines with a bounded line length.
///
/// The newline is not part of the yielded chunk and a trailing `\r` is
/// stripped. Bytes after the last newline are yielded as a final line at EOF.
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    max_line_size: usize,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R, line_buffer_size: usize, max_line_size: usize) -> Self {
        Self {
            inner: BufReader::with_capacity(line_buffer_size.max(1), reader),
            max_line_size,
            pending: Vec::new(),
        }
    }

    /// Next line, `None` at EOF.
    ///
    /// Cancel safe: a partially read line is kept for the next call.
    pub(crate) async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let (segment, found) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i, true),
                None => (available.len(), false),
            };
            if self.pending.len() + segment > self.max_line_size {
                let limit = self.max_line_size;
                self.pending.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds maximum size of {} bytes", limit),
                ));
            }
            self.pending.extend_from_slice(&available[..segment]);

            if found {
                self.inner.consume(segment + 1);
                return Ok(Some(self.take_line()));
            }
            self.inner.consume(segment);
        }
    }

    fn take_line(&mut self) -> Vec<u8> {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Bounded executor with non-blocking submission
#[derive(Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Run `task` on a free worker, failing immediately when none is free.
    ///
    /// `name` identifies the subscriber in the returned error.
    pub(crate) fn try_spawn<F>(&self, name: &str, task: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(ProcError::PoolSaturated {
                    name: name.to_string(),
                })
            }
            Err(TryAcquireError::Closed) => {
                return Err(ProcError::PoolReleased {
                    name: name.to_string(),
                })
            }
        };
        Ok(tokio::spawn(async move {
            task.await;
            drop(permit);
        }))
    }

    /// Reject further submissions; running tasks are left to finish
    pub(crate) fn release(&self) {
        self.permits.close();
    }

    pub(crate) fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A line waiting in a subscriber's backlog
struct Pending {
    chunk: Vec<u8>,
    deadline: Instant,
}

/// Backlog and delivery worker of one subscriber
struct Lane {
    name: String,
    backlog: mpsc::Sender<Pending>,
    worker: JoinHandle<()>,
}

enum Delivery {
    Sent,
    Closed,
    TimedOut,
    Cancelled,
}

/// Reads one output direction and broadcasts every line
pub(crate) struct FanOut {
    direction: Direction,
    subscribers: Vec<(String, Arc<Stream>)>,
    pool: WorkerPool,
    send_timeout: Duration,
    backlog: usize,
    line_buffer_size: usize,
    max_line_size: usize,
    scope: CancellationToken,
    closer: CancellationToken,
}

impl FanOut {
    /// `closer` stops the reader without cancelling the whole scope
    pub(crate) fn new(
        direction: Direction,
        subscribers: Vec<(String, Arc<Stream>)>,
        pool: WorkerPool,
        config: &ProcessConfig,
        scope: CancellationToken,
        closer: CancellationToken,
    ) -> Self {
        Self {
            direction,
            subscribers,
            pool,
            send_timeout: config.send_timeout_duration(),
            backlog: config.dispatch_backlog,
            line_buffer_size: config.line_buffer_size,
            max_line_size: config.max_line_size,
            scope,
            closer,
        }
    }

    /// Read until EOF, cancellation or failure, then close every subscriber.
    ///
    /// EOF, cancellation of the scope and closing of the pipe are clean
    /// stops. A read failure or a worker the pool cannot provide ends the
    /// fan-out with an error.
    pub(crate) async fn run<R>(self, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lanes = Vec::with_capacity(self.subscribers.len());
        let outcome = match self.open_lanes(&mut lanes) {
            Ok(()) => self.read(reader, &lanes).await,
            Err(e) => Err(e),
        };
        self.finish(lanes).await;
        outcome
    }

    fn open_lanes(&self, lanes: &mut Vec<Lane>) -> Result<()> {
        for (name, stream) in &self.subscribers {
            let (backlog, pending) = mpsc::channel(self.backlog);
            let worker = self.pool.try_spawn(
                name,
                drain(
                    self.direction,
                    name.clone(),
                    Arc::clone(stream),
                    pending,
                    self.scope.clone(),
                ),
            )?;
            lanes.push(Lane {
                name: name.clone(),
                backlog,
                worker,
            });
        }
        Ok(())
    }

    async fn read<R>(&self, reader: R, lanes: &[Lane]) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = LineReader::new(reader, self.line_buffer_size, self.max_line_size);
        loop {
            let line = tokio::select! {
                biased;
                _ = self.scope.cancelled() => {
                    debug!("{} fan-out cancelled", self.direction);
                    return Ok(());
                }
                _ = self.closer.cancelled() => {
                    debug!("{} pipe closed", self.direction);
                    return Ok(());
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(chunk)) => self.submit(lanes, chunk),
                Ok(None) => {
                    debug!("{} reached EOF", self.direction);
                    return Ok(());
                }
                Err(source) => {
                    return Err(ProcError::Read {
                        direction: self.direction,
                        source,
                    })
                }
            }
        }
    }

    /// Queue one copy of `chunk` per subscriber without waiting on any of them
    fn submit(&self, lanes: &[Lane], chunk: Vec<u8>) {
        trace!(
            "{} chunk of {} bytes to {} subscribers",
            self.direction,
            chunk.len(),
            lanes.len()
        );
        let deadline = Instant::now() + self.send_timeout;
        for lane in lanes {
            let pending = Pending {
                chunk: chunk.clone(),
                deadline,
            };
            match lane.backlog.try_send(pending) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!(
                    "{} subscriber '{}' backlog full, chunk dropped",
                    self.direction, lane.name
                ),
                Err(TrySendError::Closed(_)) => trace!(
                    "{} subscriber '{}' worker stopped, chunk dropped",
                    self.direction, lane.name
                ),
            }
        }
    }

    /// Let the workers drain their backlogs, then close the subscriber streams
    async fn finish(&self, lanes: Vec<Lane>) {
        let workers: Vec<(String, JoinHandle<()>)> = lanes
            .into_iter()
            .map(|lane| (lane.name, lane.worker))
            .collect();
        for (name, worker) in workers {
            tokio::select! {
                joined = worker => {
                    if let Err(e) = joined {
                        warn!("{} worker for '{}' failed: {}", self.direction, name, e);
                    }
                }
                _ = self.scope.cancelled() => {}
            }
        }
        for (_, stream) in &self.subscribers {
            stream.close();
        }
    }
}

/// Deliver queued lines to one subscriber in order until the backlog closes.
///
/// Each line races its own deadline, counted from when it was read, so a
/// stalled subscriber's backlog expires within one send timeout.
async fn drain(
    direction: Direction,
    name: String,
    stream: Arc<Stream>,
    mut pending: mpsc::Receiver<Pending>,
    scope: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            next = pending.recv() => next,
        };
        let Some(Pending { chunk, deadline }) = next else {
            break;
        };

        let outcome = tokio::select! {
            biased;
            _ = scope.cancelled() => Delivery::Cancelled,
            sent = stream.send(chunk) => match sent {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            },
            _ = sleep_until(deadline) => Delivery::TimedOut,
        };
        match outcome {
            Delivery::Sent => {}
            Delivery::Closed => trace!("{} subscriber '{}' is closed, chunk dropped", direction, name),
            Delivery::TimedOut => debug!("{} subscriber '{}' timed out, chunk dropped", direction, name),
            Delivery::Cancelled => {
                trace!("{} delivery to '{}' cancelled", direction, name);
                break;
            }
        }
    }
}
