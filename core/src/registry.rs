//! Per-direction subscriber registries

use crate::channel::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// One of the child's standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Stdin,
    Stdout,
    Stderr,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Stdin => "stdin",
            Direction::Stdout => "stdout",
            Direction::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named streams bound to one direction.
///
/// Whether the direction is enabled is fixed at construction; a disabled
/// registry never hands out streams. The supervisor only mutates a registry
/// before the child starts, after that it is read through snapshots.
pub(crate) struct StreamRegistry {
    direction: Direction,
    enabled: bool,
    capacity: usize,
    streams: Mutex<BTreeMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    pub(crate) fn new(direction: Direction, enabled: bool, capacity: usize) -> Self {
        Self {
            direction,
            enabled,
            capacity,
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Stream>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a named stream; `None` when the direction is disabled.
    ///
    /// Binding a name twice replaces the earlier stream, which is closed so
    /// that its holder does not wait forever.
    pub(crate) fn bind(&self, name: &str) -> Option<Arc<Stream>> {
        if !self.enabled {
            debug!("{} is not enabled, not binding '{}'", self.direction, name);
            return None;
        }

        let stream = Arc::new(Stream::new(self.capacity));
        if let Some(previous) = self.lock().insert(name.to_string(), Arc::clone(&stream)) {
            debug!("Replacing {} subscriber '{}'", self.direction, name);
            previous.close();
        }
        debug!("Bound {} subscriber '{}'", self.direction, name);
        Some(stream)
    }

    /// Snapshot of the bound subscribers, ordered by name
    pub(crate) fn subscribers(&self) -> Vec<(String, Arc<Stream>)> {
        self.lock()
            .iter()
            .map(|(name, stream)| (name.clone(), Arc::clone(stream)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Close every bound stream
    pub(crate) fn close_all(&self) {
        for stream in self.lock().values() {
            stream.close();
        }
    }
}
