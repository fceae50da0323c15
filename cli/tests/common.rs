//! Test utilities for CLI crate integration tests.
#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};

/// Run the given future with a timeout, failing the test if it elapses.
///
/// # Panics
///
/// Panics if the timeout elapses before the future completes.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .expect("test timed out")
}

/// In-memory console end; large enough that small outputs never block
pub fn console_pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(64 * 1024)
}

/// Read everything written to the other end of a console pipe
pub async fn read_all(mut reader: DuplexStream) -> String {
    let mut out = String::new();
    reader.read_to_string(&mut out).await.expect("read console");
    out
}
