//! Stdin multiplexing: many input subscribers, one child stdin

use crate::channel::Stream;
use crate::{ProcError, Result};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The child's stdin shared by every writer; `None` once closed
pub(crate) type SharedWriter<W> = Arc<Mutex<Option<W>>>;

pub(crate) fn shared<W>(writer: W) -> SharedWriter<W> {
    Arc::new(Mutex::new(Some(writer)))
}

/// Forward everything sent on `stream` to the shared writer.
///
/// Each chunk is written and flushed while holding the writer lock, so chunks
/// from different subscribers never interleave. Returns `Ok` when the stream
/// closes, the scope is cancelled or `closer` fires. A write failure is tagged
/// with the subscriber name and ends only this pump.
pub(crate) async fn pump<W>(
    name: String,
    stream: Arc<Stream>,
    writer: SharedWriter<W>,
    scope: CancellationToken,
    closer: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let chunk = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            _ = closer.cancelled() => return Ok(()),
            chunk = stream.recv() => match chunk {
                Some(chunk) => chunk,
                None => {
                    debug!("stdin subscriber '{}' closed", name);
                    return Ok(());
                }
            },
        };

        tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            _ = closer.cancelled() => return Ok(()),
            written = write_chunk(&writer, &chunk) => {
                written.map_err(|source| ProcError::Pipe {
                    name: name.clone(),
                    source,
                })?;
            }
        }
    }
}

async fn write_chunk<W>(writer: &SharedWriter<W>, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(pipe) => {
            pipe.write_all(chunk).await?;
            pipe.flush().await
        }
        None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed")),
    }
}

/// Drop the writer so the child sees EOF
pub(crate) async fn close<W>(writer: &SharedWriter<W>) {
    if writer.lock().await.take().is_some() {
        debug!("Closed child stdin");
    }
}
