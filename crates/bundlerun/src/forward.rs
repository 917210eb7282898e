//! Stream forwarding between a process stdio stream and a named pipe.
//!
//! Opening a FIFO blocks until the peer opens the other end, and the peer
//! may never show up. The open therefore runs on its own OS thread and is
//! raced against the session's cancellation token; an abandoned open is
//! woken with a non-blocking poke of the other end and whatever it returns
//! is closed unused.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe::{Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::pipe::{self, PipeEnd};

const CHUNK_SIZE: usize = 32 * 1024;
const UNBLOCK_ATTEMPTS: usize = 20;
const UNBLOCK_INTERVAL: Duration = Duration::from_millis(10);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The in-process side of one forwarding session.
pub enum Endpoint {
    /// Bytes flow from this reader into the pipe.
    Source(BoxedReader),
    /// Bytes flow from the pipe into this writer.
    Sink(BoxedWriter),
}

/// Errors from a forwarding session.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Exactly one of input or output must be supplied")]
    InvalidArgument,

    #[error("Failed to open pipe {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to read while forwarding {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write while forwarding {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Forwarding through {path} cancelled")]
    Cancelled { path: PathBuf },
}

/// Forward bytes between `pipe_path` and exactly one of `input`/`output`.
///
/// With `input` the pipe is opened write-only and `input` is copied into
/// it; with `output` the pipe is opened read-only and copied into `output`,
/// flushing after every chunk. Returns the number of bytes copied once the
/// source hits EOF.
///
/// Cancellation is observed both while waiting for the peer to open the
/// pipe and during the copy. A failed write to `output` (for example
/// `EPIPE` when stdout feeds `head`) ends forwarding and closes the pipe,
/// so the writer on the far side gets `EPIPE` instead of blocking.
pub async fn forward<R, W>(
    cancel: &CancellationToken,
    pipe_path: &Path,
    input: Option<R>,
    output: Option<W>,
) -> Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match (input, output) {
        (Some(mut reader), None) => {
            let file = open_cancellable(cancel, pipe_path, PipeEnd::Write).await?;
            let mut sender = Sender::from_file(file).map_err(|source| ForwardError::Open {
                path: pipe_path.to_path_buf(),
                source,
            })?;
            pump(cancel, pipe_path, &mut reader, &mut sender).await
        }
        (None, Some(mut writer)) => {
            let file = open_cancellable(cancel, pipe_path, PipeEnd::Read).await?;
            let mut receiver = Receiver::from_file(file).map_err(|source| ForwardError::Open {
                path: pipe_path.to_path_buf(),
                source,
            })?;
            pump(cancel, pipe_path, &mut receiver, &mut writer).await
        }
        _ => Err(ForwardError::InvalidArgument),
    }
}

/// Run [`forward`] as a task. Failures only stop this one stream and are
/// logged at debug level.
pub fn spawn_forwarder(
    stream: &'static str,
    cancel: CancellationToken,
    pipe_path: PathBuf,
    endpoint: Endpoint,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match endpoint {
            Endpoint::Source(reader) => {
                forward(&cancel, &pipe_path, Some(reader), None::<BoxedWriter>).await
            }
            Endpoint::Sink(writer) => {
                forward(&cancel, &pipe_path, None::<BoxedReader>, Some(writer)).await
            }
        };
        match result {
            Ok(bytes) => debug!(stream, bytes, "Forwarder reached EOF"),
            Err(ForwardError::Cancelled { .. }) => debug!(stream, "Forwarder cancelled"),
            Err(e) => debug!(stream, error = %e, "Forwarder stopped"),
        }
    })
}

async fn open_cancellable(
    cancel: &CancellationToken,
    path: &Path,
    end: PipeEnd,
) -> Result<File, ForwardError> {
    if cancel.is_cancelled() {
        return Err(ForwardError::Cancelled {
            path: path.to_path_buf(),
        });
    }

    let (tx, rx) = oneshot::channel();
    let done = Arc::new(AtomicBool::new(false));
    let thread_done = Arc::clone(&done);
    let thread_path = path.to_path_buf();
    std::thread::Builder::new()
        .name("fifo-open".into())
        .spawn(move || {
            let mut options = OpenOptions::new();
            match end {
                PipeEnd::Read => options.read(true),
                PipeEnd::Write => options.write(true),
            };
            let result = options.open(&thread_path);
            thread_done.store(true, Ordering::Release);
            // Nobody is listening after cancellation; the file closes here.
            let _ = tx.send(result);
        })
        .map_err(|source| ForwardError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    tokio::select! {
        opened = rx => match opened {
            Ok(Ok(file)) => {
                trace!(path = %path.display(), ?end, "Opened named pipe");
                Ok(file)
            }
            Ok(Err(source)) => Err(ForwardError::Open { path: path.to_path_buf(), source }),
            Err(_) => Err(ForwardError::Open {
                path: path.to_path_buf(),
                source: io::Error::other("pipe open thread exited without a result"),
            }),
        },
        () = cancel.cancelled() => {
            release_opener(path, end, &done).await;
            Err(ForwardError::Cancelled { path: path.to_path_buf() })
        }
    }
}

/// Poke the pipe until the abandoned open thread returns, for a bounded
/// number of attempts. A poke that lands before the thread reaches `open()`
/// has no effect, hence the retries.
async fn release_opener(path: &Path, end: PipeEnd, done: &AtomicBool) {
    for _ in 0..UNBLOCK_ATTEMPTS {
        if done.load(Ordering::Acquire) {
            return;
        }
        pipe::unblock(path, end);
        tokio::time::sleep(UNBLOCK_INTERVAL).await;
    }
    if !done.load(Ordering::Acquire) {
        debug!(path = %path.display(), "Pipe open thread still blocked after cancellation");
    }
}

async fn pump<R, W>(
    cancel: &CancellationToken,
    path: &Path,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancelled = || ForwardError::Cancelled {
        path: path.to_path_buf(),
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => return Err(cancelled()),
            read = reader.read(&mut buf) => read.map_err(|source| ForwardError::Read {
                path: path.to_path_buf(),
                source,
            })?,
        };
        if n == 0 {
            return Ok(total);
        }
        let chunk = &buf[..n];
        tokio::select! {
            () = cancel.cancelled() => return Err(cancelled()),
            written = async {
                writer.write_all(chunk).await?;
                writer.flush().await
            } => written.map_err(|source| ForwardError::Write {
                path: path.to_path_buf(),
                source,
            })?,
        }
        total += n as u64;
    }
}
