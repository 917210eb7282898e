//! Named pipes (FIFOs) used to carry stdio across a relaunch.
//!
//! Every pipe gets a fresh path `<dir>/<prefix>-<pid>-<nanos>-<seq>`. The
//! creator owns the path and removes it; [`PipeGuard`] ties that removal to
//! scope so it happens on success, error and cancellation alike.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tracing::{debug, warn};

/// Disambiguates pipes created within the same clock tick.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Which end of a pipe an open call is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

impl PipeEnd {
    pub const fn opposite(self) -> Self {
        match self {
            Self::Read => Self::Write,
            Self::Write => Self::Read,
        }
    }
}

/// Errors from pipe operations.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("Failed to create named pipe {path}: {source}")]
    Creation { path: PathBuf, source: io::Error },

    #[error("Named pipes are not supported here ({path})")]
    UnsupportedPlatform { path: PathBuf },

    #[error("Failed to remove named pipe {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// Create a FIFO in `dir` with owner read/write permissions and return its
/// path.
///
/// If the generated path already exists one retry is made with a fresh
/// timestamp before giving up.
pub fn create(dir: &Path, prefix: &str) -> Result<PathBuf, PipeError> {
    create_with(|| unique_path(dir, prefix))
}

fn create_with(mut next_path: impl FnMut() -> PathBuf) -> Result<PathBuf, PipeError> {
    let path = next_path();
    match make_fifo(&path) {
        Err(Errno::EEXIST) => {
            debug!(path = %path.display(), "Named pipe path taken, retrying");
            let retry = next_path();
            make_fifo(&retry).map_err(|errno| creation_error(retry.clone(), errno))?;
            Ok(retry)
        }
        Err(errno) => Err(creation_error(path, errno)),
        Ok(()) => Ok(path),
    }
}

/// Unlink a pipe. A path that is already gone counts as removed.
pub fn remove(path: &Path) -> Result<(), PipeError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PipeError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Wake a thread blocked in `open()` for `pending` on this FIFO by briefly
/// opening the other end without blocking. Returns whether the poke
/// succeeded; a write-side poke fails with `ENXIO` while no reader is
/// waiting yet.
pub fn unblock(path: &Path, pending: PipeEnd) -> bool {
    let mut options = OpenOptions::new();
    match pending.opposite() {
        PipeEnd::Read => options.read(true),
        PipeEnd::Write => options.write(true),
    };
    options
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .is_ok()
}

/// Owns a created FIFO and removes it when dropped.
#[derive(Debug)]
pub struct PipeGuard {
    path: PathBuf,
}

impl PipeGuard {
    pub fn create(dir: &Path, prefix: &str) -> Result<Self, PipeError> {
        let path = create(dir, prefix)?;
        debug!(path = %path.display(), "Created named pipe");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipeGuard {
    fn drop(&mut self) {
        if let Err(e) = remove(&self.path) {
            warn!(error = %e, "Named pipe left behind");
        }
    }
}

fn unique_path(dir: &Path, prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{prefix}-{}-{nanos}-{seq}", std::process::id()))
}

fn make_fifo(path: &Path) -> nix::Result<()> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
}

fn creation_error(path: PathBuf, errno: Errno) -> PipeError {
    match errno {
        Errno::ENOSYS | Errno::EOPNOTSUPP => PipeError::UnsupportedPlatform { path },
        errno => PipeError::Creation {
            path,
            source: io::Error::from(errno),
        },
    }
}
